//! Announce beacon.
//!
//! One UDP socket does both jobs. It is bound to the discovery endpoint,
//! joined to the group when the group is a multicast address, and shared
//! by a publish task and a receive task. The group may also be a plain
//! unicast address, which is how the tests drive it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tether_core::config::DiscoveryConfig;
use tether_core::wire::MAX_DATAGRAM;
use tether_core::{Announce, NodeId};
use tether_services::Locator;

use super::{if_index, DiscoveryError, PeerTable};

/// Pause after a failed receive before trying again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// A bound, not yet running, beacon.
pub struct Beacon {
    socket: Arc<UdpSocket>,
    node_id: NodeId,
    group: SocketAddr,
    interval: Duration,
    datagram: Vec<u8>,
    peers: Arc<PeerTable>,
}

impl Beacon {
    /// Bind the discovery socket and prepare this node's announce.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(
        settings: &DiscoveryConfig,
        node_id: NodeId,
        endpoints: Vec<SocketAddr>,
        locator: Arc<dyn Locator>,
    ) -> Result<Self, DiscoveryError> {
        let interface_index = if settings.interface.is_empty() {
            0
        } else {
            if_index(&settings.interface)?
        };

        let datagram = Announce::new(node_id, endpoints).encode()?;

        let bind_err = |source| DiscoveryError::Bind {
            addr: settings.bind,
            source,
        };
        let socket = make_socket(settings.bind, settings.group, interface_index).map_err(bind_err)?;
        let socket = UdpSocket::from_std(socket).map_err(bind_err)?;

        tracing::info!(
            node = %node_id.short(),
            bind = %settings.bind,
            group = %settings.group,
            interval_ms = settings.interval().as_millis() as u64,
            "discovery socket bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            node_id,
            group: settings.group,
            interval: settings.interval(),
            datagram,
            peers: PeerTable::new(locator, settings.expiration()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the publish and receive loops.
    pub fn start(self) -> BeaconHandle {
        let publish = tokio::spawn(publish_loop(
            self.socket.clone(),
            self.group,
            self.datagram,
            self.interval,
        ));
        let receive = tokio::spawn(receive_loop(
            self.socket,
            self.node_id,
            self.peers.clone(),
        ));

        BeaconHandle {
            tasks: vec![publish, receive],
            peers: self.peers,
        }
    }
}

/// Owns a running beacon. Dropping it stops everything.
pub struct BeaconHandle {
    tasks: Vec<JoinHandle<()>>,
    peers: Arc<PeerTable>,
}

impl BeaconHandle {
    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Stop both loops and wait for them to finish, then cancel every
    /// expiration timer.
    pub async fn shutdown(mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.peers.shutdown();
        tracing::info!("discovery stopped");
    }

    fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        // The receive loop may still be mid-observe; the table refuses
        // anything that lands after this.
        self.peers.shutdown();
    }
}

impl Drop for BeaconHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn publish_loop(socket: Arc<UdpSocket>, group: SocketAddr, datagram: Vec<u8>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match socket.send_to(&datagram, group).await {
            Ok(n) => tracing::trace!(bytes = n, %group, "announce sent"),
            Err(e) => tracing::warn!(error = %e, %group, "announce send failed"),
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, local: NodeId, peers: Arc<PeerTable>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                tokio::time::sleep(RECV_BACKOFF).await;
                continue;
            }
        };

        let announce = match Announce::decode(&buf[..len]) {
            Ok(a) => a,
            Err(e) => {
                tracing::trace!(%from, error = %e, "dropping malformed announce");
                continue;
            }
        };

        if announce.node_id == local {
            continue;
        }
        peers.observe(announce.node_id, announce.endpoints);
    }
}

/// Create the discovery socket, joined to `group` if it is multicast.
fn make_socket(bind: SocketAddr, group: SocketAddr, interface_index: u32) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if bind.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;

    match group.ip() {
        IpAddr::V4(addr) if addr.is_multicast() => {
            let interface = match bind.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&addr, &interface)?;
            socket.set_multicast_loop_v4(true)?;
            // Stay on the local link.
            socket.set_multicast_ttl_v4(1)?;
        }
        IpAddr::V6(addr) if addr.is_multicast() => {
            socket.join_multicast_v6(&addr, interface_index)?;
            socket.set_multicast_if_v6(interface_index)?;
            socket.set_multicast_hops_v6(1)?;
        }
        _ => {}
    }

    Ok(socket.into())
}
