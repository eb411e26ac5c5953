//! Locator: where discovery reports peers joining and leaving.

use std::net::SocketAddr;

use dashmap::DashMap;

use tether_core::NodeId;

use crate::gateway::{ServiceGateway, ServiceMetadata};

/// Service name every discovered node is published under.
pub const NODE_SERVICE: &str = "tether.node";
pub const NODE_PROTOCOL_VERSION: u32 = 1;

/// Receives peer membership changes from discovery.
///
/// Called from the discovery tasks; implementations must not block.
pub trait Locator: Send + Sync {
    /// A peer appeared, or re-announced with a different endpoint list.
    fn on_join(&self, peer: &NodeId, endpoints: &[SocketAddr]);
    fn on_leave(&self, peer: &NodeId);
}

/// Tracks live peers and mirrors them into the gateway.
pub struct PeerDirectory {
    peers: DashMap<NodeId, Vec<SocketAddr>>,
    gateway: ServiceGateway,
}

impl PeerDirectory {
    pub fn new(gateway: ServiceGateway) -> Self {
        Self {
            peers: DashMap::new(),
            gateway,
        }
    }

    pub fn endpoints(&self, peer: &NodeId) -> Option<Vec<SocketAddr>> {
        self.peers.get(peer).map(|e| e.value().clone())
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Locator for PeerDirectory {
    fn on_join(&self, peer: &NodeId, endpoints: &[SocketAddr]) {
        let previous = self.peers.insert(*peer, endpoints.to_vec());
        self.gateway.consume(
            *peer,
            NODE_SERVICE,
            ServiceMetadata {
                endpoints: endpoints.to_vec(),
                version: NODE_PROTOCOL_VERSION,
                protocol: NODE_SERVICE.to_string(),
            },
        );
        tracing::info!(
            peer = %peer.short(),
            endpoints = ?endpoints,
            rejoin = previous.is_some(),
            "peer joined"
        );
    }

    fn on_leave(&self, peer: &NodeId) {
        if self.peers.remove(peer).is_some() {
            let withdrawn = self.gateway.cleanup_peer(*peer);
            tracing::info!(peer = %peer.short(), withdrawn, "peer left");
        }
    }
}
