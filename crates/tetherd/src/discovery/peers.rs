//! Peer table: who is announcing, and when each of them goes stale.
//!
//! Every known peer has one expiration timer, a spawned task that sleeps
//! for the expiration period and then asks the table to evict the peer.
//! A fresh announce aborts that timer, arms a new one and bumps the
//! record's generation. Eviction only happens when the generation the
//! timer was armed with is still current, so a timer that loses the race
//! against an announce removes nothing.
//!
//! Timers hold a `Weak` reference. Once the table is shut down or dropped
//! they wake up to nothing and exit. `observe` and `expire` hold the read
//! side of `gate` from their closed check through the notification, and
//! `shutdown` takes the write side, so no join or leave can be reported
//! after `shutdown` returns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use tether_core::NodeId;
use tether_services::Locator;

struct PeerRecord {
    endpoints: Vec<SocketAddr>,
    generation: u64,
    last_seen: Instant,
    timer: AbortHandle,
}

pub struct PeerTable {
    peers: DashMap<NodeId, PeerRecord>,
    locator: Arc<dyn Locator>,
    expiration: Duration,
    next_generation: AtomicU64,
    /// True once shut down.
    gate: RwLock<bool>,
}

impl PeerTable {
    pub fn new(locator: Arc<dyn Locator>, expiration: Duration) -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            locator,
            expiration,
            next_generation: AtomicU64::new(1),
            gate: RwLock::new(false),
        })
    }

    /// Record an announce from `peer`. Must run inside a tokio runtime.
    pub fn observe(self: &Arc<Self>, peer: NodeId, endpoints: Vec<SocketAddr>) {
        let closed = self.gate.read();
        if *closed {
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.arm(peer, generation);

        let joined = match self.peers.entry(peer) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.timer.abort();
                record.timer = timer;
                record.generation = generation;
                record.last_seen = Instant::now();
                if record.endpoints != endpoints {
                    record.endpoints = endpoints.clone();
                    Some(endpoints)
                } else {
                    None
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PeerRecord {
                    endpoints: endpoints.clone(),
                    generation,
                    last_seen: Instant::now(),
                    timer,
                });
                Some(endpoints)
            }
        };

        // Notify with the shard lock released.
        if let Some(endpoints) = joined {
            self.locator.on_join(&peer, &endpoints);
        }
    }

    fn arm(self: &Arc<Self>, peer: NodeId, generation: u64) -> AbortHandle {
        let table: Weak<Self> = Arc::downgrade(self);
        let expiration = self.expiration;
        tokio::spawn(async move {
            tokio::time::sleep(expiration).await;
            if let Some(table) = table.upgrade() {
                table.expire(peer, generation);
            }
        })
        .abort_handle()
    }

    /// Evict `peer` if its record is still at `generation`.
    pub fn expire(&self, peer: NodeId, generation: u64) -> bool {
        let closed = self.gate.read();
        if *closed {
            return false;
        }
        let removed = self
            .peers
            .remove_if(&peer, |_, record| record.generation == generation);

        match removed {
            Some((_, record)) => {
                tracing::debug!(
                    peer = %peer.short(),
                    silent_ms = record.last_seen.elapsed().as_millis() as u64,
                    "peer expired"
                );
                self.locator.on_leave(&peer);
                true
            }
            None => false,
        }
    }

    /// Cancel every timer and forget every peer, without notifying.
    ///
    /// Waits for any `observe` or `expire` already past its closed check.
    pub fn shutdown(&self) {
        let mut closed = self.gate.write();
        *closed = true;
        self.peers.retain(|_, record| {
            record.timer.abort();
            false
        });
    }

    pub fn generation(&self, peer: &NodeId) -> Option<u64> {
        self.peers.get(peer).map(|r| r.generation)
    }

    pub fn endpoints(&self, peer: &NodeId) -> Option<Vec<SocketAddr>> {
        self.peers.get(peer).map(|r| r.endpoints.clone())
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Drop for PeerTable {
    fn drop(&mut self) {
        for record in self.peers.iter() {
            record.timer.abort();
        }
    }
}
