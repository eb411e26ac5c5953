//! Service gateway: resolves a service name to one remote provider.
//!
//! Providers are recorded per (peer, service name). A name may be served by
//! several peers; `resolve` picks one of them uniformly at random on every
//! call, with no stickiness. The map is a `DashMap`, so resolves run
//! concurrently with the discovery side feeding `consume` and `cleanup`.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;

use tether_core::NodeId;

/// What a remote node told us about one of its services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMetadata {
    /// Where the service accepts connections.
    pub endpoints: Vec<SocketAddr>,
    /// Protocol version the provider speaks.
    pub version: u32,
    /// Protocol name, e.g. `tether.node`.
    pub protocol: String,
}

#[derive(Debug, Clone)]
struct RemoteService {
    peer: NodeId,
    info: ServiceMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("service {0:?} is not available")]
    NotFound(String),
}

/// Name-keyed multi-map of remote providers.
#[derive(Clone, Default)]
pub struct ServiceGateway {
    services: Arc<DashMap<String, Vec<RemoteService>>>,
}

impl ServiceGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` provides `name`. A repeat for the same pair
    /// replaces the previous metadata.
    pub fn consume(&self, peer: NodeId, name: &str, info: ServiceMetadata) {
        let mut providers = self.services.entry(name.to_string()).or_default();
        match providers.iter_mut().find(|s| s.peer == peer) {
            Some(existing) => existing.info = info,
            None => providers.push(RemoteService { peer, info }),
        }

        tracing::debug!(
            service = name,
            peer = %peer.short(),
            providers = providers.len(),
            "remote service published"
        );
    }

    /// Forget that `peer` provides `name`. No-op if it never did.
    pub fn cleanup(&self, peer: NodeId, name: &str) {
        let now_empty = match self.services.get_mut(name) {
            Some(mut providers) => {
                let before = providers.len();
                providers.retain(|s| s.peer != peer);
                if providers.len() != before {
                    tracing::debug!(service = name, peer = %peer.short(), "remote service withdrawn");
                }
                providers.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.services.remove_if(name, |_, providers| providers.is_empty());
        }
    }

    /// Forget every service `peer` published. Returns how many were removed.
    pub fn cleanup_peer(&self, peer: NodeId) -> usize {
        let mut removed = 0;
        self.services.retain(|_, providers| {
            let before = providers.len();
            providers.retain(|s| s.peer != peer);
            removed += before - providers.len();
            !providers.is_empty()
        });

        if removed > 0 {
            tracing::debug!(peer = %peer.short(), removed, "peer services withdrawn");
        }
        removed
    }

    /// Pick one live provider of `name` at random.
    pub fn resolve(&self, name: &str) -> Result<ServiceMetadata, GatewayError> {
        // Clone under the shard lock; choose after releasing it.
        let candidates: Vec<ServiceMetadata> = self
            .services
            .get(name)
            .map(|providers| providers.iter().map(|s| s.info.clone()).collect())
            .unwrap_or_default();

        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    /// Peers currently providing `name`.
    pub fn providers(&self, name: &str) -> Vec<NodeId> {
        self.services
            .get(name)
            .map(|providers| providers.iter().map(|s| s.peer).collect())
            .unwrap_or_default()
    }

    /// Names with at least one provider.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Total (peer, name) entries.
    pub fn len(&self) -> usize {
        self.services.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
