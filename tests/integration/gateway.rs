use std::net::SocketAddr;
use std::sync::Arc;

use tether_core::NodeId;
use tether_services::{GatewayError, Locator, PeerDirectory, ServiceGateway, NODE_SERVICE};

fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Resolvers on several runtime threads while peers come and go. Every
/// answer must belong to a peer that joined at some point, and the stable
/// peer must stay resolvable throughout.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resolve_during_membership_churn() {
    let gateway = ServiceGateway::new();
    let directory = Arc::new(PeerDirectory::new(gateway.clone()));

    let stable = NodeId([0xAA; 16]);
    directory.on_join(&stable, &[endpoint(1000)]);

    let churn = {
        let directory = directory.clone();
        tokio::spawn(async move {
            for round in 0..500u16 {
                let peer = NodeId([(round % 8) as u8; 16]);
                directory.on_join(&peer, &[endpoint(2000 + round % 8)]);
                if round % 3 == 0 {
                    tokio::task::yield_now().await;
                }
                directory.on_leave(&peer);
            }
        })
    };

    let mut resolvers = Vec::new();
    for _ in 0..4 {
        let gateway = gateway.clone();
        resolvers.push(tokio::spawn(async move {
            for _ in 0..2000 {
                let meta = gateway.resolve(NODE_SERVICE)?;
                let port = meta.endpoints[0].port();
                assert!(port == 1000 || (2000..2008).contains(&port), "unknown port {port}");
                tokio::task::yield_now().await;
            }
            Ok::<_, GatewayError>(())
        }));
    }

    churn.await.unwrap();
    for resolver in resolvers {
        resolver.await.unwrap().unwrap();
    }

    assert_eq!(directory.peers(), vec![stable]);
    assert_eq!(gateway.providers(NODE_SERVICE), vec![stable]);
    assert_eq!(gateway.resolve(NODE_SERVICE).unwrap().endpoints, vec![endpoint(1000)]);

    directory.on_leave(&stable);
    assert_eq!(
        gateway.resolve(NODE_SERVICE),
        Err(GatewayError::NotFound(NODE_SERVICE.to_string()))
    );
}
