//! Proxy registration lifecycle and bootstrap peer listings.

use whitenoise_integration_tests::TestMesh;
use whitenoise_protocol::ProtocolError;
use whitenoise_types::{NodeInfo, PeerId, ServiceMode};

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let mesh = TestMesh::new();
    let proxy = mesh.spawn_node(60, ServiceMode::Server, &[]);
    let client = mesh.spawn_node(61, ServiceMode::Client, &[]);

    client
        .client
        .register(proxy.peer_id())
        .await
        .expect("first registration");
    assert_eq!(proxy.node.service().proxy().client_count(), 1);

    let second = client.client.register(proxy.peer_id()).await;
    let Err(ProtocolError::Rejected(reason)) = second else {
        unreachable!("second registration must be rejected");
    };
    assert_eq!(reason, "proxy already");
}

#[tokio::test]
async fn boot_node_serves_peer_listings() {
    let mesh = TestMesh::new();
    let known = [PeerId([71u8; 32]), PeerId([72u8; 32]), PeerId([73u8; 32])];
    let boot = mesh.spawn_node(70, ServiceMode::Boot, &known);
    let client = mesh.spawn_node(74, ServiceMode::Client, &[]);

    let peers = client
        .client
        .get_mainnet_peers(boot.peer_id(), 2)
        .await
        .expect("peer listing");
    assert_eq!(peers.len(), 2);
    for NodeInfo { id, .. } in &peers {
        assert!(known.contains(id));
    }

    let all = client
        .client
        .get_mainnet_peers(boot.peer_id(), 100)
        .await
        .expect("peer listing");
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn boot_node_refuses_circuit_requests() {
    let mesh = TestMesh::new();
    let boot = mesh.spawn_node(80, ServiceMode::Boot, &[]);
    let client = mesh.spawn_node(81, ServiceMode::Client, &[]);

    let result = client.client.register(boot.peer_id()).await;
    assert!(matches!(result, Err(ProtocolError::Rejected(_))));
}

#[tokio::test]
async fn unregister_evicts_client() {
    let mesh = TestMesh::new();
    let proxy = mesh.spawn_node(90, ServiceMode::Server, &[]);
    let client = mesh.spawn_node(91, ServiceMode::Client, &[]);

    client
        .client
        .register(proxy.peer_id())
        .await
        .expect("register");
    assert_eq!(proxy.node.service().proxy().client_count(), 1);

    client.client.unregister().await;
    let cleared = whitenoise_integration_tests::eventually(
        std::time::Duration::from_secs(1),
        || proxy.node.service().proxy().client_count() == 0,
    )
    .await;
    assert!(cleared, "proxy kept the client after unregister");
}
