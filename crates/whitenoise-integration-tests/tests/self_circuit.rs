//! Two-hop self-circuit: caller and answer registered with the same proxy.
//!
//! The proxy detects that it hosts both endpoints and serves as entry and
//! exit at once, skipping the gossip round.

use std::time::Duration;

use whitenoise_integration_tests::{wait_for_answer_conn, TestMesh};
use whitenoise_types::ServiceMode;

#[tokio::test]
async fn self_circuit_round_trips_bytes() {
    let mesh = TestMesh::new();
    let proxy = mesh.spawn_node(10, ServiceMode::Server, &[]);
    let caller = mesh.spawn_node(11, ServiceMode::Client, &[]);
    let answer = mesh.spawn_node(12, ServiceMode::Client, &[]);

    caller
        .client
        .register(proxy.peer_id())
        .await
        .expect("caller registers");
    answer
        .client
        .register(proxy.peer_id())
        .await
        .expect("answer registers");

    let (caller_conn, session_id) = caller
        .client
        .dial(&answer.whitenoise_id())
        .await
        .expect("dial completes");

    let answer_conn = wait_for_answer_conn(&answer.client, &session_id, Duration::from_secs(5))
        .await
        .expect("answer handshake completes");

    // End-to-end identities authenticated by the handshake.
    assert_eq!(caller_conn.remote_whitenoise_id(), answer.whitenoise_id());
    assert_eq!(answer_conn.remote_whitenoise_id(), caller.whitenoise_id());

    let written = caller_conn.write(b"hello").await.expect("write");
    assert_eq!(written, 5);

    let mut buf = [0u8; 16];
    let n = answer_conn.read(&mut buf).await.expect("read");
    assert_eq!(n, 5);
    assert_eq!(&buf[..n], b"hello");
}

#[tokio::test]
async fn dial_fails_without_registration() {
    let mesh = TestMesh::new();
    let _proxy = mesh.spawn_node(20, ServiceMode::Server, &[]);
    let caller = mesh.spawn_node(21, ServiceMode::Client, &[]);
    let answer = mesh.spawn_node(22, ServiceMode::Client, &[]);

    // No register() call: the dial has no entry to go through.
    let result = caller.client.dial(&answer.whitenoise_id()).await;
    assert!(result.is_err());
}
