//! Full five-hop circuit across six nodes, and teardown propagation.

use std::time::Duration;

use whitenoise_integration_tests::{eventually, FiveHopMesh};
use whitenoise_types::SessionRole;

#[tokio::test]
async fn five_hop_circuit_carries_traffic_both_ways() {
    let mesh = FiveHopMesh::build().await;
    let (caller_conn, answer_conn, session_id) = mesh.dial().await;

    caller_conn.write(b"ping").await.expect("caller write");
    let mut buf = [0u8; 16];
    let n = answer_conn.read(&mut buf).await.expect("answer read");
    assert_eq!(&buf[..n], b"ping");

    answer_conn.write(b"pong").await.expect("answer write");
    let n = caller_conn.read(&mut buf).await.expect("caller read");
    assert_eq!(&buf[..n], b"pong");

    // Each intermediate holds exactly one session, wired through, in its
    // expected role.
    let intermediates = [
        (&mesh.entry, SessionRole::Entry),
        (&mesh.joint, SessionRole::Joint),
        (&mesh.relay, SessionRole::Relay),
        (&mesh.exit, SessionRole::Exit),
    ];
    for (node, role) in intermediates {
        let relay = node.node.service().relay();
        assert_eq!(relay.session_count(), 1, "{role} session count");
        let session = relay.get_session(&session_id).expect("session present");
        assert_eq!(session.role, role);
        assert!(session.is_ready(), "{role} pair incomplete");
    }
}

#[tokio::test]
async fn disconnect_propagates_to_every_hop() {
    let mesh = FiveHopMesh::build().await;
    let (_caller_conn, _answer_conn, session_id) = mesh.dial().await;

    mesh.caller
        .client
        .disconnect_circuit(&session_id)
        .await
        .expect("disconnect");

    let cleared = eventually(Duration::from_millis(200), || {
        [
            &mesh.caller,
            &mesh.entry,
            &mesh.joint,
            &mesh.relay,
            &mesh.exit,
            &mesh.answer,
        ]
        .iter()
        .all(|node| !node.node.service().relay().has_session(&session_id))
    })
    .await;
    assert!(cleared, "session survived teardown on some hop");
}
