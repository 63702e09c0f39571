//! Joint-side probe pairing: a mismatched rand kills the circuit.
//!
//! Two raw mesh endpoints pose as the entry- and relay-side legs of one
//! session at a joint. The first probe carries the correct session digest,
//! the second a corrupted one; the joint must disconnect both legs and
//! drop the session.

use std::time::Duration;

use whitenoise_integration_tests::{eventually, TestMesh};
use whitenoise_transport::cbor;
use whitenoise_transport::messages::{self, Ack, ProbeSignal, Relay, RelayKind};
use whitenoise_transport::{FramedStream, Host, Protocol};
use whitenoise_types::{PeerId, ServiceMode, SessionId, SessionRole};

async fn open_joint_leg(
    host: &std::sync::Arc<whitenoise_transport::mem::MemHost>,
    joint: PeerId,
    session_id: &SessionId,
) -> FramedStream {
    let mut stream = host
        .open_stream(joint, Protocol::Relay)
        .await
        .expect("open relay stream");
    stream
        .write_msg(&messages::new_wake().expect("wake").encode().expect("encode"))
        .await
        .expect("write wake");
    stream
        .write_msg(
            &messages::new_set_session(session_id, SessionRole::Joint)
                .expect("set-session")
                .encode()
                .expect("encode"),
        )
        .await
        .expect("write set-session");
    stream
}

async fn read_ack(
    rx: &mut tokio::sync::mpsc::Receiver<whitenoise_transport::IncomingStream>,
) -> Ack {
    let mut incoming = rx.recv().await.expect("ack stream");
    let frame = incoming.stream.read_msg().await.expect("ack frame");
    Ack::decode(&frame).expect("ack decode")
}

#[tokio::test]
async fn mismatched_probe_disconnects_both_legs() {
    let mesh = TestMesh::new();
    let joint = mesh.spawn_node(30, ServiceMode::Server, &[]);
    let session_id = SessionId::from("probe-mismatch-session");

    let left = mesh.network.host(PeerId([101u8; 32]));
    let right = mesh.network.host(PeerId([102u8; 32]));
    let mut left_acks = left.register_protocol(Protocol::Ack);
    let mut right_acks = right.register_protocol(Protocol::Ack);

    let mut left_stream = open_joint_leg(&left, joint.peer_id(), &session_id).await;
    assert!(read_ack(&mut left_acks).await.result);
    let mut right_stream = open_joint_leg(&right, joint.peer_id(), &session_id).await;
    assert!(read_ack(&mut right_acks).await.result);

    // Correct probe from the left leg.
    left_stream
        .write_msg(
            &messages::new_probe(&session_id)
                .expect("probe")
                .encode()
                .expect("encode"),
        )
        .await
        .expect("write probe");

    // Corrupted probe from the right leg.
    let bad = ProbeSignal {
        session_id: session_id.clone(),
        rand: vec![0u8; 32],
    };
    let forged = Relay {
        id: "forged-probe".to_string(),
        kind: RelayKind::Probe,
        data: cbor::to_vec(&bad).expect("encode probe payload"),
    };
    right_stream
        .write_msg(&forged.encode().expect("encode"))
        .await
        .expect("write forged probe");

    // Both legs observe the teardown.
    for stream in [&mut left_stream, &mut right_stream] {
        let frame = stream.read_msg().await.expect("teardown frame");
        let relay = Relay::decode(&frame).expect("decode");
        assert_eq!(relay.kind, RelayKind::Disconnect);
    }

    let removed = eventually(Duration::from_secs(1), || {
        !joint.node.service().relay().has_session(&session_id)
    })
    .await;
    assert!(removed, "joint kept the session after probe mismatch");
}

#[tokio::test]
async fn matching_probes_emit_success_on_both_legs() {
    let mesh = TestMesh::new();
    let joint = mesh.spawn_node(31, ServiceMode::Server, &[]);
    let session_id = SessionId::from("probe-match-session");

    let left = mesh.network.host(PeerId([103u8; 32]));
    let right = mesh.network.host(PeerId([104u8; 32]));
    let mut left_acks = left.register_protocol(Protocol::Ack);
    let mut right_acks = right.register_protocol(Protocol::Ack);

    let mut left_stream = open_joint_leg(&left, joint.peer_id(), &session_id).await;
    assert!(read_ack(&mut left_acks).await.result);
    let mut right_stream = open_joint_leg(&right, joint.peer_id(), &session_id).await;
    assert!(read_ack(&mut right_acks).await.result);

    let probe = messages::new_probe(&session_id)
        .expect("probe")
        .encode()
        .expect("encode");
    left_stream.write_msg(&probe).await.expect("left probe");
    right_stream.write_msg(&probe).await.expect("right probe");

    for stream in [&mut left_stream, &mut right_stream] {
        let frame = stream.read_msg().await.expect("success frame");
        let relay = Relay::decode(&frame).expect("decode");
        assert_eq!(relay.kind, RelayKind::Success);
    }
}
