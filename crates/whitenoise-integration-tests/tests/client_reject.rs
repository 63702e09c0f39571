//! Client-mode session filter: a client accepts only Answer duty.

use whitenoise_integration_tests::TestMesh;
use whitenoise_transport::messages::{self, Ack};
use whitenoise_transport::{Host, Protocol};
use whitenoise_types::{PeerId, ServiceMode, SessionId, SessionRole};

#[tokio::test]
async fn client_rejects_relay_role() {
    let mesh = TestMesh::new();
    let client = mesh.spawn_node(50, ServiceMode::Client, &[]);

    let prober = mesh.network.host(PeerId([110u8; 32]));
    let mut acks = prober.register_protocol(Protocol::Ack);

    let session_id = SessionId::from("drafting-attempt");
    let mut stream = prober
        .open_stream(client.peer_id(), Protocol::Relay)
        .await
        .expect("open relay stream");
    stream
        .write_msg(&messages::new_wake().expect("wake").encode().expect("encode"))
        .await
        .expect("write wake");
    stream
        .write_msg(
            &messages::new_set_session(&session_id, SessionRole::Relay)
                .expect("set-session")
                .encode()
                .expect("encode"),
        )
        .await
        .expect("write set-session");

    let mut incoming = acks.recv().await.expect("ack stream");
    let ack = Ack::decode(&incoming.stream.read_msg().await.expect("ack frame")).expect("decode");
    assert!(!ack.result);
    assert_eq!(ack.data, b"reject");
    assert_eq!(client.node.service().relay().session_count(), 0);
}

#[tokio::test]
async fn client_accepts_answer_role() {
    let mesh = TestMesh::new();
    let client = mesh.spawn_node(51, ServiceMode::Client, &[]);

    let exit = mesh.network.host(PeerId([111u8; 32]));
    let mut acks = exit.register_protocol(Protocol::Ack);

    let session_id = SessionId::from("incoming-answer");
    let mut stream = exit
        .open_stream(client.peer_id(), Protocol::Relay)
        .await
        .expect("open relay stream");
    stream
        .write_msg(&messages::new_wake().expect("wake").encode().expect("encode"))
        .await
        .expect("write wake");
    stream
        .write_msg(
            &messages::new_set_session(&session_id, SessionRole::Answer)
                .expect("set-session")
                .encode()
                .expect("encode"),
        )
        .await
        .expect("write set-session");

    let mut incoming = acks.recv().await.expect("ack stream");
    let ack = Ack::decode(&incoming.stream.read_msg().await.expect("ack frame")).expect("decode");
    assert!(ack.result);

    let relay = client.node.service().relay();
    assert_eq!(relay.session_count(), 1);
    let session = relay.get_session(&session_id).expect("session");
    assert_eq!(session.role, SessionRole::Answer);
    // The answer endpoint pre-creates its circuit connection.
    assert!(relay.get_circuit(&session_id).is_some());
}
