//! Shared fixtures for the multi-node circuit scenarios.
//!
//! Every scenario runs a full mesh of nodes in one process over the
//! in-memory host and gossip bus. Nodes are seeded deterministically so
//! failures reproduce.

use std::sync::Arc;
use std::time::{Duration, Instant};

use whitenoise_crypto::{Account, KeyType};
use whitenoise_gossip::{GossipBus, MemGossip, PeerDirectory, StaticPeerDirectory};
use whitenoise_node::Node;
use whitenoise_sdk::{Connection, WhiteNoiseClient};
use whitenoise_transport::mem::{MemHost, MemNetwork};
use whitenoise_transport::Host;
use whitenoise_types::{NodeInfo, PeerId, ServiceMode, SessionId};

/// One node attached to the test mesh.
pub struct TestNode {
    pub account: Account,
    pub host: Arc<MemHost>,
    pub node: Arc<Node>,
    pub client: WhiteNoiseClient,
}

impl TestNode {
    pub fn peer_id(&self) -> PeerId {
        self.account.peer_id()
    }

    pub fn whitenoise_id(&self) -> String {
        self.account.whitenoise_id().to_string()
    }
}

/// The shared mesh: transport plus the gossip topic.
pub struct TestMesh {
    pub network: Arc<MemNetwork>,
    pub gossip: Arc<MemGossip>,
}

impl TestMesh {
    pub fn new() -> Self {
        Self {
            network: MemNetwork::new(),
            gossip: MemGossip::new(),
        }
    }

    /// Start a node with a deterministic identity. `directory_peers` seeds
    /// its candidate directory (servers only).
    pub fn spawn_node(
        &self,
        seed: u8,
        mode: ServiceMode,
        directory_peers: &[PeerId],
    ) -> TestNode {
        let account =
            Account::from_seed(KeyType::Ed25519, [seed; 32]).expect("deterministic account");
        let host = self.network.host(account.peer_id());

        let directory: Option<Arc<dyn PeerDirectory>> = match mode {
            ServiceMode::Client => None,
            _ => {
                let directory = StaticPeerDirectory::new();
                for peer in directory_peers {
                    directory.add_node(NodeInfo {
                        id: *peer,
                        addrs: Vec::new(),
                    });
                }
                Some(directory)
            }
        };
        let gossip: Option<Arc<dyn GossipBus>> = match mode {
            ServiceMode::Server => Some(Arc::clone(&self.gossip) as Arc<dyn GossipBus>),
            _ => None,
        };

        let node = Node::start(
            Arc::clone(&host) as Arc<dyn Host>,
            account.clone(),
            mode,
            gossip,
            directory,
        );
        let client = WhiteNoiseClient::new(Arc::clone(node.service()));

        TestNode {
            account,
            host,
            node,
            client,
        }
    }
}

impl Default for TestMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll the answer side until its secure session for `session_id` exists.
pub async fn wait_for_answer_conn(
    client: &WhiteNoiseClient,
    session_id: &SessionId,
    deadline: Duration,
) -> Option<Connection> {
    let start = Instant::now();
    loop {
        if let Some(conn) = client.get_circuit(session_id) {
            return Some(conn);
        }
        if start.elapsed() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` passes or the deadline lapses.
pub async fn eventually<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The six-node topology: caller and answer as clients, four servers in
/// between, directories arranged so entry picks the joint and exit picks
/// the relay.
pub struct FiveHopMesh {
    pub mesh: TestMesh,
    pub caller: TestNode,
    pub entry: TestNode,
    pub joint: TestNode,
    pub relay: TestNode,
    pub exit: TestNode,
    pub answer: TestNode,
}

impl FiveHopMesh {
    pub async fn build() -> Self {
        let mesh = TestMesh::new();

        let joint = mesh.spawn_node(3, ServiceMode::Server, &[]);
        let relay = mesh.spawn_node(4, ServiceMode::Server, &[]);
        let entry = mesh.spawn_node(2, ServiceMode::Server, &[joint.peer_id()]);
        let exit = mesh.spawn_node(5, ServiceMode::Server, &[relay.peer_id()]);
        let caller = mesh.spawn_node(1, ServiceMode::Client, &[]);
        let answer = mesh.spawn_node(6, ServiceMode::Client, &[]);

        caller
            .client
            .register(entry.peer_id())
            .await
            .expect("caller registers with entry");
        answer
            .client
            .register(exit.peer_id())
            .await
            .expect("answer registers with exit");

        Self {
            mesh,
            caller,
            entry,
            joint,
            relay,
            exit,
            answer,
        }
    }

    /// Dial from caller to answer and wait for both secure sessions.
    pub async fn dial(&self) -> (Connection, Connection, SessionId) {
        let (caller_conn, session_id) = self
            .caller
            .client
            .dial(&self.answer.whitenoise_id())
            .await
            .expect("dial completes");
        let answer_conn =
            wait_for_answer_conn(&self.answer.client, &session_id, Duration::from_secs(5))
                .await
                .expect("answer secure session comes up");
        (caller_conn, answer_conn, session_id)
    }
}
