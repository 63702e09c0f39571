//! whitenoise-node: the WhiteNoise overlay daemon.
//!
//! Loads a TOML config, binds a QUIC host, and runs the circuit core in
//! the configured mode until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use whitenoise_crypto::Account;
use whitenoise_gossip::{GossipBus, MemGossip, PeerDirectory, StaticPeerDirectory};
use whitenoise_node::{Node, NodeConfig};
use whitenoise_transport::quic::{QuicConfig, QuicHost};
use whitenoise_types::{NodeInfo, ServiceMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("whitenoise.toml"));
    let config = NodeConfig::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("whitenoise={}", config.log.level).parse()?),
        )
        .init();

    info!(config = %config_path.display(), "whitenoise node starting");

    let account = Account::generate();
    info!(id = %account.whitenoise_id(), peer = %account.peer_id(), "node identity");

    let bind_addr: SocketAddr = ([0, 0, 0, 0], config.network.listen_port).into();
    let host = QuicHost::bind(
        QuicConfig {
            bind_addr,
            ..QuicConfig::default()
        },
        account.peer_id(),
        config.allowlist(),
    )?;
    info!(addr = %host.local_addr(), "listening");

    let directory = StaticPeerDirectory::new();
    for boot in config.bootstrap_peers() {
        match boot.addr.parse::<SocketAddr>() {
            Ok(addr) => {
                host.add_peer(boot.id, addr);
                directory.add_node(NodeInfo {
                    id: boot.id,
                    addrs: vec![boot.addr.clone()],
                });
            }
            Err(e) => warn!(entry = %boot.addr, "skipping bootstrap entry: {e}"),
        }
    }

    let mode = config.network.mode;
    let gossip: Option<Arc<dyn GossipBus>> = match mode {
        ServiceMode::Server => Some(MemGossip::new()),
        _ => None,
    };
    let directory: Option<Arc<dyn PeerDirectory>> = match mode {
        ServiceMode::Client => None,
        _ => Some(directory),
    };

    let _node = Node::start(host, account, mode, gossip, directory);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
