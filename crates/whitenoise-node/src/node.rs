//! Node assembly and maintenance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use whitenoise_crypto::Account;
use whitenoise_gossip::{GossipBus, PeerDirectory};
use whitenoise_protocol::NoiseService;
use whitenoise_transport::Host;
use whitenoise_types::ServiceMode;

/// Cadence of the client-lease eviction sweep.
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One running WhiteNoise node: the circuit core plus its maintenance
/// tasks.
pub struct Node {
    service: Arc<NoiseService>,
    host: Arc<dyn Host>,
}

impl Node {
    /// Assemble and start a node. Boot nodes take no gossip bus; client
    /// nodes take neither bus nor directory.
    pub fn start(
        host: Arc<dyn Host>,
        account: Account,
        mode: ServiceMode,
        gossip: Option<Arc<dyn GossipBus>>,
        directory: Option<Arc<dyn PeerDirectory>>,
    ) -> Arc<Self> {
        let service = NoiseService::new(
            Arc::clone(&host),
            account,
            mode,
            gossip,
            directory.clone(),
        );
        service.start();

        let node = Arc::new(Self {
            service: Arc::clone(&service),
            host,
        });

        if mode == ServiceMode::Server {
            node.spawn_lease_sweep();
        }
        node.spawn_disconnect_watcher();
        if let Some(directory) = directory {
            tokio::spawn(async move { directory.refresh().await });
        }

        info!(peer = %node.service.local_peer(), ?mode, "node started");
        node
    }

    /// The circuit core.
    pub fn service(&self) -> &Arc<NoiseService> {
        &self.service
    }

    /// The node's transport host.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    fn spawn_lease_sweep(self: &Arc<Self>) {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LEASE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let evicted = service.proxy().evict_expired();
                for peer in evicted {
                    for session_id in service.relay().sessions_with_peer(peer) {
                        let _ = service.relay().close_circuit(&session_id).await;
                    }
                }
            }
        });
    }

    /// Peer departures evict hosted clients and tear down their circuits.
    fn spawn_disconnect_watcher(self: &Arc<Self>) {
        let service = Arc::clone(&self.service);
        let mut departures = self.host.subscribe_disconnects();
        tokio::spawn(async move {
            loop {
                let peer = match departures.recv().await {
                    Ok(peer) => peer,
                    Err(RecvError::Lagged(n)) => {
                        debug!("disconnect watcher lagged by {n}");
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };
                debug!(%peer, "peer departed");
                service.proxy().remove_client_by_peer(&peer);
                for session_id in service.relay().sessions_with_peer(peer) {
                    let _ = service.relay().close_circuit(&session_id).await;
                }
            }
        });
    }
}
