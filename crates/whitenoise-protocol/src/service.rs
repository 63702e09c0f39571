//! Service assembly and the caller-side operations.
//!
//! `NoiseService` wires the four managers to one host, claims the protocol
//! handlers appropriate to the node's mode, and exposes the operations an
//! application drives: register with a proxy, request a circuit, fetch
//! peer listings, unregister. Cross-manager references all point one way
//! (command and proxy hold the relay manager); the circuit connections
//! reach back through a weak handle only.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{error, info};
use whitenoise_crypto::{Account, WhiteNoiseID};
use whitenoise_gossip::{GossipBus, PeerDirectory};
use whitenoise_transport::cbor;
use whitenoise_transport::messages::{
    MainNetPeers, NewCircuit, NewProxy, PeersList, Request, RequestKind,
};
use whitenoise_transport::{Host, Protocol};
use whitenoise_types::{
    NodeInfo, PeerId, ServiceMode, SessionId, SessionRole, MAINNET_PEERS_TIMEOUT,
    NEW_CIRCUIT_TIMEOUT, PROXY_LEASE, REGISTER_PROXY_TIMEOUT,
};

use crate::ack::AckRegistry;
use crate::command::CmdManager;
use crate::consumer::GossipConsumer;
use crate::proxy::ProxyManager;
use crate::relay::RelayManager;
use crate::{NodeEvent, ProtocolError, Result};

/// The assembled circuit core for one node.
pub struct NoiseService {
    host: Arc<dyn Host>,
    account: Account,
    mode: ServiceMode,
    acks: Arc<AckRegistry>,
    relay: Arc<RelayManager>,
    cmd: Arc<CmdManager>,
    proxy: Arc<ProxyManager>,
    consumer: Option<Arc<GossipConsumer>>,
    gossip: Option<Arc<dyn GossipBus>>,
    proxy_node: RwLock<Option<PeerId>>,
    events: broadcast::Sender<NodeEvent>,
}

impl NoiseService {
    pub fn new(
        host: Arc<dyn Host>,
        account: Account,
        mode: ServiceMode,
        gossip: Option<Arc<dyn GossipBus>>,
        directory: Option<Arc<dyn PeerDirectory>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let acks = AckRegistry::new(Arc::clone(&host));
        let relay = RelayManager::new(
            Arc::clone(&host),
            mode,
            account.clone(),
            Arc::clone(&acks),
            events.clone(),
        );
        let cmd = CmdManager::new(Arc::clone(&host), Arc::clone(&acks), Arc::clone(&relay));
        let proxy = ProxyManager::new(
            Arc::clone(&host),
            mode,
            Arc::clone(&acks),
            Arc::clone(&relay),
            gossip.clone(),
            directory.clone(),
        );
        let consumer = match (mode, &directory) {
            (ServiceMode::Server, Some(directory)) => Some(GossipConsumer::new(
                Arc::clone(&relay),
                Arc::clone(&proxy),
                Arc::clone(&cmd),
                Arc::clone(directory),
                host.local_peer(),
            )),
            _ => None,
        };

        Arc::new(Self {
            host,
            account,
            mode,
            acks,
            relay,
            cmd,
            proxy,
            consumer,
            gossip,
            proxy_node: RwLock::new(None),
            events,
        })
    }

    /// Claim protocol handlers and start the dispatch tasks for this mode.
    pub fn start(self: &Arc<Self>) {
        info!(peer = %self.host.local_peer(), mode = ?self.mode, "starting noise service");

        // Acks flow in every mode.
        tokio::spawn(
            Arc::clone(&self.acks).run_inbound(self.host.register_protocol(Protocol::Ack)),
        );

        match self.mode {
            ServiceMode::Boot => {
                // Directory service only: peer listings over /proxy.
                tokio::spawn(
                    Arc::clone(&self.proxy)
                        .run_inbound(self.host.register_protocol(Protocol::Proxy)),
                );
            }
            ServiceMode::Client => {
                // Endpoint: relay streams (as Answer) and the client-side
                // proxy callbacks.
                tokio::spawn(
                    Arc::clone(&self.relay)
                        .run_acceptor(self.host.register_protocol(Protocol::Relay)),
                );
                tokio::spawn(
                    Arc::clone(&self.proxy)
                        .run_inbound(self.host.register_protocol(Protocol::Proxy)),
                );
            }
            ServiceMode::Server => {
                tokio::spawn(
                    Arc::clone(&self.relay)
                        .run_acceptor(self.host.register_protocol(Protocol::Relay)),
                );
                tokio::spawn(
                    Arc::clone(&self.cmd)
                        .run_inbound(self.host.register_protocol(Protocol::Cmd)),
                );
                tokio::spawn(
                    Arc::clone(&self.proxy)
                        .run_inbound(self.host.register_protocol(Protocol::Proxy)),
                );
                if let (Some(consumer), Some(gossip)) = (&self.consumer, &self.gossip) {
                    tokio::spawn(Arc::clone(consumer).run(Arc::clone(gossip)));
                }
            }
        }
    }

    // -- caller-side operations --------------------------------------------

    /// Register this node as a hosted client of `proxy`.
    pub async fn register_proxy(&self, proxy: PeerId) -> Result<()> {
        let request = Request::new(
            self.host.local_peer(),
            RequestKind::NewProxy,
            &NewProxy {
                whitenoise_id: self.account.whitenoise_id().to_string(),
                lease_secs: PROXY_LEASE.as_secs(),
            },
        )?;
        let mut stream = self.host.open_stream(proxy, Protocol::Proxy).await?;

        let waiter = self.acks.add_task(&request.req_id);
        if let Err(e) = stream.write_msg(&request.encode()?).await {
            self.acks.delete_task(&request.req_id);
            return Err(e.into());
        }
        let result = self
            .acks
            .wait(&request.req_id, waiter, REGISTER_PROXY_TIMEOUT)
            .await?;
        if !result.ok {
            return Err(ProtocolError::Rejected(
                String::from_utf8_lossy(&result.data).into_owned(),
            ));
        }

        *self.write_proxy_node() = Some(proxy);
        info!(%proxy, "registered with proxy");
        Ok(())
    }

    /// Ask the registered proxy to build a circuit to `remote` under
    /// `session_id`. Completion is observed via the
    /// [`SecureConnEstablished`](NodeEvent) event.
    pub async fn new_circuit(&self, remote: WhiteNoiseID, session_id: &SessionId) -> Result<()> {
        if self.relay.has_session(session_id) {
            return Err(ProtocolError::AlreadyRegistered(format!(
                "circuit {session_id} already exists"
            )));
        }
        let proxy_peer = self
            .read_proxy_node()
            .ok_or(ProtocolError::Unregistered)?;

        let result = self.try_new_circuit(proxy_peer, remote, session_id).await;
        if let Err(e) = &result {
            error!(session = %session_id, "circuit request failed: {e}");
            let _ = self.relay.close_circuit(session_id).await;
            self.proxy.remove_circuit_task(session_id);
        }
        result
    }

    async fn try_new_circuit(
        &self,
        proxy_peer: PeerId,
        remote: WhiteNoiseID,
        session_id: &SessionId,
    ) -> Result<()> {
        // Caller leg to the entry first; the proxy requires the half-open
        // session before it accepts the circuit request.
        self.relay
            .new_session_to_peer(proxy_peer, session_id, SessionRole::Caller, SessionRole::Entry)
            .await?;

        self.relay.add_circuit_caller(session_id, remote);
        self.proxy.add_circuit_task(session_id, remote);

        let request = Request::new(
            self.host.local_peer(),
            RequestKind::NewCircuit,
            &NewCircuit {
                from: self.account.whitenoise_id().hash(),
                to: remote.hash(),
                session_id: session_id.clone(),
            },
        )?;
        let mut stream = self.host.open_stream(proxy_peer, Protocol::Proxy).await?;

        let waiter = self.acks.add_task(&request.req_id);
        if let Err(e) = stream.write_msg(&request.encode()?).await {
            self.acks.delete_task(&request.req_id);
            return Err(e.into());
        }
        let result = self
            .acks
            .wait(&request.req_id, waiter, NEW_CIRCUIT_TIMEOUT)
            .await?;
        if !result.ok {
            return Err(ProtocolError::Rejected(
                String::from_utf8_lossy(&result.data).into_owned(),
            ));
        }
        Ok(())
    }

    /// Fetch up to `max` peer records from a directory node.
    pub async fn get_mainnet_peers(&self, boot: PeerId, max: u32) -> Result<Vec<NodeInfo>> {
        let request = Request::new(
            self.host.local_peer(),
            RequestKind::MainNetPeers,
            &MainNetPeers { max },
        )?;
        let mut stream = self.host.open_stream(boot, Protocol::Proxy).await?;

        let waiter = self.acks.add_task(&request.req_id);
        if let Err(e) = stream.write_msg(&request.encode()?).await {
            self.acks.delete_task(&request.req_id);
            return Err(e.into());
        }
        let result = self
            .acks
            .wait(&request.req_id, waiter, MAINNET_PEERS_TIMEOUT)
            .await?;
        if !result.ok {
            return Err(ProtocolError::Rejected(
                String::from_utf8_lossy(&result.data).into_owned(),
            ));
        }
        let list: PeersList =
            cbor::from_slice(&result.data).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(list.peers)
    }

    /// Notify the hosting proxy that this client is leaving. Best-effort.
    pub async fn unregister(&self) {
        let Some(proxy) = self.read_proxy_node() else {
            return;
        };
        if let Err(e) = self
            .proxy
            .send_unregister(proxy, &self.account.whitenoise_id())
            .await
        {
            error!("unregister notice failed: {e}");
        }
        *self.write_proxy_node() = None;
    }

    // -- accessors ---------------------------------------------------------

    pub fn relay(&self) -> &Arc<RelayManager> {
        &self.relay
    }

    pub fn proxy(&self) -> &Arc<ProxyManager> {
        &self.proxy
    }

    pub fn cmd(&self) -> &Arc<CmdManager> {
        &self.cmd
    }

    pub fn acks(&self) -> &Arc<AckRegistry> {
        &self.acks
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn mode(&self) -> ServiceMode {
        self.mode
    }

    pub fn local_peer(&self) -> PeerId {
        self.host.local_peer()
    }

    pub fn whitenoise_id(&self) -> WhiteNoiseID {
        self.account.whitenoise_id()
    }

    pub fn proxy_peer(&self) -> Option<PeerId> {
        self.read_proxy_node()
    }

    /// Subscribe to circuit lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn read_proxy_node(&self) -> Option<PeerId> {
        match self.proxy_node.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn write_proxy_node(&self) -> std::sync::RwLockWriteGuard<'_, Option<PeerId>> {
        match self.proxy_node.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
