//! The `/cmd` SessionExpand exchange.
//!
//! The exit side picks a relay candidate and asks it, out of band, to
//! extend an existing session to the joint. The exchange is single-use:
//! one command stream, one [`Command`] frame, one ack.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use whitenoise_transport::messages::{self, Ack, Command, CommandKind, SessionExpand};
use whitenoise_transport::{Host, IncomingStream, Protocol};
use whitenoise_types::{PeerId, SessionId, SessionRole, EXPAND_SESSION_TIMEOUT};

use crate::ack::AckRegistry;
use crate::relay::RelayManager;
use crate::{ProtocolError, Result};

/// Requester and handler for session-expand commands.
pub struct CmdManager {
    host: Arc<dyn Host>,
    acks: Arc<AckRegistry>,
    relay: Arc<RelayManager>,
}

impl CmdManager {
    pub fn new(
        host: Arc<dyn Host>,
        acks: Arc<AckRegistry>,
        relay: Arc<RelayManager>,
    ) -> Arc<Self> {
        Arc::new(Self { host, acks, relay })
    }

    /// Ask `relay_peer` to extend `session_id` to `joint`.
    pub async fn expand_session(
        &self,
        relay_peer: PeerId,
        joint: PeerId,
        session_id: &SessionId,
    ) -> Result<()> {
        let mut stream = self.host.open_stream(relay_peer, Protocol::Cmd).await?;
        let cmd = messages::new_session_expand(self.host.local_peer(), session_id, joint)?;

        let waiter = self.acks.add_task(&cmd.command_id);
        if let Err(e) = stream.write_msg(&cmd.encode()?).await {
            self.acks.delete_task(&cmd.command_id);
            return Err(e.into());
        }

        let result = self
            .acks
            .wait(&cmd.command_id, waiter, EXPAND_SESSION_TIMEOUT)
            .await?;
        if result.ok {
            Ok(())
        } else {
            Err(ProtocolError::Rejected(
                String::from_utf8_lossy(&result.data).into_owned(),
            ))
        }
    }

    /// Drain inbound `/cmd` streams: each carries exactly one command.
    pub async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<IncomingStream>) {
        while let Some(mut incoming) = rx.recv().await {
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                let frame = match incoming.stream.read_msg().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("cmd stream read failed: {e}");
                        return;
                    }
                };
                let cmd = match Command::decode(&frame) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!("cmd decode failed: {e}");
                        return;
                    }
                };
                match cmd.kind {
                    CommandKind::SessionExpand => {
                        manager.handle_expand(&cmd, incoming.remote_peer).await;
                    }
                }
            });
        }
    }

    async fn handle_expand(&self, cmd: &Command, from: PeerId) {
        let expand: SessionExpand = match whitenoise_transport::cbor::from_slice(&cmd.data) {
            Ok(expand) => expand,
            Err(e) => {
                warn!("session-expand decode failed: {e}");
                self.acks.spawn_send_ack(
                    from,
                    Ack::reject(&cmd.command_id, "malformed session-expand"),
                );
                return;
            }
        };
        debug!(session = %expand.session_id, joint = %expand.peer_id, "session expand requested");

        let Some(session) = self.relay.get_session(&expand.session_id) else {
            warn!(session = %expand.session_id, "expand for unknown session");
            self.acks
                .spawn_send_ack(from, Ack::reject(&cmd.command_id, "no such session"));
            return;
        };

        // Already wired through: the entry bound this stream directly (the
        // entry-acts-as-relay collapse). Confirm and complete the circuit.
        if session.is_ready() {
            warn!(session = %expand.session_id, "session already ready, confirming");
            self.acks
                .spawn_send_ack(from, Ack::accept(&cmd.command_id, Vec::new()));
            match messages::new_success(&expand.session_id).and_then(|m| m.encode()) {
                Ok(frame) => {
                    if let Err(e) = self.relay.send_relay(&expand.session_id, &frame).await {
                        warn!("success send failed: {e}");
                    }
                }
                Err(e) => warn!("success encode failed: {e}"),
            }
            return;
        }

        match self
            .relay
            .new_session_to_peer(
                expand.peer_id,
                &expand.session_id,
                SessionRole::Relay,
                SessionRole::Joint,
            )
            .await
        {
            Ok(()) => {
                self.acks
                    .spawn_send_ack(from, Ack::accept(&cmd.command_id, Vec::new()));
            }
            Err(e) => {
                warn!(session = %expand.session_id, "expand to joint failed: {e}");
                let _ = self.relay.close_circuit(&expand.session_id).await;
                self.acks.spawn_send_ack(
                    from,
                    Ack::reject(&cmd.command_id, "new session to joint failed"),
                );
            }
        }
    }
}
