//! The ack registry.
//!
//! Every request/response exchange in the overlay (SetSessionId,
//! SessionExpand, proxy requests) correlates on a message id and completes
//! through a one-shot waiter registered here. Replies travel on dedicated
//! one-shot `/ack` streams: open, one [`Ack`] frame, close.
//!
//! Invariants: at most one waiter per id; a delivery with no waiter is a
//! logged no-op; deleting a task closes the waiter's channel so a late
//! delivery is observable to nobody.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use whitenoise_transport::messages::Ack;
use whitenoise_transport::{Host, IncomingStream, Protocol};
use whitenoise_types::PeerId;

use crate::{ProtocolError, Result};

/// Outcome delivered to a waiter.
#[derive(Clone, Debug)]
pub struct AckResult {
    pub ok: bool,
    pub data: Vec<u8>,
}

/// Pending one-shot completions, keyed by request id.
pub struct AckRegistry {
    host: Arc<dyn Host>,
    tasks: DashMap<String, oneshot::Sender<AckResult>>,
}

impl AckRegistry {
    pub fn new(host: Arc<dyn Host>) -> Arc<Self> {
        Arc::new(Self {
            host,
            tasks: DashMap::new(),
        })
    }

    /// Register a waiter for `id`. Must happen before the request is sent,
    /// or the reply can race the registration.
    pub fn add_task(&self, id: &str) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        if self.tasks.insert(id.to_string(), tx).is_some() {
            warn!(%id, "replaced existing ack waiter");
        }
        rx
    }

    /// Drop the waiter for `id`, closing its channel.
    pub fn delete_task(&self, id: &str) {
        self.tasks.remove(id);
    }

    /// Deliver a result to the waiter for `id`, removing it.
    pub fn deliver(&self, id: &str, result: AckResult) {
        match self.tasks.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => debug!(%id, "ack for unknown task"),
        }
    }

    /// Await a registered waiter with a deadline. The task entry is removed
    /// on every exit path.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<AckResult>,
        deadline: Duration,
    ) -> Result<AckResult> {
        let outcome = tokio::time::timeout(deadline, rx).await;
        self.delete_task(id);
        match outcome {
            Err(_) => Err(ProtocolError::Timeout),
            Ok(Err(_)) => Err(ProtocolError::Rejected("ack channel closed".to_string())),
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// Number of pending waiters.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Send an ack to `peer` on a fresh one-shot `/ack` stream.
    pub async fn send_ack(&self, peer: PeerId, ack: &Ack) -> Result<()> {
        let mut stream = self.host.open_stream(peer, Protocol::Ack).await?;
        stream.write_msg(&ack.encode()?).await?;
        Ok(())
    }

    /// Fire-and-forget variant used by inbound handlers that must not block
    /// on the reply path.
    pub fn spawn_send_ack(self: &Arc<Self>, peer: PeerId, ack: Ack) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = registry.send_ack(peer, &ack).await {
                debug!(%peer, "ack send failed: {e}");
            }
        });
    }

    /// Drain inbound `/ack` streams: each carries exactly one frame.
    pub async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<IncomingStream>) {
        while let Some(mut incoming) = rx.recv().await {
            let registry = Arc::clone(&self);
            tokio::spawn(async move {
                let frame = match incoming.stream.read_msg().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("ack stream read failed: {e}");
                        return;
                    }
                };
                match Ack::decode(&frame) {
                    Ok(ack) => registry.deliver(
                        &ack.command_id,
                        AckResult {
                            ok: ack.result,
                            data: ack.data,
                        },
                    ),
                    Err(e) => debug!("ack decode failed: {e}"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whitenoise_transport::mem::MemNetwork;

    fn registry() -> Arc<AckRegistry> {
        let net = MemNetwork::new();
        let host = net.host(PeerId([1u8; 32]));
        AckRegistry::new(host)
    }

    #[tokio::test]
    async fn test_deliver_completes_waiter() {
        let reg = registry();
        let rx = reg.add_task("id-1");
        reg.deliver(
            "id-1",
            AckResult {
                ok: true,
                data: b"payload".to_vec(),
            },
        );
        let result = reg
            .wait("id-1", rx, Duration::from_secs(1))
            .await
            .expect("wait");
        assert!(result.ok);
        assert_eq!(result.data, b"payload");
        assert_eq!(reg.pending(), 0);
    }

    #[tokio::test]
    async fn test_at_most_one_delivery() {
        let reg = registry();
        let rx = reg.add_task("id-1");
        reg.deliver("id-1", AckResult { ok: true, data: vec![] });
        // Second delivery hits no waiter.
        reg.deliver("id-1", AckResult { ok: false, data: vec![] });
        let result = reg
            .wait("id-1", rx, Duration::from_secs(1))
            .await
            .expect("wait");
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_cleans_up() {
        let reg = registry();
        let rx = reg.add_task("id-1");
        let result = reg.wait("id-1", rx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
        assert_eq!(reg.pending(), 0);
    }

    #[tokio::test]
    async fn test_delete_closes_channel() {
        let reg = registry();
        let rx = reg.add_task("id-1");
        reg.delete_task("id-1");
        let result = reg.wait("id-1", rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_ack_roundtrip_over_host() {
        let net = MemNetwork::new();
        let a = net.host(PeerId([1u8; 32]));
        let b = net.host(PeerId([2u8; 32]));

        let reg_a = AckRegistry::new(a);
        let reg_b = AckRegistry::new(b.clone() as Arc<dyn Host>);

        let inbound = b.register_protocol(Protocol::Ack);
        tokio::spawn(Arc::clone(&reg_b).run_inbound(inbound));

        let rx = reg_b.add_task("req-9");
        reg_a
            .send_ack(PeerId([2u8; 32]), &Ack::accept("req-9", b"ok".to_vec()))
            .await
            .expect("send");

        let result = reg_b
            .wait("req-9", rx, Duration::from_secs(1))
            .await
            .expect("wait");
        assert!(result.ok);
        assert_eq!(result.data, b"ok");
    }
}
