//! # whitenoise-sdk
//!
//! The application-facing client surface. A [`WhiteNoiseClient`] wraps a
//! running circuit core and exposes the dial/read/write/disconnect
//! lifecycle; a [`Connection`] is the end-to-end secure conversation
//! between two WhiteNoise identities.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use whitenoise_crypto::hash::sha256_b58;
use whitenoise_crypto::WhiteNoiseID;
use whitenoise_protocol::{NodeEvent, NoiseService, ProtocolError, Result};
use whitenoise_secure::SecureSession;
use whitenoise_types::{NodeInfo, PeerId, SessionId, DIAL_TIMEOUT};

/// An established end-to-end conversation over one circuit.
#[derive(Clone)]
pub struct Connection {
    secure: Arc<SecureSession>,
    session_id: SessionId,
}

impl Connection {
    /// Read decrypted bytes; blocks until traffic arrives or the circuit
    /// dies.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.secure.read(buf).await?)
    }

    /// Encrypt and send; returns the plaintext byte count.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(self.secure.write(data).await?)
    }

    /// Close the underlying circuit connection.
    pub async fn close(&self) {
        self.secure.close().await;
    }

    /// This side's identity, string form.
    pub fn local_whitenoise_id(&self) -> String {
        self.secure.local_id().to_string()
    }

    /// The authenticated remote identity, string form.
    pub fn remote_whitenoise_id(&self) -> String {
        self.secure.remote_id().to_string()
    }

    /// The session this conversation rides on.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// Client handle over a running node.
pub struct WhiteNoiseClient {
    service: Arc<NoiseService>,
}

impl WhiteNoiseClient {
    pub fn new(service: Arc<NoiseService>) -> Self {
        Self { service }
    }

    /// This client's identity, string form.
    pub fn whitenoise_id(&self) -> String {
        self.service.whitenoise_id().to_string()
    }

    /// Fetch up to `max` peers from a directory node.
    pub async fn get_mainnet_peers(&self, boot: PeerId, max: u32) -> Result<Vec<NodeInfo>> {
        self.service.get_mainnet_peers(boot, max).await
    }

    /// Register with `proxy` as this node's entry point.
    pub async fn register(&self, proxy: PeerId) -> Result<()> {
        self.service.register_proxy(proxy).await
    }

    /// Build a circuit to `remote_id` (string-form WhiteNoiseID) and run
    /// the end-to-end handshake. Returns the secure connection and its
    /// session id.
    pub async fn dial(&self, remote_id: &str) -> Result<(Connection, SessionId)> {
        let remote: WhiteNoiseID = remote_id
            .parse()
            .map_err(|e| ProtocolError::Decode(format!("bad remote identity: {e}")))?;
        let session_id = generate_session_id(&self.whitenoise_id(), remote_id);
        debug!(session = %session_id, "dialing");

        // Subscribe before the request: the handshake can complete before
        // the circuit ack returns.
        let mut events = self.service.subscribe_events();
        self.service.new_circuit(remote, &session_id).await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::SecureConnEstablished { session_id: sid, .. })
                        if sid == session_id =>
                    {
                        return self
                            .get_circuit(&session_id)
                            .ok_or_else(|| ProtocolError::NoSuchSession(session_id.clone()));
                    }
                    Ok(NodeEvent::CircuitClosed { session_id: sid }) if sid == session_id => {
                        return Err(ProtocolError::Rejected(
                            "circuit torn down during dial".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        // Missed events; the map may already hold the session.
                        if let Some(conn) = self.get_circuit(&session_id) {
                            return Ok(conn);
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(ProtocolError::Rejected("node shut down".to_string()));
                    }
                }
            }
        };

        match tokio::time::timeout(DIAL_TIMEOUT, wait).await {
            Ok(Ok(conn)) => Ok((conn, session_id)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = self.service.relay().close_circuit(&session_id).await;
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// The established conversation for `session_id`, if the handshake has
    /// completed.
    pub fn get_circuit(&self, session_id: &SessionId) -> Option<Connection> {
        self.service
            .relay()
            .get_secure(session_id)
            .map(|secure| Connection {
                secure,
                session_id: session_id.clone(),
            })
    }

    /// Send one message over an established circuit.
    pub async fn send_message(&self, data: &[u8], session_id: &SessionId) -> Result<()> {
        let conn = self
            .get_circuit(session_id)
            .ok_or_else(|| ProtocolError::NoSuchSession(session_id.clone()))?;
        conn.write(data).await?;
        Ok(())
    }

    /// Tear down a circuit; every hop removes the session.
    pub async fn disconnect_circuit(&self, session_id: &SessionId) -> Result<()> {
        self.service.relay().close_circuit(session_id).await
    }

    /// Leave the hosting proxy.
    pub async fn unregister(&self) {
        self.service.unregister().await;
    }

    /// The wrapped circuit core.
    pub fn service(&self) -> &Arc<NoiseService> {
        &self.service
    }
}

/// Session ids are caller-generated:
/// `base58(SHA-256(local_id ‖ remote_id ‖ monotonic_nanos))`.
fn generate_session_id(local_id: &str, remote_id: &str) -> SessionId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut material = Vec::new();
    material.extend_from_slice(local_id.as_bytes());
    material.extend_from_slice(remote_id.as_bytes());
    material.extend_from_slice(&nanos.to_be_bytes());
    SessionId::new(sha256_b58(&material))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_unique_per_dial() {
        let a = generate_session_id("alice", "bob");
        std::thread::sleep(std::time::Duration::from_nanos(100));
        let b = generate_session_id("alice", "bob");
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_depends_on_identities() {
        let a = generate_session_id("alice", "bob");
        let b = generate_session_id("carol", "bob");
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }
}
