//! QUIC host.
//!
//! The production [`Host`] implementation over quinn with TLS 1.3. Nodes
//! use self-signed certificates; transport identity is established by a
//! hello exchange on the first bidirectional stream of every connection,
//! carrying each side's peer id. Streams opened afterwards lead with a
//! single header frame naming the protocol (`/relay`, `/cmd`, `/ack`,
//! `/proxy`) and are then handed to the registered handler.
//!
//! Connections are cached per peer and reused in both directions, so a
//! proxy can open an `/ack` stream back to a client that dialed it without
//! knowing the client's listen address.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use whitenoise_types::PeerId;

use crate::framing::FramedStream;
use crate::host::{Host, IncomingStream, Protocol};
use crate::{Result, TransportError};

/// ALPN protocol identifier.
pub const ALPN_WHITENOISE_V1: &[u8] = b"whitenoise/1";

/// Default QUIC idle timeout in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

/// Default maximum number of concurrent bidirectional streams.
pub const DEFAULT_MAX_BI_STREAMS: u32 = 128;

const INBOUND_QUEUE: usize = 64;

/// Configuration for a QUIC host.
#[derive(Clone)]
pub struct QuicConfig {
    /// Local address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_bi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_bi_streams: DEFAULT_MAX_BI_STREAMS,
        }
    }
}

/// [`Host`] implementation over quinn.
pub struct QuicHost {
    local: PeerId,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    address_book: DashMap<PeerId, SocketAddr>,
    conns: DashMap<PeerId, Connection>,
    handlers: Arc<DashMap<Protocol, mpsc::Sender<IncomingStream>>>,
    disconnects: broadcast::Sender<PeerId>,
    allowlist: Option<HashSet<PeerId>>,
    // Self-handle for the per-connection tasks spawned from trait methods.
    weak_self: std::sync::Weak<QuicHost>,
}

impl QuicHost {
    /// Bind a host and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails, or
    /// [`TransportError::Io`] if the socket cannot be bound.
    pub fn bind(
        config: QuicConfig,
        local: PeerId,
        allowlist: Option<HashSet<PeerId>>,
    ) -> Result<Arc<Self>> {
        let server_config = build_server_config(config.idle_timeout_ms, config.max_bi_streams)?;
        let client_config = build_client_config()?;

        let mut endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        info!(%local_addr, peer = %local, "QUIC host started");

        let (disconnects, _) = broadcast::channel(32);
        let host = Arc::new_cyclic(|weak| Self {
            local,
            endpoint,
            local_addr,
            address_book: DashMap::new(),
            conns: DashMap::new(),
            handlers: Arc::new(DashMap::new()),
            disconnects,
            allowlist,
            weak_self: weak.clone(),
        });

        let accept = Arc::clone(&host);
        tokio::spawn(async move { accept.run_accept_loop().await });

        Ok(host)
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record a dialable address for `peer`.
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.address_book.insert(peer, addr);
    }

    fn admit(&self, peer: PeerId) -> Result<()> {
        if let Some(allowed) = &self.allowlist {
            if !allowed.contains(&peer) {
                return Err(TransportError::NotAllowed(peer.to_string()));
            }
        }
        Ok(())
    }

    async fn ensure_connection(self: &Arc<Self>, peer: PeerId) -> Result<Connection> {
        if let Some(conn) = self.conns.get(&peer) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }
        self.conns.remove(&peer);

        let addr = self
            .address_book
            .get(&peer)
            .map(|a| *a.value())
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;

        let conn = self
            .endpoint
            .connect(addr, "whitenoise-node")
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        // Hello exchange: dialer opens the first stream and sends its peer
        // id, the acceptor replies with its own.
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let mut hello = FramedStream::new(Box::new(tokio::io::join(recv, send)));
        hello.write_msg(self.local.as_bytes()).await?;
        let remote_raw = hello.read_msg().await?;
        let remote = decode_peer_frame(&remote_raw)?;
        if remote != peer {
            return Err(TransportError::Connection(format!(
                "peer identity mismatch: dialed {peer}, reached {remote}"
            )));
        }
        self.admit(remote)?;

        debug!(remote = %peer, %addr, "QUIC connection established");
        self.conns.insert(peer, conn.clone());

        let host = Arc::clone(self);
        let stream_conn = conn.clone();
        tokio::spawn(async move { host.run_stream_loop(stream_conn, peer).await });

        Ok(conn)
    }

    async fn run_accept_loop(self: Arc<Self>) {
        while let Some(incoming) = self.endpoint.accept().await {
            let host = Arc::clone(&self);
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("inbound connection failed: {e}");
                        return;
                    }
                };
                if let Err(e) = host.handle_inbound_connection(conn).await {
                    debug!("inbound connection rejected: {e}");
                }
            });
        }
    }

    async fn handle_inbound_connection(self: &Arc<Self>, conn: Connection) -> Result<()> {
        let (send, recv) = conn
            .accept_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let mut hello = FramedStream::new(Box::new(tokio::io::join(recv, send)));
        let remote_raw = hello.read_msg().await?;
        let remote = decode_peer_frame(&remote_raw)?;
        self.admit(remote)?;
        hello.write_msg(self.local.as_bytes()).await?;

        debug!(%remote, "admitted inbound QUIC connection");
        self.conns.insert(remote, conn.clone());

        let host = Arc::clone(self);
        tokio::spawn(async move { host.run_stream_loop(conn, remote).await });
        Ok(())
    }

    async fn run_stream_loop(self: Arc<Self>, conn: Connection, peer: PeerId) {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(%peer, "connection closed: {e}");
                    break;
                }
            };
            let handlers = Arc::clone(&self.handlers);
            tokio::spawn(async move {
                let mut stream = FramedStream::new(Box::new(tokio::io::join(recv, send)));
                let header = match stream.read_msg().await {
                    Ok(header) => header,
                    Err(e) => {
                        debug!("stream header read failed: {e}");
                        return;
                    }
                };
                let protocol = match std::str::from_utf8(&header)
                    .map_err(|e| TransportError::Framing(e.to_string()))
                    .and_then(Protocol::parse)
                {
                    Ok(protocol) => protocol,
                    Err(e) => {
                        warn!("bad stream header: {e}");
                        return;
                    }
                };
                let Some(handler) = handlers.get(&protocol).map(|h| h.value().clone()) else {
                    warn!(%protocol, "no handler registered");
                    return;
                };
                let _ = handler
                    .send(IncomingStream {
                        protocol,
                        remote_peer: peer,
                        stream,
                    })
                    .await;
            });
        }
        self.conns.remove(&peer);
        let _ = self.disconnects.send(peer);
    }
}

#[async_trait::async_trait]
impl Host for QuicHost {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: PeerId, protocol: Protocol) -> Result<FramedStream> {
        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| TransportError::Connection("host shut down".to_string()))?;
        let conn = this.ensure_connection(peer).await?;

        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let mut stream = FramedStream::new(Box::new(tokio::io::join(recv, send)));
        stream.write_msg(protocol.as_str().as_bytes()).await?;
        Ok(stream)
    }

    fn register_protocol(&self, protocol: Protocol) -> mpsc::Receiver<IncomingStream> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.handlers.insert(protocol, tx);
        rx
    }

    fn subscribe_disconnects(&self) -> broadcast::Receiver<PeerId> {
        self.disconnects.subscribe()
    }
}

fn decode_peer_frame(raw: &[u8]) -> Result<PeerId> {
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| TransportError::Connection("malformed hello frame".to_string()))?;
    Ok(PeerId(bytes))
}

// ---------------------------------------------------------------------------
// TLS / certificate helpers
// ---------------------------------------------------------------------------

fn generate_self_signed_cert(
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;

    let params = rcgen::CertificateParams::new(vec!["whitenoise-node".to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-signed cert generation failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((cert_der, key_der))
}

fn build_server_config(idle_timeout_ms: u32, max_bi_streams: u32) -> Result<ServerConfig> {
    let (cert_der, key_der) = generate_self_signed_cert()?;

    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS version config failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_WHITENOISE_V1.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_millis(u64::from(idle_timeout_ms)))
            .map_err(|e| TransportError::Tls(format!("idle timeout config failed: {e}")))?,
    ));
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(max_bi_streams));

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

fn build_client_config() -> Result<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS version config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();

    tls_config.alpn_protocols = vec![ALPN_WHITENOISE_V1.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto config failed: {e}")))?,
    )))
}

/// Accepts any server certificate. TLS carries transport encryption only;
/// peer identity is established by the hello exchange and, end to end, by
/// the Noise handshake.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_value() {
        assert_eq!(ALPN_WHITENOISE_V1, b"whitenoise/1");
    }

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.max_bi_streams, DEFAULT_MAX_BI_STREAMS);
    }

    #[test]
    fn test_generate_self_signed_cert() {
        let (cert, key) = generate_self_signed_cert().expect("cert generation");
        assert!(!cert.is_empty());
        match &key {
            PrivateKeyDer::Pkcs8(k) => assert!(!k.secret_pkcs8_der().is_empty()),
            _ => unreachable!("expected PKCS8 key"),
        }
    }

    #[test]
    fn test_build_configs_succeed() {
        assert!(build_server_config(DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_BI_STREAMS).is_ok());
        assert!(build_client_config().is_ok());
    }

    #[test]
    fn test_decode_peer_frame() {
        assert!(decode_peer_frame(&[0u8; 32]).is_ok());
        assert!(decode_peer_frame(&[0u8; 31]).is_err());
    }
}

#[cfg(test)]
mod loopback_tests {
    use super::*;

    fn host(peer: u8) -> Arc<QuicHost> {
        QuicHost::bind(
            QuicConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..QuicConfig::default()
            },
            PeerId([peer; 32]),
            None,
        )
        .expect("bind host")
    }

    #[tokio::test]
    async fn test_streams_flow_both_ways_over_one_connection() {
        let a = host(1);
        let b = host(2);
        a.add_peer(PeerId([2u8; 32]), b.local_addr());

        let mut b_relay = b.register_protocol(Protocol::Relay);
        let mut a_ack = a.register_protocol(Protocol::Ack);

        // a dials b.
        let mut out = a
            .open_stream(PeerId([2u8; 32]), Protocol::Relay)
            .await
            .expect("open stream");
        out.write_msg(b"over quic").await.expect("write");

        let mut incoming = b_relay.recv().await.expect("inbound stream");
        assert_eq!(incoming.remote_peer, PeerId([1u8; 32]));
        assert_eq!(incoming.stream.read_msg().await.expect("read"), b"over quic");

        // b reaches back over the cached connection without knowing a's
        // address.
        let mut back = b
            .open_stream(PeerId([1u8; 32]), Protocol::Ack)
            .await
            .expect("open return stream");
        back.write_msg(b"reply").await.expect("write");

        let mut incoming = a_ack.recv().await.expect("inbound ack stream");
        assert_eq!(incoming.remote_peer, PeerId([2u8; 32]));
        assert_eq!(incoming.stream.read_msg().await.expect("read"), b"reply");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_refused() {
        let a = host(3);
        let result = a.open_stream(PeerId([9u8; 32]), Protocol::Relay).await;
        assert!(matches!(result, Err(TransportError::UnknownPeer(_))));
    }
}
