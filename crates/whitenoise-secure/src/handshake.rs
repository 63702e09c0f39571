//! The Noise `XX` handshake over a circuit.
//!
//! Caller initiates, Answer responds. Each side generates a fresh Curve25519
//! static keypair for the handshake and proves ownership of its long-term
//! WhiteNoise identity by signing the Noise static public key:
//!
//! ```text
//! identity_sig = Sign(identity_private, "noise-libp2p-static-key:" ‖ noise_static_public)
//! ```
//!
//! The payload travels in the encrypted portions of messages 2 and 3, so
//! identities are never visible to the circuit hops. The initiator
//! additionally checks that the authenticated remote identity matches the
//! one it dialed; the responder learns its peer's identity from the
//! handshake.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::debug;
use whitenoise_crypto::{Account, WhiteNoiseID};
use whitenoise_transport::{cbor, messages::NoiseHandshakePayload};
use whitenoise_types::READ_HANDSHAKE_TIMEOUT;

use crate::io::{read_frame, write_frame, CircuitIo};
use crate::session::{SecureSession, MAX_NOISE_MESSAGE_LENGTH};
use crate::{Result, SecureError};

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";
const SIG_PREFIX: &[u8] = b"noise-libp2p-static-key:";

/// Run the initiator side. `remote` is the identity the caller dialed; the
/// handshake fails unless the authenticated peer matches it.
pub async fn secure_caller(
    io: Arc<dyn CircuitIo>,
    account: &Account,
    remote: WhiteNoiseID,
) -> Result<SecureSession> {
    run_handshake(io, account, Some(remote), true).await
}

/// Run the responder side. The remote identity is learned from the
/// handshake payload.
pub async fn secure_answer(io: Arc<dyn CircuitIo>, account: &Account) -> Result<SecureSession> {
    run_handshake(io, account, None, false).await
}

async fn run_handshake(
    io: Arc<dyn CircuitIo>,
    account: &Account,
    expected_remote: Option<WhiteNoiseID>,
    initiator: bool,
) -> Result<SecureSession> {
    let builder = snow::Builder::new(
        NOISE_PARAMS
            .parse()
            .map_err(|e| SecureError::Noise(format!("pattern parse: {e}")))?,
    );
    let static_keypair = builder.generate_keypair()?;

    let builder = snow::Builder::new(
        NOISE_PARAMS
            .parse()
            .map_err(|e| SecureError::Noise(format!("pattern parse: {e}")))?,
    )
    .local_private_key(&static_keypair.private)?;
    let mut state = if initiator {
        builder.build_initiator()?
    } else {
        builder.build_responder()?
    };

    let payload = identity_payload(account, &static_keypair.public)?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE_LENGTH];

    let remote_id = if initiator {
        // -> e
        let len = state.write_message(&[], &mut buf)?;
        write_frame(io.as_ref(), &buf[..len]).await?;
        debug!("caller sent handshake message 1");

        // <- e, ee, s, es (+ responder payload)
        let msg = read_handshake_frame(io.as_ref()).await?;
        let len = state.read_message(&msg, &mut buf)?;
        let remote_static = remote_static(&state)?;
        let remote_id = verify_identity(&buf[..len], &remote_static)?;
        if let Some(expected) = &expected_remote {
            if remote_id != *expected {
                return Err(SecureError::Identity(format!(
                    "dialed {expected} but handshake authenticated {remote_id}"
                )));
            }
        }
        debug!("caller verified responder identity");

        // -> s, se (+ initiator payload)
        let len = state.write_message(&payload, &mut buf)?;
        write_frame(io.as_ref(), &buf[..len]).await?;
        remote_id
    } else {
        // <- e
        let msg = read_handshake_frame(io.as_ref()).await?;
        state.read_message(&msg, &mut buf)?;
        debug!("answer received handshake message 1");

        // -> e, ee, s, es (+ responder payload)
        let len = state.write_message(&payload, &mut buf)?;
        write_frame(io.as_ref(), &buf[..len]).await?;

        // <- s, se (+ initiator payload)
        let msg = read_handshake_frame(io.as_ref()).await?;
        let len = state.read_message(&msg, &mut buf)?;
        let remote_static = remote_static(&state)?;
        let remote_id = verify_identity(&buf[..len], &remote_static)?;
        debug!("answer verified initiator identity");
        remote_id
    };

    let transport = state.into_stateless_transport_mode()?;
    Ok(SecureSession::new(
        io,
        transport,
        account.whitenoise_id(),
        remote_id,
    ))
}

async fn read_handshake_frame(io: &dyn CircuitIo) -> Result<Vec<u8>> {
    timeout(READ_HANDSHAKE_TIMEOUT, read_frame(io, MAX_NOISE_MESSAGE_LENGTH))
        .await
        .map_err(|_| SecureError::HandshakeTimeout)?
}

fn identity_payload(account: &Account, noise_static_public: &[u8]) -> Result<Vec<u8>> {
    let mut to_sign = SIG_PREFIX.to_vec();
    to_sign.extend_from_slice(noise_static_public);
    let payload = NoiseHandshakePayload {
        identity_key: account.whitenoise_id().to_string(),
        identity_sig: account.sign(&to_sign),
    };
    cbor::to_vec(&payload).map_err(|e| SecureError::Payload(e.to_string()))
}

fn remote_static(state: &snow::HandshakeState) -> Result<Vec<u8>> {
    state
        .get_remote_static()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| SecureError::Noise("remote static key not yet available".to_string()))
}

fn verify_identity(payload: &[u8], remote_static: &[u8]) -> Result<WhiteNoiseID> {
    let payload: NoiseHandshakePayload =
        cbor::from_slice(payload).map_err(|e| SecureError::Payload(e.to_string()))?;
    let remote_id: WhiteNoiseID = payload
        .identity_key
        .parse()
        .map_err(|e| SecureError::Identity(format!("bad identity key: {e}")))?;

    let mut signed = SIG_PREFIX.to_vec();
    signed.extend_from_slice(remote_static);
    let public = remote_id
        .public_key()
        .map_err(|e| SecureError::Identity(e.to_string()))?;
    public
        .verify(&signed, &payload.identity_sig)
        .map_err(|e| SecureError::Identity(format!("handshake signature invalid: {e}")))?;

    Ok(remote_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StreamIo;
    use whitenoise_crypto::KeyType;

    fn accounts() -> (Account, Account) {
        (
            Account::from_seed(KeyType::Ed25519, [1u8; 32]).expect("seed"),
            Account::from_seed(KeyType::Ed25519, [2u8; 32]).expect("seed"),
        )
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (caller_acc, answer_acc) = accounts();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let caller_io = StreamIo::new(a);
        let answer_io = StreamIo::new(b);

        let answer_id = answer_acc.whitenoise_id();
        let caller_id = caller_acc.whitenoise_id();

        let caller = tokio::spawn(async move {
            secure_caller(caller_io, &caller_acc, answer_id).await
        });
        let answer =
            tokio::spawn(async move { secure_answer(answer_io, &answer_acc).await });

        let caller = caller.await.expect("join").expect("caller handshake");
        let answer = answer.await.expect("join").expect("answer handshake");

        assert_eq!(caller.remote_id(), answer.local_id());
        assert_eq!(answer.remote_id(), caller_id);
    }

    #[tokio::test]
    async fn test_initiator_rejects_wrong_identity() {
        let (caller_acc, answer_acc) = accounts();
        let imposter = Account::from_seed(KeyType::Ed25519, [3u8; 32]).expect("seed");
        let (a, b) = tokio::io::duplex(64 * 1024);
        let caller_io = StreamIo::new(a);
        let answer_io = StreamIo::new(b);

        // Caller expects the imposter's identity, but the answer account is
        // on the other end.
        let expected = imposter.whitenoise_id();
        let caller = tokio::spawn(async move {
            secure_caller(caller_io, &caller_acc, expected).await
        });
        let answer =
            tokio::spawn(async move { secure_answer(answer_io, &answer_acc).await });

        assert!(caller.await.expect("join").is_err());
        // The responder may or may not complete before the caller hangs up.
        let _ = answer.await;
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_peer() {
        let (caller_acc, _) = accounts();
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let io = StreamIo::new(a);
        let remote = Account::generate().whitenoise_id();

        let result = secure_caller(io, &caller_acc, remote).await;
        assert!(matches!(result, Err(SecureError::HandshakeTimeout)));
    }
}
