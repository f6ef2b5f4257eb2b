use snow::{Builder, TransportState};

use super::transport::MessageTransport;
use crate::error::ChannelError;

/// Noise pattern spoken by the enclave fleet: the server's static key is
/// known to the client (from the verified attestation), the client stays
/// anonymous.
pub const NOISE_PATTERN: &str = "Noise_NK_25519_ChaChaPoly_SHA256";

/// Run the initiator side of the NK handshake, keyed by the enclave's
/// attested public key. Two messages: `-> e, es` then `<- e, ee`.
pub async fn initiate(
    transport: &mut dyn MessageTransport,
    enclave_key: &[u8; 32],
    max_message_size: usize,
) -> Result<TransportState, ChannelError> {
    let params = NOISE_PATTERN
        .parse()
        .map_err(|e| ChannelError::HandshakeFailed(format!("invalid noise pattern: {e}")))?;
    let mut handshake = Builder::new(params)
        .remote_public_key(enclave_key)
        .build_initiator()
        .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))?;

    let mut buf = vec![0u8; max_message_size];

    let len = handshake
        .write_message(&[], &mut buf)
        .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))?;
    transport.send(bytes::Bytes::copy_from_slice(&buf[..len])).await?;
    tracing::debug!(bytes = len, "sent handshake initiator message");

    let response = transport
        .recv()
        .await?
        .ok_or(ChannelError::Closed)?;
    handshake
        .read_message(&response, &mut buf)
        .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))?;
    tracing::debug!(bytes = response.len(), "received handshake response");

    if !handshake.is_handshake_finished() {
        return Err(ChannelError::HandshakeFailed(
            "handshake incomplete after responder message".into(),
        ));
    }

    handshake
        .into_transport_mode()
        .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))
}
