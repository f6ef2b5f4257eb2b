use bytes::Bytes;
use snow::TransportState;
use tokio::time::timeout;

use super::transport::{Connector, MessageTransport};
use super::{handshake, SessionOptions};
use crate::attestation::TrustState;
use crate::error::ChannelError;

/// AEAD tag appended to every noise transport message.
const TAG_LEN: usize = 16;

/// One authenticated encrypted session, bound to a single inference request.
///
/// Sessions are never pooled or reused: every request re-proves channel
/// integrity against the already-verified enclave identity. `close` consumes
/// the session, so calling it twice is unrepresentable.
pub struct SecureSession {
    transport: Box<dyn MessageTransport>,
    noise: TransportState,
    options: SessionOptions,
}

impl SecureSession {
    /// Dial the enclave and perform the NK handshake keyed by its attested
    /// public key.
    ///
    /// Refuses to build a channel unless `trust` permits one: this is the
    /// single construction path, so the no-channel-before-trust invariant is
    /// enforced here.
    pub async fn open(
        connector: &dyn Connector,
        endpoint: &str,
        enclave_key: &[u8; 32],
        trust: TrustState,
        options: SessionOptions,
    ) -> Result<Self, ChannelError> {
        if !trust.permits_channel() {
            return Err(ChannelError::NotPermitted(trust));
        }

        let mut transport = timeout(options.connect_timeout, connector.connect(endpoint))
            .await
            .map_err(|_| ChannelError::Timeout)??;

        let noise = match timeout(
            options.connect_timeout,
            handshake::initiate(transport.as_mut(), enclave_key, options.max_message_size),
        )
        .await
        {
            Ok(Ok(noise)) => noise,
            Ok(Err(e)) => {
                transport.close().await.ok();
                return Err(e);
            }
            Err(_) => {
                transport.close().await.ok();
                return Err(ChannelError::Timeout);
            }
        };

        tracing::debug!(endpoint, "secure session established");

        Ok(Self {
            transport,
            noise,
            options,
        })
    }

    /// Encrypt a plaintext payload into a transport message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Bytes, ChannelError> {
        let size = plaintext.len() + TAG_LEN;
        if size > self.options.max_message_size {
            return Err(ChannelError::MessageTooLarge {
                size,
                max: self.options.max_message_size,
            });
        }
        let mut buf = vec![0u8; size];
        let len = self
            .noise
            .write_message(plaintext, &mut buf)
            .map_err(|e| ChannelError::Crypto(e.to_string()))?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    /// Decrypt a transport message into plaintext.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Bytes, ChannelError> {
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .noise
            .read_message(ciphertext, &mut buf)
            .map_err(|e| ChannelError::Crypto(e.to_string()))?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    /// Encrypt and send one payload.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        let ciphertext = self.encrypt(plaintext)?;
        self.transport.send(ciphertext).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        match self.transport.recv().await? {
            Some(ciphertext) => Ok(Some(self.decrypt(&ciphertext)?)),
            None => Ok(None),
        }
    }

    /// Send one request and wait for a single decrypted response.
    pub async fn send_and_receive(&mut self, payload: &[u8]) -> Result<Bytes, ChannelError> {
        self.send(payload).await?;
        match timeout(self.options.request_timeout, self.recv()).await {
            Ok(result) => result?.ok_or(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    /// Send one request and yield successive decrypted frames in order.
    pub async fn send_and_stream(&mut self, payload: &[u8]) -> Result<FrameStream<'_>, ChannelError> {
        self.send(payload).await?;
        Ok(FrameStream { session: self })
    }

    /// Close the session. Must be called exactly once per session on every
    /// exit path; consuming `self` enforces the "exactly once" half.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        self.transport.close().await
    }
}

/// Ordered decrypted frames of a streaming response.
pub struct FrameStream<'a> {
    session: &'a mut SecureSession,
}

impl FrameStream<'_> {
    /// The next decrypted frame, or `None` once the peer closes.
    pub async fn next(&mut self) -> Result<Option<Bytes>, ChannelError> {
        match timeout(self.session.options.request_timeout, self.session.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        }
    }
}
