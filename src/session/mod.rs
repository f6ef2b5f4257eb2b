pub mod channel;
pub mod handshake;
pub mod transport;

use std::time::Duration;

use crate::error::ChannelError;

/// Configuration for secure sessions.
///
/// The cipher suite is always Noise NK with X25519 + ChaCha20-Poly1305,
/// matching what the enclave fleet speaks.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum time for dialing the transport (default: 10s).
    pub connect_timeout: Duration,

    /// Maximum time to wait for a response or the next streamed frame
    /// (default: 300s; generation can be slow on large prompts).
    pub request_timeout: Duration,

    /// Maximum transport message size in bytes (default: 64 KiB).
    pub max_message_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            max_message_size: 64 * 1024,
        }
    }
}

impl SessionOptions {
    /// Create a builder for constructing `SessionOptions`.
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder::default()
    }
}

/// Builder for [`SessionOptions`].
#[derive(Debug, Clone)]
pub struct SessionOptionsBuilder {
    connect_timeout: Duration,
    request_timeout: Duration,
    max_message_size: usize,
}

impl Default for SessionOptionsBuilder {
    fn default() -> Self {
        let defaults = SessionOptions::default();
        Self {
            connect_timeout: defaults.connect_timeout,
            request_timeout: defaults.request_timeout,
            max_message_size: defaults.max_message_size,
        }
    }
}

impl SessionOptionsBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Build the `SessionOptions`, validating that all values are sensible.
    pub fn build(self) -> Result<SessionOptions, ChannelError> {
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(ChannelError::ConnectFailed(
                "timeouts must be > 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ChannelError::ConnectFailed(
                "max_message_size must be > 0".into(),
            ));
        }
        Ok(SessionOptions {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            max_message_size: self.max_message_size,
        })
    }
}

pub use channel::{FrameStream, SecureSession};
pub use transport::{Connector, MessageTransport, WsConnector};
