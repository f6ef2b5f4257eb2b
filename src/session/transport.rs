use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ChannelError;

/// A message-oriented transport carrying opaque binary frames.
///
/// The secure session layers Noise ciphertexts on top; the transport itself
/// never sees plaintext.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, msg: Bytes) -> Result<(), ChannelError>;

    /// Receive the next binary message. `None` means the peer closed.
    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError>;

    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Dials a fresh transport for each secure session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn MessageTransport>, ChannelError>;
}

/// WebSocket connector used in production.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn MessageTransport>, ChannelError> {
        let (stream, _response) = connect_async(endpoint)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        tracing::debug!(endpoint, "websocket connected");
        Ok(Box::new(WsTransport { inner: stream }))
    }
}

/// WebSocket transport: binary messages carry handshake and ciphertext
/// frames, pings are answered transparently.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl MessageTransport for WsTransport {
    async fn send(&mut self, msg: Bytes) -> Result<(), ChannelError> {
        self.inner
            .send(Message::Binary(msg.to_vec()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(data))) => {
                    self.inner
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| ChannelError::Transport(e.to_string()))?;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(other)) => {
                    tracing::warn!(?other, "ignoring unexpected websocket message");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        match self.inner.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ChannelError::Transport(e.to_string())),
        }
    }
}
