use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::chunks::{ChatChunk, ChunkStream, FinishReason, Usage};
use super::wire::{WireEvent, WireMessage, WireRequest, WireResponse};
use crate::config::TrustedConfig;
use crate::error::{ChannelError, Error, ProtocolError};
use crate::session::{Connector, SecureSession, SessionOptions};

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of chat history on the application side.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generation parameters forwarded to the enclave.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop: Option<Vec<String>>,
}

/// Result of a unary completion call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub reason: FinishReason,
    pub usage: Option<Usage>,
}

/// Translates between application chat types and the enclave wire protocol,
/// opening one fresh [`SecureSession`] per call.
///
/// The active config arrives on a watch channel fed by the lifecycle
/// manager; a request issued with no verified assignment fails immediately
/// with [`ChannelError::NotReady`].
pub struct InferenceClient {
    state: watch::Receiver<Option<TrustedConfig>>,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
}

impl InferenceClient {
    pub fn new(
        state: watch::Receiver<Option<TrustedConfig>>,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> Self {
        Self {
            state,
            connector,
            options,
        }
    }

    fn current(&self) -> Result<TrustedConfig, ChannelError> {
        self.state.borrow().clone().ok_or(ChannelError::NotReady)
    }

    /// Unary completion: one request, one response document.
    ///
    /// The session work runs in its own task so that cancelling the returned
    /// future cannot leave a session unclosed.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<Completion, Error> {
        let trusted = self.current()?;
        let payload = encode_request(messages, params, false)?;
        let connector = Arc::clone(&self.connector);
        let options = self.options.clone();

        let handle = tokio::spawn(async move {
            let mut session = SecureSession::open(
                connector.as_ref(),
                &trusted.config.ws_endpoint,
                &trusted.enclave_key,
                trusted.trust,
                options,
            )
            .await?;

            let result = session.send_and_receive(&payload).await;
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "session close failed");
            }
            result
        });

        let bytes = handle
            .await
            .map_err(|e| ChannelError::Transport(format!("request task failed: {e}")))??;

        let response: WireResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProtocolError::MalformedEvent(e.to_string()))?;

        Ok(match response.error {
            Some(message) => Completion {
                content: response.content,
                reason: FinishReason::Error(message),
                usage: response.usage.map(Into::into),
            },
            None => Completion {
                content: response.content,
                reason: FinishReason::from_wire(response.finish_reason.as_deref()),
                usage: response.usage.map(Into::into),
            },
        })
    }

    /// Streaming completion: returns the canonical chunk stream.
    ///
    /// Session-open failures reject the call; everything after that is
    /// delivered in-band, ending with a `Finish` chunk (an error reason if
    /// the wire stream misbehaved). The spawned task owns the session and
    /// closes it on success, error, and consumer cancellation alike.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChunkStream, Error> {
        let trusted = self.current()?;
        let payload = encode_request(messages, params, true)?;

        let session = SecureSession::open(
            self.connector.as_ref(),
            &trusted.config.ws_endpoint,
            &trusted.enclave_key,
            trusted.trust,
            self.options.clone(),
        )
        .await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump(session, payload, tx));
        Ok(ChunkStream::new(rx))
    }
}

fn encode_request(
    messages: &[ChatMessage],
    params: &GenerationParams,
    stream: bool,
) -> Result<Vec<u8>, ProtocolError> {
    let request = WireRequest {
        model: params.model.clone(),
        messages: messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect(),
        stream,
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        stop: params.stop.clone(),
    };
    serde_json::to_vec(&request).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Drive one streaming request to completion, then close the session.
///
/// The session is closed strictly after the last chunk is emitted.
async fn pump(mut session: SecureSession, payload: Vec<u8>, tx: mpsc::Sender<ChatChunk>) {
    run_stream(&mut session, &payload, &tx).await;
    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "session close failed");
    }
}

async fn run_stream(session: &mut SecureSession, payload: &[u8], tx: &mpsc::Sender<ChatChunk>) {
    // A failed send means the consumer dropped the stream; stop pumping.
    if tx.send(ChatChunk::StreamStart).await.is_err() {
        return;
    }

    let mut frames = match session.send_and_stream(payload).await {
        Ok(frames) => frames,
        Err(e) => {
            let _ = tx.send(finish_error(e.to_string())).await;
            return;
        }
    };

    let mut text_started = false;
    loop {
        let frame = match frames.next().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                finish_with(tx, text_started, finish_error("channel closed before finish".into()))
                    .await;
                return;
            }
            Err(e) => {
                finish_with(tx, text_started, finish_error(e.to_string())).await;
                return;
            }
        };

        match serde_json::from_slice::<WireEvent>(&frame) {
            Ok(WireEvent::TextDelta { delta }) => {
                if !text_started {
                    if tx.send(ChatChunk::TextStart).await.is_err() {
                        return;
                    }
                    text_started = true;
                }
                if tx.send(ChatChunk::TextDelta { delta }).await.is_err() {
                    return;
                }
            }
            Ok(WireEvent::Finish {
                finish_reason,
                usage,
            }) => {
                if !text_started && tx.send(ChatChunk::TextStart).await.is_err() {
                    return;
                }
                if tx.send(ChatChunk::TextEnd).await.is_err() {
                    return;
                }
                let _ = tx
                    .send(ChatChunk::Finish {
                        reason: FinishReason::from_wire(finish_reason.as_deref()),
                        usage: usage.map(Into::into),
                    })
                    .await;
                return;
            }
            Ok(WireEvent::Error { message }) => {
                finish_with(tx, text_started, finish_error(message)).await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed wire event, terminating stream");
                finish_with(
                    tx,
                    text_started,
                    finish_error(format!("malformed wire event: {e}")),
                )
                .await;
                return;
            }
        }
    }
}

async fn finish_with(tx: &mpsc::Sender<ChatChunk>, text_started: bool, finish: ChatChunk) {
    if text_started && tx.send(ChatChunk::TextEnd).await.is_err() {
        return;
    }
    let _ = tx.send(finish).await;
}

fn finish_error(message: String) -> ChatChunk {
    ChatChunk::Finish {
        reason: FinishReason::Error(message),
        usage: None,
    }
}
