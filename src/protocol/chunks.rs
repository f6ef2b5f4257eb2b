use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::mpsc;

use super::wire::WireUsage;

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    /// A reason the enclave reported that we do not model explicitly.
    Other(String),
    /// The stream was terminated by a channel or protocol failure.
    Error(String),
}

impl FinishReason {
    /// Map the enclave's `finish_reason` string. Absent means a normal stop.
    pub fn from_wire(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") => Self::Stop,
            Some("length") => Self::Length,
            Some(other) => Self::Other(other.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::Length => f.write_str("length"),
            Self::Other(reason) => f.write_str(reason),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Token usage attached to the terminal chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}

/// The canonical, provider-agnostic streaming event sequence:
/// `StreamStart → TextStart → TextDelta* → TextEnd → Finish`.
///
/// Delta ordering is exactly the wire order; usage and finish metadata only
/// ever appear on the terminal `Finish` chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatChunk {
    StreamStart,
    TextStart,
    TextDelta { delta: String },
    TextEnd,
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
}

impl ChatChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

/// Consumer handle for one streaming inference call.
///
/// Dropping it mid-stream cancels the request; the owning session is still
/// closed by the background task, and chunks already received stay valid.
pub struct ChunkStream {
    rx: mpsc::Receiver<ChatChunk>,
}

impl ChunkStream {
    pub(crate) fn new(rx: mpsc::Receiver<ChatChunk>) -> Self {
        Self { rx }
    }

    /// The next chunk, or `None` after the terminal chunk was delivered.
    pub async fn next(&mut self) -> Option<ChatChunk> {
        self.rx.recv().await
    }

    /// Drain the stream to completion, collecting every chunk.
    pub async fn collect(mut self) -> Vec<ChatChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk);
        }
        chunks
    }
}

impl futures_util::Stream for ChunkStream {
    type Item = ChatChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::from_wire(None), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire(Some("stop")), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire(Some("length")), FinishReason::Length);
        assert_eq!(
            FinishReason::from_wire(Some("content_filter")),
            FinishReason::Other("content_filter".to_string())
        );
    }

    #[test]
    fn chunk_serializes_with_kebab_tags() {
        let json = serde_json::to_value(ChatChunk::TextDelta {
            delta: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "text-delta");

        let json = serde_json::to_value(ChatChunk::StreamStart).unwrap();
        assert_eq!(json["type"], "stream-start");
    }

    #[tokio::test]
    async fn stream_yields_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = ChunkStream::new(rx);

        tx.send(ChatChunk::StreamStart).await.unwrap();
        tx.send(ChatChunk::Finish {
            reason: FinishReason::Stop,
            usage: None,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(ChatChunk::StreamStart));
        assert!(stream.next().await.unwrap().is_terminal());
        assert_eq!(stream.next().await, None);
    }
}
