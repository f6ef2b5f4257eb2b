pub mod chunks;
pub mod translate;
pub mod wire;

pub use chunks::{ChatChunk, ChunkStream, FinishReason, Usage};
pub use translate::{ChatMessage, Completion, GenerationParams, InferenceClient, Role};
pub use wire::{WireEvent, WireMessage, WireRequest, WireResponse, WireUsage};
