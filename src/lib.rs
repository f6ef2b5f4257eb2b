pub mod attestation;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod session;

#[cfg(feature = "mock")]
pub mod mock;

// Re-export key types at crate root for convenience.
pub use config::{EnclaveConfig, Tier, TrustedConfig};
pub use error::{AssignmentError, AttestError, ChannelError, Error, ProtocolError, Result};

pub use attestation::{QuoteFetcher, TrustState, Verifier};
pub use lifecycle::{AssignmentManager, ControlPlane, ManagerHandle, ManagerOptions, SelectedModel};
pub use protocol::{ChatChunk, ChatMessage, ChunkStream, FinishReason, InferenceClient, Usage};
pub use session::{Connector, SecureSession, SessionOptions};

#[cfg(feature = "mock")]
pub use mock::{MockConnector, MockControlPlane, MockEnclave, MockQuoteFetcher};
