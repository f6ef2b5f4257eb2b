use crate::attestation::TrustState;

/// Errors from attestation fetch and verification.
///
/// Fatal for the current config generation: a failed verification is never
/// retried automatically, only a new assignment produces a new generation.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("attestation fetch failed: {0}")]
    FetchFailed(String),

    #[error("invalid attestation document: {0}")]
    InvalidDocument(String),

    #[error("quote too short: {len} bytes (min {min})")]
    QuoteTooShort { len: usize, min: usize },

    #[error("{field} mismatch: expected {expected}, got {actual}")]
    MeasurementMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("report data does not bind the enclave public key")]
    PublicKeyBindingMismatch,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

/// Errors from control-plane assignment operations.
///
/// Recoverable: the lifecycle manager absorbs these, backs off, and retries
/// on the next trigger. They never reach inference callers.
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("control plane rejected request: {0}")]
    Rejected(String),

    #[error("control plane unreachable: {0}")]
    Unreachable(String),

    #[error("invalid control plane response: {0}")]
    InvalidResponse(String),
}

/// Errors from secure channel establishment and transport.
///
/// Fail only the current inference call; cached attestation stays valid.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no active enclave assignment")]
    NotReady,

    #[error("trust state {0:?} does not permit a channel")]
    NotPermitted(TrustState),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("cipher operation failed: {0}")]
    Crypto(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    Closed,

    #[error("operation timed out")]
    Timeout,
}

/// Errors from wire protocol translation.
///
/// Never propagated raw out of a stream: the translator converts these into
/// a terminal `Finish` chunk carrying an error reason.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode wire request: {0}")]
    Encode(String),

    #[error("malformed wire event: {0}")]
    MalformedEvent(String),

    #[error("unexpected wire event: {0}")]
    UnexpectedEvent(String),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Attestation(#[from] AttestError),

    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, Error>;
