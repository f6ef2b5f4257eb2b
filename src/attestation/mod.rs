pub mod http;
pub mod quote;
pub mod verifier;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::AttestError;

pub use http::HttpQuoteFetcher;
pub use quote::{AttestationQuote, ExpectedMeasurements, QuoteDocument, QuoteMeasurements};
pub use verifier::{Attested, Verifier};

/// Client-visible verification status gating channel use.
///
/// A single authoritative value per config generation; transitions are owned
/// exclusively by the [`verifier::Verifier`] and the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    /// Vault locked or no private model selected; nothing to verify.
    Locked,
    /// Assignment or verification in progress.
    Connecting,
    /// Measurements matched the expected values.
    Verified,
    /// Measurements did not match, but policy allows proceeding.
    Unverified,
    /// Verification failed and policy forbids proceeding.
    Error,
}

impl TrustState {
    /// Whether a secure channel may be built in this state.
    pub fn permits_channel(self) -> bool {
        matches!(self, Self::Verified | Self::Unverified)
    }
}

/// Fetches quote documents from an enclave's attestation endpoint.
#[async_trait]
pub trait QuoteFetcher: Send + Sync {
    async fn fetch(&self, endpoint: &str) -> Result<QuoteDocument, AttestError>;
}
