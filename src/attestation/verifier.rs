use std::collections::HashMap;
use std::sync::Arc;

use super::quote::AttestationQuote;
use super::{QuoteFetcher, TrustState};
use crate::config::EnclaveConfig;
use crate::error::AttestError;

/// The outcome of a successful verification pass.
///
/// `trust` is either [`TrustState::Verified`] or [`TrustState::Unverified`];
/// a quote that cannot produce at least `Unverified` yields an error instead.
#[derive(Debug, Clone)]
pub struct Attested {
    pub trust: TrustState,
    /// The attested public key that secure channels must be keyed to.
    pub enclave_key: [u8; 32],
    pub quote: AttestationQuote,
}

enum Verdict {
    Attested(Attested),
    Denied(String),
}

/// Verifies enclave attestation, at most once per config generation.
///
/// Both outcomes are cached: repeated inference requests against the same
/// generation reuse the verdict without re-fetching, and a failed generation
/// stays failed until a new assignment replaces it.
pub struct Verifier {
    fetcher: Arc<dyn QuoteFetcher>,
    cache: HashMap<u64, Verdict>,
}

impl Verifier {
    pub fn new(fetcher: Arc<dyn QuoteFetcher>) -> Self {
        Self {
            fetcher,
            cache: HashMap::new(),
        }
    }

    /// Fetch and verify the quote for `config`, or return the cached verdict
    /// for its generation.
    pub async fn ensure_verified(
        &mut self,
        config: &EnclaveConfig,
    ) -> Result<Attested, AttestError> {
        if let Some(verdict) = self.cache.get(&config.generation) {
            return match verdict {
                Verdict::Attested(attested) => Ok(attested.clone()),
                Verdict::Denied(reason) => Err(AttestError::VerificationFailed(reason.clone())),
            };
        }

        let result = self.verify(config).await;
        let verdict = match &result {
            Ok(attested) => Verdict::Attested(attested.clone()),
            Err(e) => Verdict::Denied(e.to_string()),
        };
        self.cache.insert(config.generation, verdict);
        result
    }

    /// Drop cached verdicts for generations older than `keep`.
    pub fn evict_before(&mut self, keep: u64) {
        self.cache.retain(|&generation, _| generation >= keep);
    }

    async fn verify(&self, config: &EnclaveConfig) -> Result<Attested, AttestError> {
        let endpoint = config.attestation_endpoint();
        let doc = self.fetcher.fetch(&endpoint).await?;
        let quote = AttestationQuote::parse(&doc)?;

        // A statically pinned key must match the attested one; disagreement
        // means we are not talking to the enclave the control plane assigned.
        if let Some(ref pinned) = config.public_key {
            if !pinned.eq_ignore_ascii_case(&hex::encode(quote.public_key)) {
                return Err(AttestError::MeasurementMismatch {
                    field: "public_key",
                    expected: pinned.to_lowercase(),
                    actual: hex::encode(quote.public_key),
                });
            }
        }

        match config.expected_measurements.verify(&quote.measurements) {
            Ok(()) => {
                tracing::info!(
                    generation = config.generation,
                    attestation_type = %quote.attestation_type,
                    enclave_key = %hex::encode(quote.public_key),
                    "attestation verified"
                );
                Ok(Attested {
                    trust: TrustState::Verified,
                    enclave_key: quote.public_key,
                    quote,
                })
            }
            Err(e) if config.allow_unverified => {
                tracing::warn!(
                    generation = config.generation,
                    error = %e,
                    "measurement mismatch, proceeding unverified per policy"
                );
                Ok(Attested {
                    trust: TrustState::Unverified,
                    enclave_key: quote.public_key,
                    quote,
                })
            }
            Err(e) => {
                tracing::warn!(
                    generation = config.generation,
                    error = %e,
                    "attestation verification failed"
                );
                Err(e)
            }
        }
    }
}
