use std::time::Duration;

use async_trait::async_trait;

use super::{QuoteDocument, QuoteFetcher};
use crate::error::AttestError;

/// Default timeout for the attestation fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fetches quote documents over HTTP(S).
pub struct HttpQuoteFetcher {
    client: reqwest::Client,
}

impl HttpQuoteFetcher {
    pub fn new() -> Self {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("default TLS backend is available");
        Self { client }
    }
}

impl Default for HttpQuoteFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuoteFetcher for HttpQuoteFetcher {
    async fn fetch(&self, endpoint: &str) -> Result<QuoteDocument, AttestError> {
        tracing::debug!(endpoint, "fetching attestation quote");

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| AttestError::FetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AttestError::FetchFailed(format!(
                "attestation endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<QuoteDocument>()
            .await
            .map_err(|e| AttestError::InvalidDocument(e.to_string()))
    }
}
