use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::attestation::ExpectedMeasurements;
use crate::config::Tier;
use crate::error::AssignmentError;

/// Response to a successful enclave request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResponse {
    pub assignment_id: String,
    pub ws_endpoint: String,
    #[serde(default)]
    pub attestation_endpoint: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub expected_measurements: ExpectedMeasurements,
    #[serde(default)]
    pub allow_unverified: bool,
}

/// A live lease on one enclave instance.
///
/// Owned exclusively by the lifecycle manager; kept alive by heartbeats and
/// released explicitly on every exit path.
#[derive(Debug, Clone)]
pub struct EnclaveAssignment {
    pub assignment_id: String,
    pub model_id: String,
    pub tier: Tier,
    pub session_id: String,
    pub created_at: SystemTime,
}

/// Control-plane RPCs for the enclave fleet.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn request_enclave(
        &self,
        model_id: &str,
        tier: Tier,
        session_id: &str,
    ) -> Result<AssignmentResponse, AssignmentError>;

    async fn heartbeat(&self, assignment_id: &str) -> Result<(), AssignmentError>;

    async fn release_enclave(&self, assignment_id: &str) -> Result<(), AssignmentError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    model_id: &'a str,
    tier: Tier,
    session_id: &'a str,
}

/// HTTP control-plane client used in production.
pub struct HttpControlPlane {
    base_url: String,
    client: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("default TLS backend is available");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn map_send_error(e: reqwest::Error) -> AssignmentError {
        if e.is_timeout() || e.is_connect() {
            AssignmentError::Unreachable(e.to_string())
        } else {
            AssignmentError::Rejected(e.to_string())
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn request_enclave(
        &self,
        model_id: &str,
        tier: Tier,
        session_id: &str,
    ) -> Result<AssignmentResponse, AssignmentError> {
        let url = format!("{}/enclaves", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&RequestBody {
                model_id,
                tier,
                session_id,
            })
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            return Err(AssignmentError::Rejected(format!(
                "request returned {}",
                response.status()
            )));
        }

        response
            .json::<AssignmentResponse>()
            .await
            .map_err(|e| AssignmentError::InvalidResponse(e.to_string()))
    }

    async fn heartbeat(&self, assignment_id: &str) -> Result<(), AssignmentError> {
        let url = format!("{}/enclaves/{}/heartbeat", self.base_url, assignment_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            return Err(AssignmentError::Rejected(format!(
                "heartbeat returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn release_enclave(&self, assignment_id: &str) -> Result<(), AssignmentError> {
        let url = format!("{}/enclaves/{}/release", self.base_url, assignment_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            return Err(AssignmentError::Rejected(format!(
                "release returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
