use serde::{Deserialize, Serialize};

use crate::attestation::{ExpectedMeasurements, TrustState};

/// Enclave capacity tier requested from the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Standard,
    Performance,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::Performance => f.write_str("performance"),
        }
    }
}

/// Endpoint identity and verification policy for one enclave assignment.
///
/// Immutable per generation: a model switch produces a whole new config with
/// a bumped `generation`, never an in-place edit.
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    /// Message transport endpoint (`ws://` or `wss://`).
    pub ws_endpoint: String,
    /// Quote endpoint. When absent it is derived from `ws_endpoint`.
    pub attestation_endpoint: Option<String>,
    /// Optional hex-encoded static public key pinned by the control plane.
    /// When absent the key comes from the verified quote.
    pub public_key: Option<String>,
    pub expected_measurements: ExpectedMeasurements,
    /// Policy switch: proceed on measurement mismatch with reduced trust.
    pub allow_unverified: bool,
    /// Monotone generation counter, bumped on every new assignment.
    pub generation: u64,
}

impl EnclaveConfig {
    /// Resolve the attestation endpoint, deriving it from the transport
    /// endpoint when the control plane did not provide one:
    /// `ws://host:8081` becomes `http://host:8080/attestation`.
    pub fn attestation_endpoint(&self) -> String {
        if let Some(ref endpoint) = self.attestation_endpoint {
            return endpoint.clone();
        }

        let http = self
            .ws_endpoint
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let http = if http.contains(":8081") {
            http.replace(":8081", ":8080")
        } else {
            http
        };

        format!("{}/attestation", http.trim_end_matches('/'))
    }
}

/// The product of a completed lifecycle transition: a config generation
/// together with its verification verdict and the attested channel key.
///
/// Published by the lifecycle manager; consumed by the protocol translator,
/// which builds one fresh secure session from it per inference request.
#[derive(Debug, Clone)]
pub struct TrustedConfig {
    pub config: EnclaveConfig,
    pub trust: TrustState,
    /// The enclave public key the channel is keyed to.
    pub enclave_key: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ws_endpoint: &str, attestation_endpoint: Option<&str>) -> EnclaveConfig {
        EnclaveConfig {
            ws_endpoint: ws_endpoint.to_string(),
            attestation_endpoint: attestation_endpoint.map(str::to_string),
            public_key: None,
            expected_measurements: ExpectedMeasurements::default(),
            allow_unverified: false,
            generation: 1,
        }
    }

    #[test]
    fn derives_attestation_endpoint_from_ws() {
        let c = config("ws://10.0.0.1:8081", None);
        assert_eq!(c.attestation_endpoint(), "http://10.0.0.1:8080/attestation");
    }

    #[test]
    fn derives_https_from_wss() {
        let c = config("wss://enclave.example.com:8081/", None);
        assert_eq!(
            c.attestation_endpoint(),
            "https://enclave.example.com:8080/attestation"
        );
    }

    #[test]
    fn explicit_attestation_endpoint_wins() {
        let c = config("ws://10.0.0.1:8081", Some("http://custom:9000/attest"));
        assert_eq!(c.attestation_endpoint(), "http://custom:9000/attest");
    }

    #[test]
    fn tier_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Standard).unwrap(), "\"standard\"");
        assert_eq!(
            serde_json::to_string(&Tier::Performance).unwrap(),
            "\"performance\""
        );
    }
}
