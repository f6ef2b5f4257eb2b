use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AttestError;

/// Minimum size of an SEV-SNP attestation report.
pub const MIN_REPORT_SIZE: usize = 1184;

// Field offsets within the report.
const FAMILY_ID_OFFSET: usize = 16;
const IMAGE_ID_OFFSET: usize = 32;
const VMPL_OFFSET: usize = 48;
const REPORT_DATA_OFFSET: usize = 80;
const MEASUREMENT_OFFSET: usize = 144;

/// The attestation document served by an enclave's attestation endpoint.
///
/// The `quote` field carries the raw SEV-SNP report; `public_key` is the
/// enclave's static X25519 key, bound into the report via `report_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteDocument {
    /// Base64-encoded raw attestation report.
    pub quote: String,
    /// Hex-encoded enclave public key (32 bytes).
    pub public_key: String,
    /// Hex-encoded SHA-256 hash of the public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_hash: Option<String>,
    /// Hex-encoded report_data field, echoed for debugging. The value parsed
    /// out of `quote` is authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_data: Option<String>,
    /// Attestation flavor (e.g. "sev-snp", "mock-sev-snp").
    pub attestation_type: String,
    /// Unix timestamp of quote generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Measurement registers extracted from a raw report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteMeasurements {
    /// Launch measurement (48 bytes).
    pub launch_digest: [u8; 48],
    pub family_id: [u8; 16],
    pub image_id: [u8; 16],
    pub vmpl: u32,
    /// Report data: first 32 bytes are SHA-256 of the enclave public key.
    pub report_data: [u8; 64],
}

/// A parsed and structurally validated attestation quote.
#[derive(Debug, Clone)]
pub struct AttestationQuote {
    /// The enclave's attested public key.
    pub public_key: [u8; 32],
    pub measurements: QuoteMeasurements,
    pub attestation_type: String,
    pub timestamp: Option<u64>,
}

impl AttestationQuote {
    /// Parse a quote document: decode the raw report, extract the measurement
    /// set, and check that `report_data` binds the advertised public key.
    pub fn parse(doc: &QuoteDocument) -> Result<Self, AttestError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&doc.quote)
            .map_err(|e| AttestError::InvalidDocument(format!("quote is not valid base64: {e}")))?;

        if raw.len() < MIN_REPORT_SIZE {
            return Err(AttestError::QuoteTooShort {
                len: raw.len(),
                min: MIN_REPORT_SIZE,
            });
        }

        let key_bytes = hex::decode(&doc.public_key)
            .map_err(|e| AttestError::InvalidDocument(format!("public key is not valid hex: {e}")))?;
        let public_key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AttestError::InvalidDocument(format!(
                "public key must be 32 bytes, got {}",
                key_bytes.len()
            )))?;

        let mut launch_digest = [0u8; 48];
        let mut family_id = [0u8; 16];
        let mut image_id = [0u8; 16];
        let mut report_data = [0u8; 64];
        launch_digest.copy_from_slice(&raw[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + 48]);
        family_id.copy_from_slice(&raw[FAMILY_ID_OFFSET..FAMILY_ID_OFFSET + 16]);
        image_id.copy_from_slice(&raw[IMAGE_ID_OFFSET..IMAGE_ID_OFFSET + 16]);
        report_data.copy_from_slice(&raw[REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + 64]);
        let vmpl = u32::from_le_bytes(
            raw[VMPL_OFFSET..VMPL_OFFSET + 4]
                .try_into()
                .expect("slice is 4 bytes"),
        );

        // The first half of report_data must commit to the public key, otherwise
        // the key in the document is not the one the hardware measured.
        let key_hash: [u8; 32] = Sha256::digest(public_key).into();
        if report_data[..32] != key_hash {
            return Err(AttestError::PublicKeyBindingMismatch);
        }

        Ok(Self {
            public_key,
            measurements: QuoteMeasurements {
                launch_digest,
                family_id,
                image_id,
                vmpl,
                report_data,
            },
            attestation_type: doc.attestation_type.clone(),
            timestamp: doc.timestamp,
        })
    }
}

/// Expected measurement values delivered by the control plane.
///
/// Only the fields that are present are checked. `launch_digest` may cover a
/// prefix of the 48-byte register (deployments that fill it with a 32-byte
/// digest leave the tail zeroed).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedMeasurements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmpl: Option<u32>,
    /// SHA-256 over the full 64-byte report_data field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_data_hash: Option<String>,
}

impl ExpectedMeasurements {
    pub fn is_empty(&self) -> bool {
        self.launch_digest.is_none()
            && self.family_id.is_none()
            && self.image_id.is_none()
            && self.vmpl.is_none()
            && self.report_data_hash.is_none()
    }

    /// Verify all present expectations against the actual measurement set.
    pub fn verify(&self, actual: &QuoteMeasurements) -> Result<(), AttestError> {
        if let Some(ref expected) = self.launch_digest {
            verify_prefix("launch_digest", expected, &actual.launch_digest)?;
        }
        if let Some(ref expected) = self.family_id {
            verify_exact("family_id", expected, &actual.family_id)?;
        }
        if let Some(ref expected) = self.image_id {
            verify_exact("image_id", expected, &actual.image_id)?;
        }
        if let Some(expected) = self.vmpl {
            if expected != actual.vmpl {
                return Err(AttestError::MeasurementMismatch {
                    field: "vmpl",
                    expected: expected.to_string(),
                    actual: actual.vmpl.to_string(),
                });
            }
        }
        if let Some(ref expected) = self.report_data_hash {
            let digest: [u8; 32] = Sha256::digest(actual.report_data).into();
            verify_exact("report_data_hash", expected, &digest)?;
        }
        Ok(())
    }
}

fn decode_expected(field: &'static str, expected: &str) -> Result<Vec<u8>, AttestError> {
    hex::decode(expected)
        .map_err(|e| AttestError::InvalidDocument(format!("expected {field} is not valid hex: {e}")))
}

fn verify_exact(field: &'static str, expected: &str, actual: &[u8]) -> Result<(), AttestError> {
    let expected_bytes = decode_expected(field, expected)?;
    if expected_bytes != actual {
        return Err(AttestError::MeasurementMismatch {
            field,
            expected: expected.to_lowercase(),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

fn verify_prefix(field: &'static str, expected: &str, actual: &[u8]) -> Result<(), AttestError> {
    let expected_bytes = decode_expected(field, expected)?;
    if expected_bytes.is_empty() || expected_bytes.len() > actual.len() {
        return Err(AttestError::InvalidDocument(format!(
            "expected {field} must be 1..={} bytes, got {}",
            actual.len(),
            expected_bytes.len()
        )));
    }
    if expected_bytes != actual[..expected_bytes.len()] {
        return Err(AttestError::MeasurementMismatch {
            field,
            expected: expected.to_lowercase(),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}
