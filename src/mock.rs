//! In-memory collaborators for development and testing.
//!
//! # Security Warning
//!
//! Nothing in this module performs real attestation or network I/O; it
//! exists so the pipeline can be exercised hermetically. Enable only via
//! `features = ["mock"]`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use snow::params::NoiseParams;
use snow::Builder;
use tokio::sync::mpsc;

use crate::attestation::{ExpectedMeasurements, QuoteDocument, QuoteFetcher};
use crate::config::Tier;
use crate::error::{AssignmentError, AttestError, ChannelError};
use crate::lifecycle::control_plane::{AssignmentResponse, ControlPlane};
use crate::session::handshake::NOISE_PATTERN;
use crate::session::transport::{Connector, MessageTransport};

/// Family id baked into mock quotes.
pub const MOCK_FAMILY_ID: &[u8; 16] = b"mock-family-id\x00\x00";
/// Image id baked into mock quotes.
pub const MOCK_IMAGE_ID: &[u8; 16] = b"mock-image-id\x00\x00\x00";

const REPORT_SIZE: usize = 1184;

/// Build a mock SEV-SNP report binding `public_key`, with the layout real
/// enclaves use: family id at 16, image id at 32, VMPL at 48, report data at
/// 80, launch measurement at 144.
pub fn mock_report(public_key: &[u8; 32], launch_digest: &[u8; 32]) -> Vec<u8> {
    let mut report = vec![0u8; REPORT_SIZE];
    report[0..4].copy_from_slice(&[0x02, 0x00, 0x00, 0x00]); // version 2
    report[16..32].copy_from_slice(MOCK_FAMILY_ID);
    report[32..48].copy_from_slice(MOCK_IMAGE_ID);

    let key_hash: [u8; 32] = Sha256::digest(public_key).into();
    report[80..112].copy_from_slice(&key_hash);
    report[144..176].copy_from_slice(launch_digest);
    report
}

/// Build the quote document an attestation endpoint would serve.
pub fn mock_quote_document(public_key: &[u8; 32], launch_digest: &[u8; 32]) -> QuoteDocument {
    let report = mock_report(public_key, launch_digest);
    let key_hash: [u8; 32] = Sha256::digest(public_key).into();
    QuoteDocument {
        quote: base64::engine::general_purpose::STANDARD.encode(&report),
        public_key: hex::encode(public_key),
        public_key_hash: Some(hex::encode(key_hash)),
        report_data: None,
        attestation_type: "mock-sev-snp".to_string(),
        timestamp: Some(1_700_000_000),
    }
}

// ---------------------------------------------------------------------------
// Quote fetcher
// ---------------------------------------------------------------------------

/// Quote fetcher serving a fixed document, with a fetch counter.
pub struct MockQuoteFetcher {
    document: Mutex<Option<QuoteDocument>>,
    fetches: AtomicU32,
}

impl MockQuoteFetcher {
    /// Serve the given document on every fetch.
    pub fn serving(document: QuoteDocument) -> Arc<Self> {
        Arc::new(Self {
            document: Mutex::new(Some(document)),
            fetches: AtomicU32::new(0),
        })
    }

    /// Fail every fetch, as an unreachable attestation endpoint would.
    pub fn offline() -> Arc<Self> {
        Arc::new(Self {
            document: Mutex::new(None),
            fetches: AtomicU32::new(0),
        })
    }

    pub fn set_document(&self, document: QuoteDocument) {
        *self.document.lock().unwrap() = Some(document);
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteFetcher for MockQuoteFetcher {
    async fn fetch(&self, _endpoint: &str) -> Result<QuoteDocument, AttestError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.document
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AttestError::FetchFailed("mock endpoint offline".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

/// Control plane with call counters and failure switches.
pub struct MockControlPlane {
    ws_endpoint: String,
    expected_measurements: Mutex<ExpectedMeasurements>,
    allow_unverified: AtomicBool,
    fail_requests: AtomicBool,
    fail_heartbeats: AtomicBool,
    next_id: AtomicU32,
    requests: AtomicU32,
    heartbeats: AtomicU32,
    releases: AtomicU32,
    requested_models: Mutex<Vec<String>>,
    released_ids: Mutex<Vec<String>>,
    ops: Mutex<Vec<String>>,
}

impl MockControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ws_endpoint: "ws://mock-enclave:8081".to_string(),
            expected_measurements: Mutex::new(ExpectedMeasurements::default()),
            allow_unverified: AtomicBool::new(false),
            fail_requests: AtomicBool::new(false),
            fail_heartbeats: AtomicBool::new(false),
            next_id: AtomicU32::new(0),
            requests: AtomicU32::new(0),
            heartbeats: AtomicU32::new(0),
            releases: AtomicU32::new(0),
            requested_models: Mutex::new(Vec::new()),
            released_ids: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
        })
    }

    pub fn set_expected_measurements(&self, expected: ExpectedMeasurements) {
        *self.expected_measurements.lock().unwrap() = expected;
    }

    pub fn set_allow_unverified(&self, allow: bool) {
        self.allow_unverified.store(allow, Ordering::SeqCst);
    }

    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> u32 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn requested_models(&self) -> Vec<String> {
        self.requested_models.lock().unwrap().clone()
    }

    pub fn released_ids(&self) -> Vec<String> {
        self.released_ids.lock().unwrap().clone()
    }

    /// Every RPC in arrival order, e.g. `["request:llama", "release:asgn-1"]`.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn request_enclave(
        &self,
        model_id: &str,
        _tier: Tier,
        _session_id: &str,
    ) -> Result<AssignmentResponse, AssignmentError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.requested_models
            .lock()
            .unwrap()
            .push(model_id.to_string());
        self.ops.lock().unwrap().push(format!("request:{model_id}"));

        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(AssignmentError::Rejected("no capacity".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AssignmentResponse {
            assignment_id: format!("asgn-{id}"),
            ws_endpoint: self.ws_endpoint.clone(),
            attestation_endpoint: None,
            public_key: None,
            expected_measurements: self.expected_measurements.lock().unwrap().clone(),
            allow_unverified: self.allow_unverified.load(Ordering::SeqCst),
        })
    }

    async fn heartbeat(&self, assignment_id: &str) -> Result<(), AssignmentError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.ops
            .lock()
            .unwrap()
            .push(format!("heartbeat:{assignment_id}"));
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(AssignmentError::Unreachable("mock heartbeat down".to_string()));
        }
        Ok(())
    }

    async fn release_enclave(&self, assignment_id: &str) -> Result<(), AssignmentError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.released_ids
            .lock()
            .unwrap()
            .push(assignment_id.to_string());
        self.ops
            .lock()
            .unwrap()
            .push(format!("release:{assignment_id}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport + enclave
// ---------------------------------------------------------------------------

/// In-memory message transport half backed by unbounded channels.
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// A connected pair of in-memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn send(&mut self, msg: Bytes) -> Result<(), ChannelError> {
        self.tx
            .as_ref()
            .ok_or(ChannelError::Closed)?
            .send(msg)
            .map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.tx.take();
        Ok(())
    }
}

/// In-memory enclave: a Noise NK responder that answers every request with a
/// scripted frame sequence, counting connections and closes.
pub struct MockEnclave {
    public_key: [u8; 32],
    private_key: Vec<u8>,
    script: Mutex<Vec<Vec<u8>>>,
    close_after_script: AtomicBool,
    connections: AtomicU32,
    closed: AtomicU32,
    received: Mutex<Vec<serde_json::Value>>,
}

impl MockEnclave {
    pub fn new() -> Arc<Self> {
        let params: NoiseParams = NOISE_PATTERN.parse().expect("pattern is valid");
        let keypair = Builder::new(params)
            .generate_keypair()
            .expect("keypair generation");
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&keypair.public);

        Arc::new(Self {
            public_key,
            private_key: keypair.private,
            script: Mutex::new(Vec::new()),
            close_after_script: AtomicBool::new(false),
            connections: AtomicU32::new(0),
            closed: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// The quote document this enclave's attestation endpoint would serve.
    pub fn quote_document(&self, launch_digest: &[u8; 32]) -> QuoteDocument {
        mock_quote_document(&self.public_key, launch_digest)
    }

    /// Frames (JSON documents) sent in order after each received request.
    pub fn set_script(&self, frames: Vec<serde_json::Value>) {
        *self.script.lock().unwrap() = frames
            .into_iter()
            .map(|v| serde_json::to_vec(&v).expect("json serializes"))
            .collect();
    }

    /// Drop the connection once the script has been sent, simulating an
    /// enclave that dies mid-stream.
    pub fn set_close_after_script(&self, close: bool) {
        self.close_after_script.store(close, Ordering::SeqCst);
    }

    /// Transport connections opened against this enclave.
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Transport connections the client has closed.
    pub fn closed_connections(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Decrypted request documents, in arrival order.
    pub fn received(&self) -> Vec<serde_json::Value> {
        self.received.lock().unwrap().clone()
    }

    async fn serve(self: Arc<Self>, mut transport: MemoryTransport) {
        let params: NoiseParams = NOISE_PATTERN.parse().expect("pattern is valid");
        let responder = Builder::new(params).local_private_key(&self.private_key);
        let mut hs = match responder.build_responder() {
            Ok(hs) => hs,
            Err(e) => {
                tracing::debug!(error = %e, "mock responder build failed");
                return;
            }
        };

        let mut buf = vec![0u8; 65536];

        let first = match transport.recv().await {
            Ok(Some(msg)) => msg,
            _ => return,
        };
        if hs.read_message(&first, &mut buf).is_err() {
            tracing::debug!("mock enclave: bad initiator message");
            return;
        }
        let len = match hs.write_message(&[], &mut buf) {
            Ok(len) => len,
            Err(_) => return,
        };
        if transport
            .send(Bytes::copy_from_slice(&buf[..len]))
            .await
            .is_err()
        {
            return;
        }
        let mut noise = match hs.into_transport_mode() {
            Ok(noise) => noise,
            Err(_) => return,
        };

        loop {
            match transport.recv().await {
                Ok(Some(ciphertext)) => {
                    let len = match noise.read_message(&ciphertext, &mut buf) {
                        Ok(len) => len,
                        Err(e) => {
                            tracing::debug!(error = %e, "mock enclave: decrypt failed");
                            break;
                        }
                    };
                    if let Ok(request) = serde_json::from_slice(&buf[..len]) {
                        self.received.lock().unwrap().push(request);
                    }

                    let frames = self.script.lock().unwrap().clone();
                    for frame in frames {
                        let mut out = vec![0u8; frame.len() + 64];
                        let n = match noise.write_message(&frame, &mut out) {
                            Ok(n) => n,
                            Err(_) => return,
                        };
                        if transport
                            .send(Bytes::copy_from_slice(&out[..n]))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }

                    if self.close_after_script.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector that dials [`MockEnclave`] instances in memory.
pub struct MockConnector {
    enclave: Arc<MockEnclave>,
    fail_connects: AtomicBool,
}

impl MockConnector {
    pub fn new(enclave: Arc<MockEnclave>) -> Arc<Self> {
        Arc::new(Self {
            enclave,
            fail_connects: AtomicBool::new(false),
        })
    }

    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Box<dyn MessageTransport>, ChannelError> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectFailed("mock enclave offline".to_string()));
        }
        self.enclave.connections.fetch_add(1, Ordering::SeqCst);
        let (client_side, server_side) = memory_pair();
        tokio::spawn(Arc::clone(&self.enclave).serve(server_side));
        Ok(Box::new(client_side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationQuote;

    #[test]
    fn mock_quote_parses_and_binds_key() {
        let key = [0x42u8; 32];
        let doc = mock_quote_document(&key, &[0xAB; 32]);
        let quote = AttestationQuote::parse(&doc).unwrap();
        assert_eq!(quote.public_key, key);
        assert_eq!(&quote.measurements.family_id[..], MOCK_FAMILY_ID);
        assert_eq!(&quote.measurements.image_id[..], MOCK_IMAGE_ID);
    }

    #[tokio::test]
    async fn mock_control_plane_counts_calls() {
        let plane = MockControlPlane::new();
        let response = plane
            .request_enclave("llama", Tier::Standard, "s-1")
            .await
            .unwrap();
        plane.heartbeat(&response.assignment_id).await.unwrap();
        plane.release_enclave(&response.assignment_id).await.unwrap();

        assert_eq!(plane.requests(), 1);
        assert_eq!(plane.heartbeats(), 1);
        assert_eq!(plane.releases(), 1);
        assert_eq!(plane.released_ids(), vec![response.assignment_id]);
    }
}
