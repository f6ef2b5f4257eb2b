#![cfg(feature = "mock")]

//! Streaming and unary inference against an in-memory enclave.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use confidential_inference_client::attestation::ExpectedMeasurements;
use confidential_inference_client::config::Tier;
use confidential_inference_client::lifecycle::{AssignmentManager, ManagerHandle, ManagerOptions, SelectedModel};
use confidential_inference_client::mock::{
    MockConnector, MockControlPlane, MockEnclave, MockQuoteFetcher, MOCK_FAMILY_ID, MOCK_IMAGE_ID,
};
use confidential_inference_client::protocol::{
    ChatChunk, ChatMessage, FinishReason, GenerationParams, InferenceClient,
};
use confidential_inference_client::session::SessionOptions;
use confidential_inference_client::{ChannelError, Error, TrustState};

const DIGEST: [u8; 32] = [0xAB; 32];

fn matching_measurements() -> ExpectedMeasurements {
    ExpectedMeasurements {
        launch_digest: Some(hex::encode(DIGEST)),
        family_id: Some(hex::encode(MOCK_FAMILY_ID)),
        image_id: Some(hex::encode(MOCK_IMAGE_ID)),
        vmpl: Some(0),
        report_data_hash: None,
    }
}

struct Harness {
    enclave: Arc<MockEnclave>,
    fetcher: Arc<MockQuoteFetcher>,
    plane: Arc<MockControlPlane>,
    connector: Arc<MockConnector>,
    handle: ManagerHandle,
    client: InferenceClient,
}

/// Spin up manager + verified assignment + inference client.
async fn verified_harness(allow_unverified: bool, served_digest: [u8; 32]) -> Harness {
    let enclave = MockEnclave::new();
    enclave.set_script(vec![
        json!({"type": "text-delta", "delta": "Hel"}),
        json!({"type": "text-delta", "delta": "lo"}),
        json!({"type": "finish", "finish_reason": "stop",
               "usage": {"prompt_tokens": 7, "completion_tokens": 2}}),
    ]);

    let fetcher = MockQuoteFetcher::serving(enclave.quote_document(&served_digest));
    let plane = MockControlPlane::new();
    plane.set_expected_measurements(matching_measurements());
    plane.set_allow_unverified(allow_unverified);

    let handle = AssignmentManager::spawn(
        plane.clone(),
        fetcher.clone(),
        ManagerOptions::new("session-1"),
    );
    handle.set_unlocked(true).await;
    handle
        .select_model(Some(SelectedModel::new("llama-70b", Tier::Standard)))
        .await;

    let mut trust = handle.trust();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !trust.borrow().permits_channel() && *trust.borrow() != TrustState::Error {
            trust.changed().await.expect("manager alive");
        }
    })
    .await
    .expect("trust settled");

    let connector = MockConnector::new(enclave.clone());
    let client = InferenceClient::new(
        handle.config(),
        connector.clone(),
        SessionOptions::builder()
            .request_timeout(Duration::from_secs(2))
            .build()
            .unwrap(),
    );

    Harness {
        enclave,
        fetcher,
        plane,
        connector,
        handle,
        client,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("condition never held: {what}"));
}

fn prompt() -> Vec<ChatMessage> {
    vec![ChatMessage::user("hello")]
}

#[tokio::test]
async fn stream_yields_canonical_chunk_sequence() {
    let h = verified_harness(false, DIGEST).await;

    let stream = h
        .client
        .stream(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    let chunks = stream.collect().await;

    assert_eq!(
        chunks,
        vec![
            ChatChunk::StreamStart,
            ChatChunk::TextStart,
            ChatChunk::TextDelta {
                delta: "Hel".to_string()
            },
            ChatChunk::TextDelta {
                delta: "lo".to_string()
            },
            ChatChunk::TextEnd,
            ChatChunk::Finish {
                reason: FinishReason::Stop,
                usage: Some(confidential_inference_client::Usage {
                    prompt_tokens: 7,
                    completion_tokens: 2
                }),
            },
        ]
    );

    h.handle.shutdown().await;
}

/// N sequential requests reuse one attestation fetch but open and close N
/// distinct transport connections.
#[tokio::test]
async fn sessions_are_fresh_per_request_attestation_is_cached() {
    let h = verified_harness(false, DIGEST).await;

    for _ in 0..3 {
        let stream = h
            .client
            .stream(&prompt(), &GenerationParams::default())
            .await
            .unwrap();
        let chunks = stream.collect().await;
        assert!(chunks.last().unwrap().is_terminal());
    }

    assert_eq!(h.fetcher.fetches(), 1);
    assert_eq!(h.enclave.connections(), 3);
    wait_for(|| h.enclave.closed_connections() == 3, "all sessions closed").await;
    // One assignment served all three requests.
    assert_eq!(h.plane.requests(), 1);

    h.handle.shutdown().await;
}

#[tokio::test]
async fn unary_completion_roundtrip() {
    let h = verified_harness(false, DIGEST).await;
    h.enclave.set_script(vec![json!({
        "content": "The answer is 42.",
        "finish_reason": "stop",
        "usage": {"prompt_tokens": 5, "completion_tokens": 6}
    })]);

    let completion = h
        .client
        .complete(&prompt(), &GenerationParams::default())
        .await
        .unwrap();

    assert_eq!(completion.content, "The answer is 42.");
    assert_eq!(completion.reason, FinishReason::Stop);
    assert_eq!(completion.usage.unwrap().completion_tokens, 6);

    // The request document carried the expected shape.
    let received = h.enclave.received();
    assert_eq!(received[0]["stream"], false);
    assert_eq!(received[0]["messages"][0]["role"], "user");

    wait_for(|| h.enclave.closed_connections() == 1, "session closed").await;
    h.handle.shutdown().await;
}

#[tokio::test]
async fn unary_error_response_surfaces_as_error_reason() {
    let h = verified_harness(false, DIGEST).await;
    h.enclave
        .set_script(vec![json!({"content": "", "error": "model overloaded"})]);

    let completion = h
        .client
        .complete(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(
        completion.reason,
        FinishReason::Error("model overloaded".to_string())
    );

    h.handle.shutdown().await;
}

/// A malformed wire event terminates the stream with an error finish, never
/// a panic or a raw parse error.
#[tokio::test]
async fn malformed_event_terminates_with_error_finish() {
    let h = verified_harness(false, DIGEST).await;
    h.enclave.set_script(vec![
        json!({"type": "text-delta", "delta": "ok so far"}),
        json!({"type": "tool-call", "name": "rm -rf"}),
    ]);

    let stream = h
        .client
        .stream(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    let chunks = stream.collect().await;

    assert_eq!(chunks[0], ChatChunk::StreamStart);
    assert_eq!(chunks[1], ChatChunk::TextStart);
    assert_eq!(
        chunks[2],
        ChatChunk::TextDelta {
            delta: "ok so far".to_string()
        }
    );
    assert_eq!(chunks[3], ChatChunk::TextEnd);
    match &chunks[4] {
        ChatChunk::Finish {
            reason: FinishReason::Error(message),
            usage: None,
        } => assert!(message.contains("malformed"), "got: {message}"),
        other => panic!("expected error finish, got {other:?}"),
    }

    wait_for(|| h.enclave.closed_connections() == 1, "session closed").await;
    h.handle.shutdown().await;
}

/// An in-band error event becomes an error finish without a text block.
#[tokio::test]
async fn wire_error_event_terminates_stream() {
    let h = verified_harness(false, DIGEST).await;
    h.enclave
        .set_script(vec![json!({"type": "error", "message": "kv cache exhausted"})]);

    let stream = h
        .client
        .stream(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    let chunks = stream.collect().await;

    assert_eq!(
        chunks,
        vec![
            ChatChunk::StreamStart,
            ChatChunk::Finish {
                reason: FinishReason::Error("kv cache exhausted".to_string()),
                usage: None,
            },
        ]
    );

    h.handle.shutdown().await;
}

/// The enclave dying mid-stream yields an error finish; emitted deltas stay.
#[tokio::test]
async fn channel_drop_mid_stream_yields_error_finish() {
    let h = verified_harness(false, DIGEST).await;
    h.enclave
        .set_script(vec![json!({"type": "text-delta", "delta": "partial"})]);
    h.enclave.set_close_after_script(true);

    let stream = h
        .client
        .stream(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    let chunks = stream.collect().await;

    assert_eq!(
        chunks[2],
        ChatChunk::TextDelta {
            delta: "partial".to_string()
        }
    );
    assert_eq!(chunks[3], ChatChunk::TextEnd);
    assert!(matches!(
        chunks[4],
        ChatChunk::Finish {
            reason: FinishReason::Error(_),
            ..
        }
    ));

    h.handle.shutdown().await;
}

/// Dropping the consumer cancels the request; the session is still closed.
#[tokio::test]
async fn consumer_drop_still_closes_session() {
    let h = verified_harness(false, DIGEST).await;
    // More chunks than the stream buffer holds, so the pump is mid-flight
    // when the consumer walks away.
    let mut script: Vec<serde_json::Value> = (0..48)
        .map(|i| json!({"type": "text-delta", "delta": format!("t{i}")}))
        .collect();
    script.push(json!({"type": "finish", "finish_reason": "stop"}));
    h.enclave.set_script(script);

    let mut stream = h
        .client
        .stream(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(stream.next().await, Some(ChatChunk::StreamStart));
    drop(stream);

    wait_for(|| h.enclave.closed_connections() == 1, "session closed after drop").await;
    h.handle.shutdown().await;
}

/// Unverified-but-allowed trust still constructs sessions.
#[tokio::test]
async fn unverified_with_policy_builds_sessions() {
    let h = verified_harness(true, [0x00; 32]).await;
    assert_eq!(*h.handle.trust().borrow(), TrustState::Unverified);

    let stream = h
        .client
        .stream(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    let chunks = stream.collect().await;
    assert!(chunks.last().unwrap().is_terminal());
    assert_eq!(h.enclave.connections(), 1);

    h.handle.shutdown().await;
}

/// Verification failure without the policy means no session is ever built.
#[tokio::test]
async fn verification_error_blocks_sessions() {
    let h = verified_harness(false, [0x00; 32]).await;
    assert_eq!(*h.handle.trust().borrow(), TrustState::Error);

    let result = h.client.stream(&prompt(), &GenerationParams::default()).await;
    assert!(matches!(
        result,
        Err(Error::Channel(ChannelError::NotReady))
    ));
    assert_eq!(h.enclave.connections(), 0);

    h.handle.shutdown().await;
}

/// A connect failure fails only the current call; the next one succeeds and
/// the cached attestation is untouched.
#[tokio::test]
async fn connect_failure_is_per_request() {
    let h = verified_harness(false, DIGEST).await;

    h.connector.set_fail_connects(true);
    let result = h.client.stream(&prompt(), &GenerationParams::default()).await;
    assert!(matches!(
        result,
        Err(Error::Channel(ChannelError::ConnectFailed(_)))
    ));

    h.connector.set_fail_connects(false);
    let stream = h
        .client
        .stream(&prompt(), &GenerationParams::default())
        .await
        .unwrap();
    assert!(stream.collect().await.last().unwrap().is_terminal());

    assert_eq!(h.fetcher.fetches(), 1);
    assert_eq!(*h.handle.trust().borrow(), TrustState::Verified);

    h.handle.shutdown().await;
}
