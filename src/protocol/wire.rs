use serde::{Deserialize, Serialize};

/// One chat turn as the enclave expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// The request document sent through the secure channel.
#[derive(Debug, Clone, Serialize)]
pub struct WireRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Token accounting reported by the enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Unary response document.
#[derive(Debug, Clone, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

/// One streamed event inside the encrypted channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireEvent {
    TextDelta {
        delta: String,
    },
    Finish {
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_absent_fields() {
        let request = WireRequest {
            model: Some("llama-70b".to_string()),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            stream: true,
            temperature: None,
            max_tokens: Some(256),
            stop: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama-70b");
        assert_eq!(json["stream"], true);
        assert_eq!(json["max_tokens"], 256);
        assert!(json.get("temperature").is_none());
        assert!(json.get("stop").is_none());
    }

    #[test]
    fn text_delta_event_deserializes() {
        let event: WireEvent =
            serde_json::from_str(r#"{"type":"text-delta","delta":"Hel"}"#).unwrap();
        assert!(matches!(event, WireEvent::TextDelta { delta } if delta == "Hel"));
    }

    #[test]
    fn finish_event_deserializes_with_usage() {
        let event: WireEvent = serde_json::from_str(
            r#"{"type":"finish","finish_reason":"stop","usage":{"prompt_tokens":12,"completion_tokens":34}}"#,
        )
        .unwrap();
        match event {
            WireEvent::Finish {
                finish_reason,
                usage,
            } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(
                    usage,
                    Some(WireUsage {
                        prompt_tokens: 12,
                        completion_tokens: 34
                    })
                );
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let result = serde_json::from_str::<WireEvent>(r#"{"type":"tool-call","name":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unary_response_tolerates_missing_fields() {
        let response: WireResponse = serde_json::from_str(r#"{"content":"hello"}"#).unwrap();
        assert_eq!(response.content, "hello");
        assert!(response.finish_reason.is_none());
        assert!(response.error.is_none());
    }
}
