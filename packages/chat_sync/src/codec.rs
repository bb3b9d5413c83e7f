//! Wire envelopes.
//!
//! One JSON object per text frame. Outbound:
//! `{"message": string, "user_id": string, "timestamp": ISO-8601}`.
//! Inbound: `{"response": string, "conversation_id"?: string, "done"?: bool, "error"?: string}`.
//!
//! The protocol is asymmetric, so there is no decode for outbound frames.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::types::now_iso;

/// A user-initiated send. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEnvelope {
    message: String,
    user_id: String,
    timestamp: String,
}

impl OutboundEnvelope {
    pub fn new(message: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::with_timestamp(message, user_id, now_iso())
    }

    pub fn with_timestamp(
        message: impl Into<String>,
        user_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            user_id: user_id.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

/// A validated server frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InboundEnvelope {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    /// Application-level failure reported by the assistant service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InboundEnvelope {
    pub fn reply(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            conversation_id: None,
            done: None,
            error: None,
        }
    }

    pub fn chunk(response: impl Into<String>, done: bool) -> Self {
        Self {
            done: Some(done),
            ..Self::reply(response)
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// True when this frame closes the reply: `done: true`, or no `done`
    /// flag at all (a non-streamed reply).
    pub fn is_final(&self) -> bool {
        self.done.unwrap_or(true)
    }
}

/// Serialize an outbound envelope into a text frame. Cannot fail.
pub fn encode(envelope: &OutboundEnvelope) -> String {
    serde_json::json!({
        "message": envelope.message,
        "user_id": envelope.user_id,
        "timestamp": envelope.timestamp,
    })
    .to_string()
}

/// Parse a text frame into an inbound envelope.
///
/// Anything that is not a JSON object with a string `response` is rejected
/// as [`DecodeError::Malformed`]; nothing partial is ever returned.
pub fn decode(frame: &str) -> Result<InboundEnvelope, DecodeError> {
    serde_json::from_str(frame).map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uses_wire_field_names() {
        let env = OutboundEnvelope::with_timestamp("hello", "u-1", "2026-01-02T03:04:05.678Z");
        let frame = encode(&env);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["message"], "hello");
        assert_eq!(value["user_id"], "u-1");
        assert_eq!(value["timestamp"], "2026-01-02T03:04:05.678Z");
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn encode_escapes_content() {
        let env = OutboundEnvelope::new("say \"hi\"\n{}", "u");
        let value: serde_json::Value = serde_json::from_str(&encode(&env)).unwrap();
        assert_eq!(value["message"], "say \"hi\"\n{}");
    }

    #[test]
    fn decode_full_frame() {
        let env =
            decode(r#"{"response":"pong","conversation_id":"c-9","done":true}"#).unwrap();
        assert_eq!(
            env,
            InboundEnvelope::chunk("pong", true).with_conversation("c-9")
        );
    }

    #[test]
    fn decode_minimal_frame() {
        let env = decode(r#"{"response":"hi"}"#).unwrap();
        assert_eq!(env, InboundEnvelope::reply("hi"));
        assert!(env.is_final());
    }

    #[test]
    fn decode_ignores_unknown_fields_and_nulls() {
        let env = decode(r#"{"response":"x","conversation_id":null,"extra":[1,2]}"#).unwrap();
        assert_eq!(env.conversation_id, None);
    }

    #[test]
    fn decode_error_frame() {
        let env = decode(r#"{"response":"","error":"model overloaded"}"#).unwrap();
        assert_eq!(env.error.as_deref(), Some("model overloaded"));
    }

    #[test]
    fn decode_truncated_json_is_malformed() {
        let err = decode(r#"{"response":"pa"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn decode_missing_response_is_malformed() {
        assert!(matches!(
            decode(r#"{"done":true}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decode_wrong_types_are_malformed() {
        for frame in [
            r#"{"response":42}"#,
            r#"{"response":"x","done":"yes"}"#,
            r#"["response","x"]"#,
            "not json",
            "",
        ] {
            assert!(
                matches!(decode(frame), Err(DecodeError::Malformed(_))),
                "expected malformed for {frame:?}"
            );
        }
    }

    #[test]
    fn streaming_chunk_is_not_final() {
        assert!(!InboundEnvelope::chunk("a", false).is_final());
        assert!(InboundEnvelope::chunk("a", true).is_final());
    }
}
