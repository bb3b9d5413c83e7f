//! Error types and machine-readable error codes.
//!
//! Network-level failures (`ChannelError::Transport`) are handled inside the
//! channel by the reconnect path. Everything that reaches the conversation
//! store ends up as an `error`-status message the user can retry.

use crate::types::{MessageId, ThreadId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// `send()` was called while the connection was not OPEN.
    #[error("channel is not connected")]
    NotConnected,

    /// The reconnect policy ran out of attempts. Terminal until a manual
    /// `connect()` or `reconnect()`.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::Transport(_) => "transport_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("thread {thread_id} already streams message {active}")]
    Conflict {
        thread_id: ThreadId,
        active: MessageId,
    },

    #[error("message {0} is not the latest assistant message of its thread")]
    NotLatest(MessageId),

    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

impl StreamError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "stream_conflict",
            Self::NotLatest(_) => "stream_not_latest",
            Self::UnknownMessage(_) => "unknown_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("message {0} is not in an error state")]
    NotRetryable(MessageId),

    #[error("message content is empty")]
    EmptyMessage,
}

impl StoreError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownThread(_) => "unknown_thread",
            Self::UnknownMessage(_) => "unknown_message",
            Self::NotRetryable(_) => "not_retryable",
            Self::EmptyMessage => "empty_message",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    #[error("{field} must use {expected}, got {scheme}://")]
    UnsupportedScheme {
        field: &'static str,
        expected: &'static str,
        scheme: String,
    },

    #[error("reconnect_max_attempts must be at least 1")]
    NoReconnectAttempts,

    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache contents are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_error_codes() {
        assert_eq!(ChannelError::NotConnected.error_code(), "not_connected");
        assert_eq!(
            ChannelError::ReconnectExhausted { attempts: 5 }.error_code(),
            "reconnect_exhausted"
        );
        assert_eq!(
            ChannelError::Transport("reset".into()).error_code(),
            "transport_error"
        );
    }

    #[test]
    fn stream_conflict_names_thread() {
        let err = StreamError::Conflict {
            thread_id: ThreadId::from("t1"),
            active: MessageId::from("m1"),
        };
        assert_eq!(err.error_code(), "stream_conflict");
        assert!(err.to_string().contains("t1"));
    }

    #[test]
    fn store_error_codes() {
        assert_eq!(StoreError::EmptyMessage.error_code(), "empty_message");
        assert_eq!(
            StoreError::NotRetryable(MessageId::from("m1")).error_code(),
            "not_retryable"
        );
    }
}
