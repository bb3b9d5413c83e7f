use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Title a thread carries until its first message arrives.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Titles derived from the first message are cut to this many characters.
const TITLE_MAX_CHARS: usize = 40;

/// Current time as an ISO-8601 string with millisecond precision (`...Z`).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Locally generated identifier of a conversation thread.
    ThreadId
);
string_id!(
    /// Identifier of a message, unique within its thread.
    MessageId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Delivery status as the UI sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Confirmed,
    Error,
}

/// Internal lifecycle of a message.
///
/// `Streaming` is its own state so that "streaming and error" cannot be
/// represented. It reports as [`MessageStatus::Pending`] with `streaming = true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Streaming,
    Confirmed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    conversation_id: ThreadId,
    role: Role,
    content: String,
    timestamp: String,
    state: MessageState,
}

impl Message {
    /// An optimistic user message, not yet confirmed by the server.
    pub fn pending_user(conversation_id: ThreadId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role: Role::User,
            content: content.into(),
            timestamp: now_iso(),
            state: MessageState::Pending,
        }
    }

    /// A complete, non-streamed assistant reply.
    pub fn assistant_reply(conversation_id: ThreadId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role: Role::Assistant,
            content: content.into(),
            timestamp: now_iso(),
            state: MessageState::Confirmed,
        }
    }

    /// An empty assistant message waiting for its first streamed fragment.
    pub fn assistant_placeholder(conversation_id: ThreadId) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            role: Role::Assistant,
            content: String::new(),
            timestamp: now_iso(),
            state: MessageState::Pending,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn conversation_id(&self) -> &ThreadId {
        &self.conversation_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn status(&self) -> MessageStatus {
        match self.state {
            MessageState::Pending | MessageState::Streaming => MessageStatus::Pending,
            MessageState::Confirmed => MessageStatus::Confirmed,
            MessageState::Error => MessageStatus::Error,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state == MessageState::Streaming
    }

    pub(crate) fn set_state(&mut self, state: MessageState) {
        self.state = state;
    }

    /// Clears content and enters the streaming state.
    pub(crate) fn start_streaming(&mut self) {
        self.content.clear();
        self.state = MessageState::Streaming;
    }

    /// Appends a fragment. Content is frozen once streaming ends, so this
    /// returns false for any message that is not currently streaming.
    pub(crate) fn push_fragment(&mut self, fragment: &str) -> bool {
        if self.state != MessageState::Streaming {
            return false;
        }
        self.content.push_str(fragment);
        true
    }
}

/// A conversation thread. Owned by the store; the UI only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ThreadId,
    pub title: String,
    pub updated_at: String,
    /// `conversation_id` the server reported for this thread, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: ThreadId::generate(),
            title: DEFAULT_TITLE.to_string(),
            updated_at: now_iso(),
            server_id: None,
            messages: Vec::new(),
        }
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub(crate) fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Oldest user message still waiting for the server.
    pub fn oldest_pending_user(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User && m.state == MessageState::Pending)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_iso();
    }

    /// Derive the title from the first message if it still has the default.
    /// Returns true if the title changed.
    pub(crate) fn refresh_title(&mut self) -> bool {
        if self.title != DEFAULT_TITLE {
            return false;
        }
        let Some(first) = self.messages.first() else {
            return false;
        };
        let title = derive_title(first.content());
        if title.is_empty() {
            return false;
        }
        self.title = title;
        true
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// First line of `content`, whitespace-collapsed and cut to a readable length.
pub fn derive_title(content: &str) -> String {
    let line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        collapsed
    } else {
        let cut: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_reports_pending_status() {
        let mut msg = Message::assistant_placeholder(ThreadId::from("t"));
        msg.start_streaming();
        assert!(msg.is_streaming());
        assert_eq!(msg.status(), MessageStatus::Pending);
    }

    #[test]
    fn content_frozen_outside_streaming() {
        let mut msg = Message::assistant_reply(ThreadId::from("t"), "done");
        assert!(!msg.push_fragment(" more"));
        assert_eq!(msg.content(), "done");
    }

    #[test]
    fn start_streaming_clears_content() {
        let mut msg = Message::assistant_reply(ThreadId::from("t"), "old");
        msg.start_streaming();
        assert_eq!(msg.content(), "");
        assert!(msg.push_fragment("new"));
        assert_eq!(msg.content(), "new");
    }

    #[test]
    fn derive_title_short_and_long() {
        assert_eq!(derive_title("hello"), "hello");
        assert_eq!(derive_title("\n  first   line \nsecond"), "first line");
        let long = "a".repeat(60);
        let title = derive_title(&long);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn refresh_title_only_once() {
        let mut convo = Conversation::new();
        assert!(!convo.refresh_title());
        convo
            .messages
            .push(Message::pending_user(convo.id.clone(), "What is Rust?"));
        assert!(convo.refresh_title());
        assert_eq!(convo.title, "What is Rust?");

        convo.messages[0] = Message::pending_user(convo.id.clone(), "changed");
        assert!(!convo.refresh_title());
        assert_eq!(convo.title, "What is Rust?");
    }

    #[test]
    fn message_serializes_lowercase_role() {
        let msg = Message::pending_user(ThreadId::from("t1"), "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["state"], "pending");
        assert_eq!(json["conversation_id"], "t1");
    }

    #[test]
    fn now_iso_is_utc_millis() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
