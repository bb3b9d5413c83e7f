//! On-disk conversation cache.
//!
//! Threads are written as one JSON document. In-flight states do not
//! survive a restart: on load, `pending` user messages become `error` (they
//! may never have reached the server) and `streaming` replies are frozen as
//! confirmed with whatever content they had.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::CacheError;
use crate::types::{Conversation, MessageState, ThreadId};

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub active: Option<ThreadId>,
    #[serde(default)]
    pub threads: Vec<Conversation>,
}

impl CacheSnapshot {
    pub fn new(threads: Vec<Conversation>, active: Option<ThreadId>) -> Self {
        Self {
            version: CACHE_VERSION,
            active,
            threads,
        }
    }

    /// Settle every in-flight message. Returns how many were changed.
    fn normalize(&mut self) -> usize {
        let mut changed = 0;
        for message in self.threads.iter_mut().flat_map(|t| t.messages.iter_mut()) {
            let settled = match message.state() {
                MessageState::Pending => MessageState::Error,
                MessageState::Streaming => MessageState::Confirmed,
                other => other,
            };
            if settled != message.state() {
                message.set_state(settled);
                changed += 1;
            }
        }
        changed
    }
}

pub struct ConversationCache {
    path: PathBuf,
}

impl ConversationCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache. A missing file is an empty snapshot.
    pub fn load(&self) -> Result<CacheSnapshot, CacheError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no conversation cache at {}", self.path.display());
                return Ok(CacheSnapshot::new(Vec::new(), None));
            }
            Err(e) => return Err(e.into()),
        };

        let mut snapshot: CacheSnapshot = serde_json::from_str(&content)?;
        let settled = snapshot.normalize();
        info!(
            threads = snapshot.threads.len(),
            settled, "loaded conversation cache"
        );
        Ok(snapshot)
    }

    /// Write the snapshot through a temp file so a crash never leaves a
    /// truncated cache behind.
    pub fn save(&self, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        debug!(threads = snapshot.threads.len(), "saved conversation cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, MessageStatus};

    fn sample_thread() -> Conversation {
        let mut thread = Conversation::new();
        let tid = thread.id.clone();
        let mut sent = Message::pending_user(tid.clone(), "answered");
        sent.set_state(MessageState::Confirmed);
        thread.messages.push(sent);
        thread
            .messages
            .push(Message::assistant_reply(tid.clone(), "reply"));
        thread
            .messages
            .push(Message::pending_user(tid.clone(), "in flight"));
        let mut partial = Message::assistant_placeholder(tid);
        partial.start_streaming();
        partial.push_fragment("half a");
        thread.messages.push(partial);
        thread
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ConversationCache::new(tmp.path().join("conversations.json"));
        let snapshot = cache.load().unwrap();
        assert!(snapshot.threads.is_empty());
        assert!(snapshot.active.is_none());
    }

    #[test]
    fn load_settles_in_flight_messages() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ConversationCache::new(tmp.path().join("conversations.json"));
        let thread = sample_thread();
        let active = Some(thread.id.clone());
        cache
            .save(&CacheSnapshot::new(vec![thread.clone()], active.clone()))
            .unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.version, CACHE_VERSION);
        assert_eq!(loaded.active, active);
        let messages = &loaded.threads[0].messages;
        let statuses: Vec<MessageStatus> = messages.iter().map(|m| m.status()).collect();
        assert_eq!(
            statuses,
            vec![
                MessageStatus::Confirmed,
                MessageStatus::Confirmed,
                MessageStatus::Error,
                MessageStatus::Confirmed,
            ]
        );
        assert!(messages.iter().all(|m| !m.is_streaming()));
        assert_eq!(messages[3].content(), "half a");
        assert_eq!(loaded.threads[0].title, thread.title);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sub/conversations.json");
        let cache = ConversationCache::new(&path);
        cache.save(&CacheSnapshot::default()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_json_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("conversations.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConversationCache::new(path).load(),
            Err(CacheError::Json(_))
        ));
    }
}
