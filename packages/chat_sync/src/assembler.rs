//! Streaming assembler.
//!
//! Tracks which assistant message is currently growing in each thread and
//! applies fragments to it. At most one stream is active per thread, and it
//! is always the last message of that thread. Once a stream ends or is
//! cancelled its content is frozen; later fragments for it are no-ops.

use std::collections::HashMap;
use tracing::debug;

use crate::error::StreamError;
use crate::types::{Conversation, MessageId, MessageState, Role, ThreadId};

#[derive(Debug, Default)]
pub struct StreamAssembler {
    active: HashMap<ThreadId, MessageId>,
    /// Streams the user cancelled whose server reply has not finished yet.
    cancelled: HashMap<ThreadId, MessageId>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, thread_id: &ThreadId) -> Option<&MessageId> {
        self.active.get(thread_id)
    }

    pub fn cancelled(&self, thread_id: &ThreadId) -> Option<&MessageId> {
        self.cancelled.get(thread_id)
    }

    /// Mark `message_id` as streaming with empty content.
    ///
    /// The message must be the thread's last message and an assistant
    /// message. A second stream on the same thread is a [`StreamError::Conflict`].
    pub fn begin_stream(
        &mut self,
        thread: &mut Conversation,
        message_id: &MessageId,
    ) -> Result<(), StreamError> {
        if let Some(active) = self.active.get(&thread.id) {
            return Err(StreamError::Conflict {
                thread_id: thread.id.clone(),
                active: active.clone(),
            });
        }
        let last = thread
            .messages
            .last_mut()
            .ok_or_else(|| StreamError::UnknownMessage(message_id.clone()))?;
        if last.id() != message_id {
            return if thread.message(message_id).is_some() {
                Err(StreamError::NotLatest(message_id.clone()))
            } else {
                Err(StreamError::UnknownMessage(message_id.clone()))
            };
        }
        if last.role() != Role::Assistant {
            return Err(StreamError::NotLatest(message_id.clone()));
        }

        last.start_streaming();
        self.cancelled.remove(&thread.id);
        self.active.insert(thread.id.clone(), message_id.clone());
        debug!(thread_id = %thread.id, message_id = %message_id, "stream started");
        Ok(())
    }

    /// Append a fragment to the active stream. Returns false (and changes
    /// nothing) if `message_id` is not the thread's active stream.
    pub fn append_chunk(
        &mut self,
        thread: &mut Conversation,
        message_id: &MessageId,
        fragment: &str,
    ) -> bool {
        if self.active.get(&thread.id) != Some(message_id) {
            debug!(message_id = %message_id, "ignoring fragment for inactive stream");
            return false;
        }
        thread
            .message_mut(message_id)
            .is_some_and(|m| m.push_fragment(fragment))
    }

    /// Finish the active stream; content becomes final.
    pub fn end_stream(&mut self, thread: &mut Conversation, message_id: &MessageId) -> bool {
        if self.active.get(&thread.id) != Some(message_id) {
            return false;
        }
        self.active.remove(&thread.id);
        if let Some(message) = thread.message_mut(message_id) {
            message.set_state(MessageState::Confirmed);
        }
        debug!(thread_id = %thread.id, message_id = %message_id, "stream ended");
        true
    }

    /// Stop the stream immediately, keeping what has accumulated.
    pub fn cancel(&mut self, thread: &mut Conversation, message_id: &MessageId) -> bool {
        if !self.end_stream(thread, message_id) {
            return false;
        }
        self.cancelled.insert(thread.id.clone(), message_id.clone());
        debug!(thread_id = %thread.id, message_id = %message_id, "stream cancelled");
        true
    }

    /// The server finished the reply a cancelled stream belonged to.
    pub fn clear_cancelled(&mut self, thread_id: &ThreadId) -> Option<MessageId> {
        self.cancelled.remove(thread_id)
    }

    /// Forget everything about a thread (thread deleted).
    pub fn forget(&mut self, thread_id: &ThreadId) {
        self.active.remove(thread_id);
        self.cancelled.remove(thread_id);
    }
}
