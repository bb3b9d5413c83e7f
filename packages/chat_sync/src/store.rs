//! Optimistic conversation store.
//!
//! Owns every thread and message. User messages are appended as `pending`
//! before anything touches the network, then confirmed or marked `error`
//! as the outcome becomes known. Inbound envelopes are matched to threads
//! by `conversation_id` when the server sent one before. Otherwise they go
//! to the thread whose reply is in flight, then to the thread with the
//! oldest pending message, and only then to the active thread.
//!
//! Every mutation is synchronous and publishes a [`StoreEvent`] before the
//! call returns, so subscribers observe each intermediate streaming step.

use tracing::{debug, error, info, warn};

use crate::assembler::StreamAssembler;
use crate::channel::Outbound;
use crate::codec::{InboundEnvelope, OutboundEnvelope};
use crate::error::{ChannelError, StoreError};
use crate::router::{Router, SubscriptionId};
use crate::types::{Conversation, Message, MessageId, MessageState, Role, ThreadId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ThreadCreated {
        thread_id: ThreadId,
    },
    ThreadUpdated {
        thread_id: ThreadId,
        title: String,
        updated_at: String,
    },
    ThreadDeleted {
        thread_id: ThreadId,
    },
    ActiveThreadChanged {
        thread_id: Option<ThreadId>,
    },
    MessageAppended {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    MessageRemoved {
        thread_id: ThreadId,
        message_id: MessageId,
    },
}

/// Result of handing a user message to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub thread_id: ThreadId,
    pub message_id: MessageId,
    /// `Err` means the message is now in the `error` state.
    pub outcome: Result<(), ChannelError>,
}

#[derive(Debug)]
pub struct ConversationStore {
    user_id: String,
    threads: Vec<Conversation>,
    active: Option<ThreadId>,
    assembler: StreamAssembler,
    events: Router<StoreEvent>,
}

impl ConversationStore {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            threads: Vec::new(),
            active: None,
            assembler: StreamAssembler::new(),
            events: Router::new("store"),
        }
    }

    /// Rebuild from cached threads. The most recently updated thread becomes active.
    pub fn with_threads(user_id: impl Into<String>, threads: Vec<Conversation>) -> Self {
        let active = threads
            .iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at))
            .map(|t| t.id.clone());
        Self {
            threads,
            active,
            ..Self::new(user_id)
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&StoreEvent) -> anyhow::Result<()> + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // ── Read side ───────────────────────────────────────────────────────

    pub fn threads(&self) -> &[Conversation] {
        &self.threads
    }

    pub fn thread(&self, id: &ThreadId) -> Option<&Conversation> {
        self.threads.iter().find(|t| &t.id == id)
    }

    pub fn active_thread_id(&self) -> Option<&ThreadId> {
        self.active.as_ref()
    }

    pub fn active_thread(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.thread(id))
    }

    pub fn find_message(&self, id: &MessageId) -> Option<&Message> {
        self.threads.iter().find_map(|t| t.message(id))
    }

    /// The message currently streaming in `thread_id`, if any.
    pub fn streaming_message(&self, thread_id: &ThreadId) -> Option<&MessageId> {
        self.assembler.active(thread_id)
    }

    // ── Threads ─────────────────────────────────────────────────────────

    /// Create a thread and make it active.
    pub fn create_thread(&mut self) -> ThreadId {
        let thread = Conversation::new();
        let thread_id = thread.id.clone();
        self.threads.push(thread);
        info!(thread_id = %thread_id, "thread created");
        self.publish(StoreEvent::ThreadCreated {
            thread_id: thread_id.clone(),
        });
        self.set_active(Some(thread_id.clone()));
        thread_id
    }

    pub fn set_active_thread(&mut self, id: &ThreadId) -> Result<(), StoreError> {
        if self.thread(id).is_none() {
            return Err(StoreError::UnknownThread(id.clone()));
        }
        self.set_active(Some(id.clone()));
        Ok(())
    }

    /// Remove a thread. An active stream in it is dropped first.
    pub fn delete_thread(&mut self, id: &ThreadId) -> Result<Conversation, StoreError> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| StoreError::UnknownThread(id.clone()))?;
        self.assembler.forget(id);
        let removed = self.threads.remove(idx);
        info!(thread_id = %id, "thread deleted");
        self.publish(StoreEvent::ThreadDeleted {
            thread_id: id.clone(),
        });
        if self.active.as_ref() == Some(id) {
            self.set_active(None);
        }
        Ok(removed)
    }

    /// The active thread, creating one if there is none.
    pub fn ensure_active_thread(&mut self) -> ThreadId {
        match self.active_index() {
            Some(idx) => self.threads[idx].id.clone(),
            None => self.create_thread(),
        }
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Append an optimistic `pending` user message to the active thread.
    pub fn append_pending(&mut self, content: &str) -> Result<(ThreadId, MessageId), StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        let thread_id = self.ensure_active_thread();
        let message = Message::pending_user(thread_id.clone(), content);
        let message_id = message.id().clone();
        self.push_message(&thread_id, message)?;
        Ok((thread_id, message_id))
    }

    /// Append a pending user message and transmit it.
    ///
    /// A transmit failure marks the message `error` and is reported in the
    /// receipt; nothing is retried. Success leaves the message `pending`
    /// until the reply arrives through [`reconcile`](Self::reconcile).
    pub fn send_message(
        &mut self,
        content: &str,
        outbound: &mut dyn Outbound,
    ) -> Result<SendReceipt, StoreError> {
        let (thread_id, message_id) = self.append_pending(content)?;
        Ok(self.transmit(thread_id, message_id, outbound))
    }

    /// Re-send an `error` message as a fresh pending message.
    pub fn retry(
        &mut self,
        message_id: &MessageId,
        outbound: &mut dyn Outbound,
    ) -> Result<SendReceipt, StoreError> {
        let (thread_id, fresh_id) = self.stage_retry(message_id)?;
        Ok(self.transmit(thread_id, fresh_id, outbound))
    }

    /// Replace an `error` message with a fresh pending copy at the end of
    /// its thread, without transmitting. Makes that thread active.
    pub fn stage_retry(&mut self, message_id: &MessageId) -> Result<(ThreadId, MessageId), StoreError> {
        let idx = self
            .thread_index_of_message(message_id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.clone()))?;
        let thread = &mut self.threads[idx];
        let pos = thread
            .messages
            .iter()
            .position(|m| m.id() == message_id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.clone()))?;
        let original = &thread.messages[pos];
        if original.state() != MessageState::Error || original.role() != Role::User {
            return Err(StoreError::NotRetryable(message_id.clone()));
        }

        let removed = thread.messages.remove(pos);
        let thread_id = thread.id.clone();
        let fresh = Message::pending_user(thread_id.clone(), removed.content());
        let fresh_id = fresh.id().clone();
        info!(old = %message_id, new = %fresh_id, "retrying message");
        self.publish(StoreEvent::MessageRemoved {
            thread_id: thread_id.clone(),
            message_id: message_id.clone(),
        });
        self.push_message(&thread_id, fresh)?;
        self.set_active(Some(thread_id.clone()));
        Ok((thread_id, fresh_id))
    }

    pub fn mark_error(&mut self, message_id: &MessageId) -> Result<(), StoreError> {
        self.set_message_state(message_id, MessageState::Error)
    }

    pub fn mark_confirmed(&mut self, message_id: &MessageId) -> Result<(), StoreError> {
        self.set_message_state(message_id, MessageState::Confirmed)
    }

    fn transmit(
        &mut self,
        thread_id: ThreadId,
        message_id: MessageId,
        outbound: &mut dyn Outbound,
    ) -> SendReceipt {
        let content = self
            .find_message(&message_id)
            .map(|m| m.content().to_string())
            .unwrap_or_default();
        let envelope = OutboundEnvelope::new(content, self.user_id.clone());
        let outcome = outbound.send(&envelope);
        if let Err(ref e) = outcome {
            warn!(message_id = %message_id, code = e.error_code(), "send failed: {e}");
            if let Err(err) = self.mark_error(&message_id) {
                error!("failed to mark message as error: {err}");
            }
        } else {
            debug!(message_id = %message_id, "message transmitted");
        }
        SendReceipt {
            thread_id,
            message_id,
            outcome,
        }
    }

    // ── Receiving ───────────────────────────────────────────────────────

    /// Merge one inbound envelope into local state.
    pub fn reconcile(&mut self, envelope: &InboundEnvelope) {
        let idx = self.resolve_thread(envelope.conversation_id.as_deref());
        let thread_id = self.threads[idx].id.clone();

        if let Some(ref reason) = envelope.error {
            self.apply_remote_error(idx, reason);
            return;
        }

        // The user cancelled this reply; swallow the rest of it.
        if let Some(cancelled) = self.assembler.cancelled(&thread_id).cloned() {
            let thread = &mut self.threads[idx];
            self.assembler
                .append_chunk(thread, &cancelled, &envelope.response);
            if envelope.is_final() {
                self.assembler.clear_cancelled(&thread_id);
            }
            debug!(thread_id = %thread_id, "dropping fragment of cancelled reply");
            return;
        }

        self.confirm_oldest_pending(idx);

        let active = self.assembler.active(&thread_id).cloned();
        match active {
            Some(message_id) => {
                let thread = &mut self.threads[idx];
                self.assembler
                    .append_chunk(thread, &message_id, &envelope.response);
                if envelope.is_final() {
                    self.assembler.end_stream(thread, &message_id);
                }
                self.publish_message_update(idx, &message_id);
            }
            None if !envelope.is_final() => {
                let placeholder = Message::assistant_placeholder(thread_id.clone());
                let message_id = placeholder.id().clone();
                let thread = &mut self.threads[idx];
                thread.messages.push(placeholder);
                if let Err(e) = self.assembler.begin_stream(thread, &message_id) {
                    error!(code = e.error_code(), "cannot start stream: {e}");
                    return;
                }
                self.assembler
                    .append_chunk(thread, &message_id, &envelope.response);
                let snapshot = thread.messages.last().cloned();
                if let Some(message) = snapshot {
                    self.publish(StoreEvent::MessageAppended { message });
                }
            }
            None => {
                let reply = Message::assistant_reply(thread_id.clone(), envelope.response.clone());
                self.threads[idx].messages.push(reply.clone());
                self.publish(StoreEvent::MessageAppended { message: reply });
            }
        }

        self.touch_thread(idx);
    }

    /// Complete an exchange that went through the REST fallback.
    pub fn complete_exchange(
        &mut self,
        message_id: &MessageId,
        response: &str,
    ) -> Result<(), StoreError> {
        let idx = self
            .thread_index_of_message(message_id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.clone()))?;
        self.mark_confirmed(message_id)?;
        let thread_id = self.threads[idx].id.clone();
        let reply = Message::assistant_reply(thread_id, response);
        self.threads[idx].messages.push(reply.clone());
        self.publish(StoreEvent::MessageAppended { message: reply });
        self.touch_thread(idx);
        Ok(())
    }

    // ── Streams ─────────────────────────────────────────────────────────

    /// Cancel the stream in the active thread, keeping its content.
    pub fn cancel_stream(&mut self) -> Option<MessageId> {
        let thread_id = self.active.clone()?;
        self.cancel_stream_in(&thread_id)
    }

    pub fn cancel_stream_in(&mut self, thread_id: &ThreadId) -> Option<MessageId> {
        let idx = self.index_of(thread_id)?;
        let message_id = self.assembler.active(thread_id).cloned()?;
        if !self.assembler.cancel(&mut self.threads[idx], &message_id) {
            return None;
        }
        info!(thread_id = %thread_id, message_id = %message_id, "stream cancelled");
        self.publish_message_update(idx, &message_id);
        Some(message_id)
    }

    /// The connection dropped: freeze every active stream and forget
    /// cancelled replies, since the server will not continue them.
    pub fn interrupt_streams(&mut self) -> usize {
        let mut interrupted = 0;
        for idx in 0..self.threads.len() {
            let thread_id = self.threads[idx].id.clone();
            self.assembler.clear_cancelled(&thread_id);
            let Some(message_id) = self.assembler.active(&thread_id).cloned() else {
                continue;
            };
            if self.assembler.end_stream(&mut self.threads[idx], &message_id) {
                interrupted += 1;
                self.publish_message_update(idx, &message_id);
            }
        }
        if interrupted > 0 {
            warn!(count = interrupted, "streams interrupted by disconnect");
        }
        interrupted
    }

    /// Mark every pending user message as `error` so the user can retry.
    /// Used once the channel has given up reconnecting.
    pub fn fail_pending(&mut self) -> usize {
        self.interrupt_streams();
        let pending: Vec<MessageId> = self
            .threads
            .iter()
            .flat_map(|t| t.messages.iter())
            .filter(|m| m.role() == Role::User && m.state() == MessageState::Pending)
            .map(|m| m.id().clone())
            .collect();
        for id in &pending {
            if let Err(e) = self.mark_error(id) {
                error!("failed to mark pending message as error: {e}");
            }
        }
        pending.len()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn publish(&mut self, event: StoreEvent) {
        self.events.publish(&event);
    }

    fn publish_message_update(&mut self, idx: usize, message_id: &MessageId) {
        if let Some(message) = self.threads[idx].message(message_id).cloned() {
            self.publish(StoreEvent::MessageUpdated { message });
        }
    }

    fn set_active(&mut self, thread_id: Option<ThreadId>) {
        if self.active == thread_id {
            return;
        }
        self.active = thread_id.clone();
        self.publish(StoreEvent::ActiveThreadChanged { thread_id });
    }

    fn index_of(&self, id: &ThreadId) -> Option<usize> {
        self.threads.iter().position(|t| &t.id == id)
    }

    fn active_index(&self) -> Option<usize> {
        self.active.as_ref().and_then(|id| self.index_of(id))
    }

    fn thread_index_of_message(&self, message_id: &MessageId) -> Option<usize> {
        self.threads
            .iter()
            .position(|t| t.message(message_id).is_some())
    }

    fn push_message(&mut self, thread_id: &ThreadId, message: Message) -> Result<(), StoreError> {
        let idx = self
            .index_of(thread_id)
            .ok_or_else(|| StoreError::UnknownThread(thread_id.clone()))?;
        self.threads[idx].messages.push(message.clone());
        self.publish(StoreEvent::MessageAppended { message });
        self.touch_thread(idx);
        Ok(())
    }

    fn set_message_state(&mut self, message_id: &MessageId, state: MessageState) -> Result<(), StoreError> {
        let idx = self
            .thread_index_of_message(message_id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.clone()))?;
        let message = self.threads[idx]
            .message_mut(message_id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.clone()))?;
        if message.state() == state {
            return Ok(());
        }
        message.set_state(state);
        let snapshot = message.clone();
        self.publish(StoreEvent::MessageUpdated { message: snapshot });
        Ok(())
    }

    fn touch_thread(&mut self, idx: usize) {
        let thread = &mut self.threads[idx];
        thread.refresh_title();
        thread.touch();
        let event = StoreEvent::ThreadUpdated {
            thread_id: thread.id.clone(),
            title: thread.title.clone(),
            updated_at: thread.updated_at.clone(),
        };
        self.publish(event);
    }

    /// Pick the thread an inbound envelope belongs to.
    fn resolve_thread(&mut self, conversation_id: Option<&str>) -> usize {
        if let Some(cid) = conversation_id {
            if let Some(idx) = self
                .threads
                .iter()
                .position(|t| t.server_id.as_deref() == Some(cid))
            {
                return idx;
            }
        }

        let idx = match self.awaiting_reply_index().or_else(|| self.active_index()) {
            Some(idx) => idx,
            None => {
                let id = self.create_thread();
                self.index_of(&id).unwrap_or(self.threads.len() - 1)
            }
        };
        if let Some(cid) = conversation_id {
            let thread = &mut self.threads[idx];
            if thread.server_id.is_none() {
                debug!(thread_id = %thread.id, conversation_id = cid, "bound server conversation");
                thread.server_id = Some(cid.to_string());
            }
        }
        idx
    }

    /// The thread an unlabelled frame continues: one with a reply in
    /// flight, else the one holding the oldest pending user message.
    fn awaiting_reply_index(&self) -> Option<usize> {
        let in_flight = self.threads.iter().position(|t| {
            self.assembler.active(&t.id).is_some() || self.assembler.cancelled(&t.id).is_some()
        });
        in_flight.or_else(|| {
            self.threads
                .iter()
                .enumerate()
                .filter_map(|(idx, t)| t.oldest_pending_user().map(|m| (idx, m.timestamp())))
                .min_by(|a, b| a.1.cmp(b.1))
                .map(|(idx, _)| idx)
        })
    }

    fn confirm_oldest_pending(&mut self, idx: usize) {
        let pending = self.threads[idx].oldest_pending_user().map(|m| m.id().clone());
        if let Some(id) = pending {
            if let Err(e) = self.mark_confirmed(&id) {
                error!("failed to confirm message: {e}");
            }
        }
    }

    fn apply_remote_error(&mut self, idx: usize, reason: &str) {
        let thread_id = self.threads[idx].id.clone();
        warn!(thread_id = %thread_id, "assistant reported an error: {reason}");

        if let Some(message_id) = self.assembler.active(&thread_id).cloned() {
            self.assembler.end_stream(&mut self.threads[idx], &message_id);
            self.publish_message_update(idx, &message_id);
        }
        let pending = self.threads[idx].oldest_pending_user().map(|m| m.id().clone());
        match pending {
            Some(id) => {
                if let Err(e) = self.mark_error(&id) {
                    error!("failed to mark message as error: {e}");
                }
            }
            None => debug!(thread_id = %thread_id, "error frame without a pending message"),
        }
        self.touch_thread(idx);
    }
}
