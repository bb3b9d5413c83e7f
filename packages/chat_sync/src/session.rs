//! Composition root: one channel, one store, optional REST fallback.
//!
//! The store is subscribed to the channel's inbound router, and to its
//! status router for disconnects and exhaustion. All of it runs inside a
//! single task; [`Session::run`] handles one command, channel event or REST
//! reply at a time, to completion.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::channel::{
    Channel, ChannelEvent, ChannelStatus, ConnectionState, Scheduler, TokioScheduler, Transport,
    WsTransport,
};
use crate::codec::OutboundEnvelope;
use crate::config::ClientConfig;
use crate::error::{ChannelError, StoreError};
use crate::rest::RestClient;
use crate::store::ConversationStore;
use crate::types::{MessageId, ThreadId};

/// User actions coming from the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Retry(MessageId),
    CancelStream,
    NewThread,
    SelectThread(ThreadId),
    DeleteThread(ThreadId),
    Connect,
    Disconnect,
    Reconnect,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Outcome of a message sent over HTTP.
#[derive(Debug)]
pub struct RestReply {
    pub message_id: MessageId,
    pub result: Result<String, ChannelError>,
}

pub struct Session<T, S> {
    channel: Channel<T, S>,
    store: Rc<RefCell<ConversationStore>>,
    rest: Option<RestClient>,
    token: Option<Arc<dyn TokenProvider>>,
    rest_tx: mpsc::UnboundedSender<RestReply>,
    rest_rx: mpsc::UnboundedReceiver<RestReply>,
}

impl Session<WsTransport, TokioScheduler> {
    /// Build a WebSocket session from validated config. The returned
    /// receiver carries transport and timer events for [`Session::run`].
    pub fn websocket(
        config: &ClientConfig,
        store: ConversationStore,
        token: Option<Arc<dyn TokenProvider>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut channel = Channel::new(
            config.ws_url.clone(),
            config.reconnect_policy(),
            WsTransport::new(events_tx.clone()),
            TokioScheduler::new(events_tx),
        );
        if let Some(ref provider) = token {
            channel = channel.with_token_provider(provider.clone());
        }

        let mut session = Session::new(channel, store);
        if config.rest_fallback {
            session = session.with_rest(RestClient::new(config.rest_url.clone())?, token);
        }
        Ok((session, events_rx))
    }
}

impl<T: Transport, S: Scheduler> Session<T, S> {
    pub fn new(mut channel: Channel<T, S>, store: ConversationStore) -> Self {
        let store = Rc::new(RefCell::new(store));

        let inbound_store = store.clone();
        channel.on_message(move |envelope| {
            inbound_store.try_borrow_mut()?.reconcile(envelope);
            Ok(())
        });

        let status_store = store.clone();
        channel.on_status(move |status| {
            match status {
                ChannelStatus::StateChanged(ConnectionState::Closed) => {
                    status_store.try_borrow_mut()?.interrupt_streams();
                }
                ChannelStatus::Failed(err @ ChannelError::ReconnectExhausted { .. }) => {
                    let failed = status_store.try_borrow_mut()?.fail_pending();
                    warn!(failed, code = err.error_code(), "giving up on pending messages");
                }
                _ => {}
            }
            Ok(())
        });

        let (rest_tx, rest_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            store,
            rest: None,
            token: None,
            rest_tx,
            rest_rx,
        }
    }

    /// Send over HTTP whenever the channel is not OPEN.
    pub fn with_rest(mut self, rest: RestClient, token: Option<Arc<dyn TokenProvider>>) -> Self {
        self.rest = Some(rest);
        self.token = token;
        self
    }

    pub fn store(&self) -> Rc<RefCell<ConversationStore>> {
        self.store.clone()
    }

    pub fn channel(&self) -> &Channel<T, S> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut Channel<T, S> {
        &mut self.channel
    }

    pub fn handle_command(&mut self, command: Command) -> Result<Flow, StoreError> {
        debug!(?command, "command");
        match command {
            Command::Send(content) => self.send(&content)?,
            Command::Retry(message_id) => self.retry(&message_id)?,
            Command::CancelStream => {
                if self.store.borrow_mut().cancel_stream().is_none() {
                    debug!("no active stream to cancel");
                }
            }
            Command::NewThread => {
                self.store.borrow_mut().create_thread();
            }
            Command::SelectThread(id) => self.store.borrow_mut().set_active_thread(&id)?,
            Command::DeleteThread(id) => {
                self.store.borrow_mut().delete_thread(&id)?;
            }
            Command::Connect => self.channel.connect(),
            Command::Disconnect => self.channel.disconnect(),
            Command::Reconnect => self.channel.reconnect(),
            Command::Shutdown => return Ok(Flow::Shutdown),
        }
        Ok(Flow::Continue)
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        self.channel.handle(event);
    }

    pub fn handle_rest_reply(&mut self, reply: RestReply) {
        let mut store = self.store.borrow_mut();
        let outcome = match reply.result {
            Ok(text) => store.complete_exchange(&reply.message_id, &text),
            Err(e) => {
                warn!(message_id = %reply.message_id, code = e.error_code(), "rest send failed: {e}");
                store.mark_error(&reply.message_id)
            }
        };
        if let Err(e) = outcome {
            // The thread may have been deleted while the request was in flight.
            debug!(code = e.error_code(), "rest reply dropped: {e}");
        }
    }

    /// Drive the session until `Shutdown` or the command stream ends.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        info!("session started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match self.handle_command(command) {
                        Ok(Flow::Shutdown) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => warn!(code = e.error_code(), "{e}"),
                    }
                }
                Some(event) = events.recv() => self.handle_channel_event(event),
                Some(reply) = self.rest_rx.recv() => self.handle_rest_reply(reply),
            }
        }
        self.channel.disconnect();
        info!("session stopped");
    }

    fn use_rest(&self) -> bool {
        self.rest.is_some() && !self.channel.is_open()
    }

    fn send(&mut self, content: &str) -> Result<(), StoreError> {
        if self.use_rest() {
            let (_, message_id) = self.store.borrow_mut().append_pending(content)?;
            self.spawn_rest(message_id, content.to_string());
            return Ok(());
        }
        self.store
            .borrow_mut()
            .send_message(content, &mut self.channel)?;
        Ok(())
    }

    fn retry(&mut self, message_id: &MessageId) -> Result<(), StoreError> {
        if self.use_rest() {
            let (_, fresh) = self.store.borrow_mut().stage_retry(message_id)?;
            let content = self
                .store
                .borrow()
                .find_message(&fresh)
                .map(|m| m.content().to_string())
                .unwrap_or_default();
            self.spawn_rest(fresh, content);
            return Ok(());
        }
        self.store
            .borrow_mut()
            .retry(message_id, &mut self.channel)?;
        Ok(())
    }

    fn spawn_rest(&self, message_id: MessageId, content: String) {
        let Some(rest) = self.rest.clone() else {
            return;
        };
        let envelope = OutboundEnvelope::new(content, self.store.borrow().user_id());
        let token = self.token.as_ref().and_then(|p| p.token());
        let tx = self.rest_tx.clone();
        info!(message_id = %message_id, url = rest.url(), "sending over rest fallback");
        tokio::spawn(async move {
            let result = rest.post_chat(&envelope, token.as_deref()).await;
            let _ = tx.send(RestReply { message_id, result });
        });
    }
}
