//! Reconnecting channel.
//!
//! The channel owns one logical connection, its [`ConnectionState`] and the
//! [`ReconnectPolicy`]. Network I/O and timers sit behind the [`Transport`]
//! and [`Scheduler`] traits; their outcomes come back as [`ChannelEvent`]s
//! that the owner feeds into [`Channel::handle`]. Everything runs on one
//! logical thread, so no state here is locked.
//!
//! ```text
//! CLOSED --connect()--> CONNECTING --opened--> OPEN --closed/error--> CLOSED
//!    ^                                                                  |
//!    +------ timer fires (attempt < max) <--- schedule reconnect <------+
//!                                                 | attempt == max
//!                                                 v
//!                                             EXHAUSTED (until manual connect)
//! ```
//!
//! Submodules:
//! - `ws`: tokio-tungstenite [`Transport`]
//! - `timer`: tokio [`Scheduler`]

pub mod timer;
pub mod ws;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::auth::TokenProvider;
use crate::codec::{self, InboundEnvelope, OutboundEnvelope};
use crate::error::ChannelError;
use crate::router::{Router, SubscriptionId};

pub use timer::TokioScheduler;
pub use ws::WsTransport;

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// Reconnect attempts ran out. Left only through a manual `connect()`.
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Exponential backoff: `delay = base * multiplier^attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
            multiplier: 2,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay for the next attempt, counting it. `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let factor = self.multiplier.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(self.base_delay.saturating_mul(factor))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

/// Identifies one physical connection. A new id is issued on every open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Asynchronous outcomes reported back to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened {
        connection: ConnectionId,
    },
    Frame {
        connection: ConnectionId,
        text: String,
    },
    /// The connection ended. `error` is set for anything but a clean close.
    Closed {
        connection: ConnectionId,
        error: Option<String>,
    },
    TimerFired(TimerId),
}

/// What the channel tells status observers (connection banners, the store).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    StateChanged(ConnectionState),
    ReconnectScheduled { attempt: u32, delay: Duration },
    Failed(ChannelError),
}

/// Physical connection I/O. `open` must eventually report `Opened` or
/// `Closed` for the given id; `close` must eventually report `Closed`.
pub trait Transport {
    fn open(&mut self, url: &str, connection: ConnectionId);
    fn send(&mut self, frame: String) -> Result<(), ChannelError>;
    fn close(&mut self);
}

/// Deferred callbacks. A scheduled timer reports `TimerFired` unless cancelled.
pub trait Scheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId;
    fn cancel(&mut self, timer: TimerId);
}

/// Anything the store can transmit through.
pub trait Outbound {
    fn send(&mut self, envelope: &OutboundEnvelope) -> Result<(), ChannelError>;
}

pub struct Channel<T, S> {
    url: String,
    token: Option<Arc<dyn TokenProvider>>,
    state: ConnectionState,
    policy: ReconnectPolicy,
    transport: T,
    scheduler: S,
    connection: ConnectionId,
    pending_timer: Option<TimerId>,
    /// Set by `disconnect()`; suppresses the reconnect path for the current close.
    deliberate_close: bool,
    inbound: Router<InboundEnvelope>,
    status: Router<ChannelStatus>,
}

impl<T: Transport, S: Scheduler> Channel<T, S> {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, transport: T, scheduler: S) -> Self {
        Self {
            url: url.into(),
            token: None,
            state: ConnectionState::Closed,
            policy,
            transport,
            scheduler,
            connection: ConnectionId(0),
            pending_timer: None,
            deliberate_close: false,
            inbound: Router::new("inbound"),
            status: Router::new("channel-status"),
        }
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token = Some(provider);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.pending_timer.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Register an inbound subscriber. Every successfully decoded frame is
    /// delivered to each subscriber in receipt order.
    pub fn on_message<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&InboundEnvelope) -> anyhow::Result<()> + 'static,
    {
        self.inbound.subscribe(handler)
    }

    pub fn on_status<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&ChannelStatus) -> anyhow::Result<()> + 'static,
    {
        self.status.subscribe(handler)
    }

    /// Drop a subscriber registered with [`on_message`](Self::on_message).
    pub fn unsubscribe_message(&mut self, id: SubscriptionId) -> bool {
        self.inbound.unsubscribe(id)
    }

    /// Drop a subscriber registered with [`on_status`](Self::on_status).
    pub fn unsubscribe_status(&mut self, id: SubscriptionId) -> bool {
        self.status.unsubscribe(id)
    }

    /// Open a connection unless one is already OPEN or CONNECTING.
    ///
    /// A manual connect cancels any pending reconnect timer, resets the
    /// attempt counter and leaves EXHAUSTED.
    pub fn connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            debug!(state = %self.state, "connect ignored, already active");
            return;
        }
        self.cancel_pending_reconnect();
        self.policy.reset();
        self.deliberate_close = false;
        self.open();
    }

    /// Drop the current connection (if any) and open a fresh one.
    pub fn reconnect(&mut self) {
        self.cancel_pending_reconnect();
        self.policy.reset();
        self.deliberate_close = false;
        if matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting | ConnectionState::Closing
        ) {
            self.transport.close();
        }
        self.open();
    }

    /// Deliberately close. The only path that suppresses auto-reconnect.
    pub fn disconnect(&mut self) {
        self.cancel_pending_reconnect();
        self.deliberate_close = true;
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                info!(connection = %self.connection, "disconnecting");
                self.transport.close();
                self.set_state(ConnectionState::Closing);
            }
            ConnectionState::Closing => {}
            ConnectionState::Closed | ConnectionState::Exhausted => {
                self.set_state(ConnectionState::Closed);
            }
        }
    }

    /// Transmit only when OPEN. Never queues.
    pub fn send(&mut self, envelope: &OutboundEnvelope) -> Result<(), ChannelError> {
        if self.state != ConnectionState::Open {
            return Err(ChannelError::NotConnected);
        }
        self.transport.send(codec::encode(envelope))
    }

    /// Apply an asynchronous outcome. Events for superseded connections or
    /// cancelled timers are ignored.
    pub fn handle(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened { connection } => {
                if self.is_stale(connection) {
                    return;
                }
                if self.deliberate_close {
                    debug!(connection = %connection, "open after disconnect ignored");
                    return;
                }
                info!(connection = %connection, "connection open");
                self.policy.reset();
                self.set_state(ConnectionState::Open);
            }
            ChannelEvent::Frame { connection, text } => {
                if self.is_stale(connection) {
                    return;
                }
                match codec::decode(&text) {
                    Ok(envelope) => {
                        self.inbound.publish(&envelope);
                    }
                    Err(e) => {
                        warn!(connection = %connection, "dropping inbound frame: {e}");
                    }
                }
            }
            ChannelEvent::Closed { connection, error } => {
                if self.is_stale(connection) {
                    return;
                }
                if matches!(
                    self.state,
                    ConnectionState::Closed | ConnectionState::Exhausted
                ) {
                    debug!(connection = %connection, "duplicate close ignored");
                    return;
                }
                if let Some(ref e) = error {
                    let err = ChannelError::Transport(e.clone());
                    warn!(connection = %connection, code = err.error_code(), "{err}");
                }
                self.set_state(ConnectionState::Closed);
                if self.deliberate_close {
                    debug!(connection = %connection, "closed deliberately, not reconnecting");
                    return;
                }
                self.schedule_reconnect();
            }
            ChannelEvent::TimerFired(timer) => {
                if self.pending_timer != Some(timer) {
                    debug!(timer = timer.0, "ignoring stale reconnect timer");
                    return;
                }
                self.pending_timer = None;
                info!(attempt = self.policy.attempt(), "reconnecting");
                self.open();
            }
        }
    }

    fn open(&mut self) {
        self.connection = ConnectionId(self.connection.0 + 1);
        let url = self.resolve_url();
        debug!(connection = %self.connection, "opening connection");
        self.set_state(ConnectionState::Connecting);
        self.transport.open(&url, self.connection);
    }

    fn schedule_reconnect(&mut self) {
        match self.policy.next_delay() {
            Some(delay) => {
                let attempt = self.policy.attempt();
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.pending_timer = Some(self.scheduler.schedule(delay));
                self.status
                    .publish(&ChannelStatus::ReconnectScheduled { attempt, delay });
            }
            None => {
                let err = ChannelError::ReconnectExhausted {
                    attempts: self.policy.max_attempts(),
                };
                error!(code = err.error_code(), "{err}");
                self.set_state(ConnectionState::Exhausted);
                self.status.publish(&ChannelStatus::Failed(err));
            }
        }
    }

    fn cancel_pending_reconnect(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            debug!(timer = timer.0, "cancelling pending reconnect");
            self.scheduler.cancel(timer);
        }
    }

    fn is_stale(&self, connection: ConnectionId) -> bool {
        if connection != self.connection {
            debug!(connection = %connection, current = %self.connection, "ignoring event for stale connection");
            return true;
        }
        false
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "connection state");
        self.state = state;
        self.status.publish(&ChannelStatus::StateChanged(state));
    }

    fn resolve_url(&self) -> String {
        let token = self.token.as_ref().and_then(|p| p.token());
        match token {
            Some(token) => crate::auth::with_token_query(&self.url, &token),
            None => self.url.clone(),
        }
    }
}

impl<T: Transport, S: Scheduler> Outbound for Channel<T, S> {
    fn send(&mut self, envelope: &OutboundEnvelope) -> Result<(), ChannelError> {
        Channel::send(self, envelope)
    }
}

impl<T, S> fmt::Debug for Channel<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("policy", &self.policy)
            .field("connection", &self.connection)
            .field("pending_timer", &self.pending_timer)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fail_current(channel: &mut Channel<FakeTransport, FakeScheduler>) {
        let connection = channel.connection();
        channel.handle(ChannelEvent::Closed {
            connection,
            error: Some("connection refused".into()),
        });
    }

    #[test]
    fn policy_delays_double() {
        let mut policy = ReconnectPolicy::new(5, Duration::from_millis(3000));
        let delays: Vec<u64> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![3000, 6000, 12000, 24000, 48000]);
        assert!(policy.is_exhausted());
        policy.reset();
        assert_eq!(policy.attempt(), 0);
    }

    #[test]
    fn connect_moves_to_connecting_then_open() {
        let (mut channel, transport, _) = fake_channel(5, 1000);
        assert_eq!(channel.state(), ConnectionState::Closed);

        channel.connect();
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert_eq!(transport.log.borrow().opened.len(), 1);

        channel.handle(ChannelEvent::Opened {
            connection: channel.connection(),
        });
        assert!(channel.is_open());
    }

    #[test]
    fn connect_is_idempotent_while_active() {
        let (mut channel, transport, _) = fake_channel(5, 1000);
        channel.connect();
        channel.connect();
        assert_eq!(transport.log.borrow().opened.len(), 1);

        channel.handle(ChannelEvent::Opened {
            connection: channel.connection(),
        });
        channel.connect();
        assert_eq!(transport.log.borrow().opened.len(), 1);
        assert!(channel.is_open());
    }

    #[test]
    fn send_while_not_open_never_touches_transport() {
        let (mut channel, transport, _) = fake_channel(5, 1000);
        let env = OutboundEnvelope::new("hi", "u");

        assert_eq!(channel.send(&env), Err(ChannelError::NotConnected));
        channel.connect();
        assert_eq!(channel.send(&env), Err(ChannelError::NotConnected));
        assert!(transport.log.borrow().sent.is_empty());
    }

    #[test]
    fn send_while_open_encodes_frame() {
        let (mut channel, transport, _) = fake_channel(5, 1000);
        open_channel(&mut channel);

        channel
            .send(&OutboundEnvelope::with_timestamp("ping", "u-1", "t"))
            .unwrap();
        let sent = transport.log.borrow().sent.clone();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["message"], "ping");
    }

    #[test]
    fn send_reports_transport_failure() {
        let (mut channel, transport, _) = fake_channel(5, 1000);
        open_channel(&mut channel);
        *transport.fail_sends.borrow_mut() = true;

        let err = channel.send(&OutboundEnvelope::new("x", "u")).unwrap_err();
        assert_eq!(err.error_code(), "transport_error");
    }

    #[test]
    fn reconnect_delays_follow_backoff_then_exhaust() {
        let (mut channel, transport, scheduler) = fake_channel(5, 3000);
        open_channel(&mut channel);

        // Drop the live connection, then fail every reconnect.
        fail_current(&mut channel);
        for _ in 0..5 {
            assert_eq!(channel.state(), ConnectionState::Closed);
            channel.handle(ChannelEvent::TimerFired(scheduler.last_timer()));
            assert_eq!(channel.state(), ConnectionState::Connecting);
            fail_current(&mut channel);
        }

        let delays: Vec<u64> = scheduler
            .delays()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![3000, 6000, 12000, 24000, 48000]);
        assert_eq!(channel.state(), ConnectionState::Exhausted);
        assert!(!channel.has_pending_reconnect());
        assert_eq!(channel.policy().attempt(), 5);
        // One initial open plus five reconnects.
        assert_eq!(transport.log.borrow().opened.len(), 6);
    }

    #[test]
    fn exhausted_reports_failure_and_manual_connect_resets() {
        let (mut channel, _, scheduler) = fake_channel(2, 100);
        let statuses = Rc::new(RefCell::new(Vec::new()));
        let s = statuses.clone();
        channel.on_status(move |status| {
            s.borrow_mut().push(status.clone());
            Ok(())
        });

        channel.connect();
        fail_current(&mut channel);
        channel.handle(ChannelEvent::TimerFired(scheduler.last_timer()));
        fail_current(&mut channel);
        channel.handle(ChannelEvent::TimerFired(scheduler.last_timer()));
        fail_current(&mut channel);

        assert_eq!(channel.state(), ConnectionState::Exhausted);
        assert_eq!(scheduler.delays().len(), 2);
        assert!(statuses.borrow().contains(&ChannelStatus::Failed(
            ChannelError::ReconnectExhausted { attempts: 2 }
        )));

        // A late close in EXHAUSTED schedules nothing further.
        fail_current(&mut channel);
        assert_eq!(scheduler.delays().len(), 2);
        assert_eq!(channel.state(), ConnectionState::Exhausted);

        channel.connect();
        assert_eq!(channel.policy().attempt(), 0);
        assert_eq!(channel.state(), ConnectionState::Connecting);
    }

    #[test]
    fn successful_open_resets_attempts() {
        let (mut channel, _, scheduler) = fake_channel(5, 1000);
        open_channel(&mut channel);
        fail_current(&mut channel);
        channel.handle(ChannelEvent::TimerFired(scheduler.last_timer()));
        fail_current(&mut channel);
        assert_eq!(channel.policy().attempt(), 2);

        channel.handle(ChannelEvent::TimerFired(scheduler.last_timer()));
        channel.handle(ChannelEvent::Opened {
            connection: channel.connection(),
        });
        assert_eq!(channel.policy().attempt(), 0);
        assert!(channel.is_open());
    }

    #[test]
    fn disconnect_cancels_timer_and_suppresses_reconnect() {
        let (mut channel, transport, scheduler) = fake_channel(5, 1000);
        open_channel(&mut channel);
        fail_current(&mut channel);
        let timer = scheduler.last_timer();
        assert!(channel.has_pending_reconnect());

        channel.disconnect();
        assert!(!channel.has_pending_reconnect());
        assert_eq!(scheduler.log.borrow().cancelled, vec![timer]);
        assert_eq!(channel.state(), ConnectionState::Closed);

        // A timer that was already in flight is a no-op.
        channel.handle(ChannelEvent::TimerFired(timer));
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert_eq!(transport.log.borrow().opened.len(), 1);
    }

    #[test]
    fn disconnect_while_open_closes_without_reconnect() {
        let (mut channel, transport, scheduler) = fake_channel(5, 1000);
        open_channel(&mut channel);

        channel.disconnect();
        assert_eq!(channel.state(), ConnectionState::Closing);
        assert_eq!(transport.log.borrow().closes, 1);

        channel.handle(ChannelEvent::Closed {
            connection: channel.connection(),
            error: None,
        });
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert!(scheduler.delays().is_empty());
    }

    #[test]
    fn open_reported_after_disconnect_stays_closing() {
        let (mut channel, transport, scheduler) = fake_channel(5, 1000);
        channel.connect();
        let connection = channel.connection();
        channel.disconnect();
        assert_eq!(channel.state(), ConnectionState::Closing);

        // The transport finished the handshake before it saw the close.
        channel.handle(ChannelEvent::Opened { connection });
        assert_eq!(channel.state(), ConnectionState::Closing);
        assert!(!channel.is_open());
        assert_eq!(
            channel.send(&OutboundEnvelope::new("x", "u")),
            Err(ChannelError::NotConnected)
        );

        channel.handle(ChannelEvent::Closed {
            connection,
            error: None,
        });
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert!(scheduler.delays().is_empty());
        assert!(transport.log.borrow().sent.is_empty());
    }

    #[test]
    fn unsubscribing_status_keeps_message_subscribers() {
        let (mut channel, _, _) = fake_channel(5, 1000);
        let frames = Rc::new(RefCell::new(0));
        let f = frames.clone();
        let message_sub = channel.on_message(move |_| {
            *f.borrow_mut() += 1;
            Ok(())
        });
        let statuses = Rc::new(RefCell::new(0));
        let s = statuses.clone();
        let status_sub = channel.on_status(move |_| {
            *s.borrow_mut() += 1;
            Ok(())
        });

        assert!(channel.unsubscribe_status(status_sub));
        assert!(!channel.unsubscribe_status(status_sub));
        open_channel(&mut channel);
        channel.handle(ChannelEvent::Frame {
            connection: channel.connection(),
            text: r#"{"response":"hi"}"#.to_string(),
        });
        assert_eq!(*frames.borrow(), 1);
        assert_eq!(*statuses.borrow(), 0);

        assert!(channel.unsubscribe_message(message_sub));
        channel.handle(ChannelEvent::Frame {
            connection: channel.connection(),
            text: r#"{"response":"again"}"#.to_string(),
        });
        assert_eq!(*frames.borrow(), 1);
    }

    #[test]
    fn events_for_stale_connections_are_ignored() {
        let (mut channel, _, scheduler) = fake_channel(5, 1000);
        open_channel(&mut channel);
        let old = channel.connection();

        channel.reconnect();
        assert_ne!(channel.connection(), old);
        assert_eq!(channel.state(), ConnectionState::Connecting);

        channel.handle(ChannelEvent::Closed {
            connection: old,
            error: None,
        });
        channel.handle(ChannelEvent::Opened { connection: old });
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert!(scheduler.delays().is_empty());
    }

    #[test]
    fn inbound_frames_decode_and_malformed_are_dropped() {
        let (mut channel, _, _) = fake_channel(5, 1000);
        let received = Rc::new(RefCell::new(Vec::new()));
        let r = received.clone();
        channel.on_message(move |env| {
            r.borrow_mut().push(env.clone());
            Ok(())
        });
        open_channel(&mut channel);
        let connection = channel.connection();

        for text in [r#"{"response":"a","done":false}"#, "{broken", r#"{"response":"b"}"#] {
            channel.handle(ChannelEvent::Frame {
                connection,
                text: text.to_string(),
            });
        }

        let got = received.borrow();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], InboundEnvelope::chunk("a", false));
        assert_eq!(got[1], InboundEnvelope::reply("b"));
        assert!(channel.is_open());
    }

    #[test]
    fn token_is_added_to_connection_url() {
        let (channel, transport, _) = fake_channel(5, 1000);
        let mut channel = channel.with_token_provider(Arc::new(crate::auth::StaticToken::new(
            Some("s3cret".into()),
        )));
        channel.connect();
        let url = transport.log.borrow().opened[0].0.clone();
        assert_eq!(url, "ws://localhost:8000/ws?token=s3cret");
    }

    #[test]
    fn state_changes_are_published() {
        let (mut channel, _, _) = fake_channel(5, 1000);
        let states = Rc::new(RefCell::new(Vec::new()));
        let s = states.clone();
        channel.on_status(move |status| {
            if let ChannelStatus::StateChanged(state) = status {
                s.borrow_mut().push(*state);
            }
            Ok(())
        });

        open_channel(&mut channel);
        channel.disconnect();
        channel.handle(ChannelEvent::Closed {
            connection: channel.connection(),
            error: None,
        });

        assert_eq!(
            *states.borrow(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closing,
                ConnectionState::Closed,
            ]
        );
    }
}
