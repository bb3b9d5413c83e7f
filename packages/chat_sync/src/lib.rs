//! # chat_sync
//!
//! Client-side message synchronization for a streaming chat assistant.
//!
//! ## Overview
//!
//! A chat UI talks to its backend over one long-lived WebSocket. This crate
//! keeps that connection alive and keeps the local view of every
//! conversation consistent with it:
//! - A reconnecting [`Channel`] with exponential backoff that gives up after a
//!   bounded number of attempts
//! - A JSON envelope codec for the wire format
//! - A [`Router`] that fans decoded envelopes out to subscribers
//! - A [`StreamAssembler`] that grows assistant replies fragment by fragment
//! - An optimistic [`ConversationStore`]: user messages appear immediately as
//!   `pending` and settle to `confirmed` or `error`
//!
//! ## Connection lifecycle
//!
//! ```text
//! CLOSED ──connect()──▶ CONNECTING ──opened──▶ OPEN
//!   ▲                                            │ error / close
//!   │        timer (3s, 6s, 12s, ...)            ▼
//!   └──────────────────────────────────────── CLOSED ──attempts used up──▶ EXHAUSTED
//! ```
//!
//! A deliberate [`Channel::disconnect`] is the only close that does not
//! schedule a reconnect. A manual [`Channel::connect`] leaves EXHAUSTED and
//! starts counting attempts from zero.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_sync::{ClientConfig, Command, ConversationStore, Session};
//! use tokio::sync::mpsc;
//!
//! # async fn demo(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let store = ConversationStore::new(config.user_id.clone());
//! let (mut session, events) = Session::websocket(&config, store, None)?;
//!
//! session.store().borrow_mut().subscribe(|event| {
//!     println!("{event:?}");
//!     Ok(())
//! });
//!
//! let (commands, rx) = mpsc::unbounded_channel();
//! commands.send(Command::Connect)?;
//! commands.send(Command::Send("hello".into()))?;
//! session.run(rx, events).await;
//! # Ok(())
//! # }
//! ```
//!
//! Everything runs on one task. Transport and timer callbacks arrive as
//! [`ChannelEvent`]s and are applied one at a time, so the store never sees
//! two mutations interleave.

pub mod assembler;
pub mod auth;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod rest;
pub mod router;
pub mod session;
pub mod store;
pub mod types;


pub use assembler::StreamAssembler;
pub use auth::{StaticToken, TokenProvider};
pub use cache::{CacheSnapshot, ConversationCache};
pub use channel::{
    Channel, ChannelEvent, ChannelStatus, ConnectionState, ReconnectPolicy, TokioScheduler,
    WsTransport,
};
pub use codec::{InboundEnvelope, OutboundEnvelope};
pub use config::{ClientConfig, DataDir, FileConfig};
pub use error::{CacheError, ChannelError, ConfigError, DecodeError, StoreError, StreamError};
pub use rest::RestClient;
pub use router::{Router, SubscriptionId};
pub use session::{Command, Flow, Session};
pub use store::{ConversationStore, SendReceipt, StoreEvent};
pub use types::{Conversation, Message, MessageId, MessageStatus, Role, ThreadId};
