//! Typed observer registry.
//!
//! Handlers run synchronously, in subscription order, once per published
//! event. A handler that fails or panics is logged and skipped; the rest
//! still see the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Box<dyn FnMut(&E) -> anyhow::Result<()>>;

pub struct Router<E> {
    name: &'static str,
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Handler<E>)>,
}

impl<E> Router<E> {
    /// `name` only shows up in log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&E) -> anyhow::Result<()> + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(handler)));
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Deliver `event` to every subscriber. Returns how many handled it successfully.
    pub fn publish(&mut self, event: &E) -> usize {
        let mut delivered = 0;
        for (id, handler) in &mut self.subscribers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(router = self.name, subscription = id.0, "subscriber failed: {e:#}");
                }
                Err(_) => {
                    error!(router = self.name, subscription = id.0, "subscriber panicked");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<E> std::fmt::Debug for Router<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
