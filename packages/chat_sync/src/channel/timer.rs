use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{ChannelEvent, Scheduler, TimerId};

/// Reconnect timers backed by spawned `tokio::time::sleep` tasks.
///
/// Cancelling aborts the task, so a cancelled timer never reports
/// `TimerFired`. The channel still ignores stale ids in case one raced
/// the abort.
pub struct TokioScheduler {
    events: mpsc::UnboundedSender<ChannelEvent>,
    next_id: u64,
    timers: HashMap<TimerId, AbortHandle>,
}

impl TokioScheduler {
    pub fn new(events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            events,
            next_id: 0,
            timers: HashMap::new(),
        }
    }

    /// Timers scheduled and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        self.timers.retain(|_, handle| !handle.is_finished());

        self.next_id += 1;
        let id = TimerId(self.next_id);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ChannelEvent::TimerFired(id));
        });
        self.timers.insert(id, task.abort_handle());
        id
    }

    fn cancel(&mut self, timer: TimerId) {
        if let Some(handle) = self.timers.remove(&timer) {
            debug!(timer = timer.0, "aborting timer");
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for handle in self.timers.values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);

        let id = scheduler.schedule(Duration::from_secs(3));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.recv().await, Some(ChannelEvent::TimerFired(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);

        let cancelled = scheduler.schedule(Duration::from_secs(1));
        let kept = scheduler.schedule(Duration::from_secs(2));
        scheduler.cancel(cancelled);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.recv().await, Some(ChannelEvent::TimerFired(kept)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        let a = scheduler.schedule(Duration::from_secs(1));
        let b = scheduler.schedule(Duration::from_secs(1));
        assert_ne!(a, b);
    }
}
