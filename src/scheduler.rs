//! Cancellable delayed execution with backoff-indexed retries (spec.md §4.4).
//!
//! Grounded in the teacher's `heartbeat::Heartbeat`: a pinned `Sleep` driven
//! by a manual `poll`, so it composes into the Socket actor's own `poll`
//! without spawning a task per timer. Used for Socket reconnect, Channel
//! rejoin, and Push timeouts.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::time::Sleep;

/// A function from attempt count to delay, e.g. an exponential curve or a
/// fixed table lookup (spec.md §4.1 `reconnectAfter`/`rejoinAfter`).
pub type BackoffFn = std::sync::Arc<dyn Fn(usize) -> Duration + Send + Sync>;

pub struct Scheduler {
    backoff: BackoffFn,
    tries: usize,
    pending: Option<Pin<Box<Sleep>>>,
}

impl Scheduler {
    pub fn new(backoff: BackoffFn) -> Self {
        Self {
            backoff,
            tries: 0,
            pending: None,
        }
    }

    /// Schedule the next firing after `backoff(tries)`, incrementing `tries`.
    pub fn schedule_timeout(&mut self) {
        let delay = (self.backoff)(self.tries);
        self.tries += 1;
        self.pending = Some(Box::pin(tokio::time::sleep(delay)));
    }

    /// Schedule a firing after exactly `delay`, without touching the retry counter.
    pub fn schedule_in(&mut self, delay: Duration) {
        self.pending = Some(Box::pin(tokio::time::sleep(delay)));
    }

    /// Cancel any pending firing and clear the retry counter.
    pub fn reset(&mut self) {
        self.pending = None;
        self.tries = 0;
    }

    /// Cancel any pending firing, keeping the retry counter (used when a
    /// scheduled rejoin succeeds before its own timer fires, e.g. because an
    /// external reconnect beat it to it).
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn tries(&self) -> usize {
        self.tries
    }

    /// Resolves once the scheduled timer fires; `Poll::Pending` forever if
    /// nothing is scheduled.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(sleep) = self.pending.as_mut() else {
            return Poll::Pending;
        };

        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.pending = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::sync::Arc;

    fn fixed(d: Duration) -> BackoffFn {
        Arc::new(move |_tries| d)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_scheduled_delay() {
        let mut scheduler = Scheduler::new(fixed(Duration::from_millis(100)));
        scheduler.schedule_timeout();

        let start = tokio::time::Instant::now();
        poll_fn(|cx| scheduler.poll(cx)).await;

        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(scheduler.tries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_and_clears_tries() {
        let mut scheduler = Scheduler::new(fixed(Duration::from_millis(100)));
        scheduler.schedule_timeout();
        scheduler.schedule_timeout();
        assert_eq!(scheduler.tries(), 2);

        scheduler.reset();

        assert!(!scheduler.is_pending());
        assert_eq!(scheduler.tries(), 0);
    }

    #[tokio::test]
    async fn never_fires_when_nothing_scheduled() {
        let mut scheduler = Scheduler::new(fixed(Duration::from_millis(1)));

        assert_eq!(
            futures::poll!(poll_fn(|cx| scheduler.poll(cx))),
            Poll::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_receives_increasing_try_count() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut scheduler = Scheduler::new(Arc::new(move |tries| {
            seen2.lock().unwrap().push(tries);
            Duration::from_millis(10)
        }));

        scheduler.schedule_timeout();
        poll_fn(|cx| scheduler.poll(cx)).await;
        scheduler.schedule_timeout();
        poll_fn(|cx| scheduler.poll(cx)).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }
}
