//! Debounced flush timer
//!
//! Every request restarts a `min_delay` timer. The timer can never be pushed
//! past `max_delay` after the first request of a burst, so a steady stream of
//! events still gets flushed. The timer is a tokio task raced against a
//! [`CancellationToken`].

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct PendingFlush {
    token: CancellationToken,
    first_requested_at: Instant,
    deadline: Instant,
}

#[derive(Debug)]
pub struct FlushScheduler {
    min_delay: Duration,
    max_delay: Duration,
    pending: Option<PendingFlush>,
    flush_again: bool,
}

impl FlushScheduler {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            pending: None,
            flush_again: false,
        }
    }

    /// (Re)arm the timer. `fire` runs once the deadline passes unless another
    /// request or [`cancel`](Self::cancel) comes first.
    pub fn request_flush<F, Fut>(&mut self, fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, flush request ignored");
                return;
            }
        };

        let now = Instant::now();
        let first_requested_at = match self.pending.take() {
            Some(previous) => {
                previous.token.cancel();
                previous.first_requested_at
            }
            None => now,
        };
        let deadline = (now + self.min_delay).min(first_requested_at + self.max_delay);

        let token = CancellationToken::new();
        let timer_token = token.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    fire().await;
                }
            }
        });

        debug!(
            "Flush scheduled in {:?}",
            deadline.saturating_duration_since(now)
        );
        self.pending = Some(PendingFlush {
            token,
            first_requested_at,
            deadline,
        });
    }

    /// Drop the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[cfg(test)]
    fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.deadline)
    }

    /// Record that another flush is wanted once the running one finishes
    pub fn mark_flush_again(&mut self) {
        self.flush_again = true;
    }

    pub fn take_flush_again(&mut self) -> bool {
        std::mem::take(&mut self.flush_again)
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
