use std::task::Poll;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::diag::ring_warn;
use crate::error::{RingError, Result};

/// How a poller waits between checks of a shared flag.
///
/// The first `spin_iters` checks busy-spin, the next `yield_iters` yield the
/// thread, and every later check sleeps for `sleep`. `max_iters` caps the
/// number of checks; `None` polls until cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub spin_iters: u64,
    pub yield_iters: u64,
    pub sleep: Duration,
    pub max_iters: Option<u64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            spin_iters: 1000,
            yield_iters: 4000,
            sleep: Duration::from_micros(10),
            max_iters: None,
        }
    }
}

impl BackoffPolicy {
    /// Pure busy-wait, never yields the thread.
    pub fn spin() -> Self {
        Self {
            spin_iters: u64::MAX,
            yield_iters: 0,
            sleep: Duration::ZERO,
            max_iters: None,
        }
    }

    /// Default pacing with at most `max_iters` checks.
    pub fn bounded(max_iters: u64) -> Self {
        Self {
            max_iters: Some(max_iters),
            ..Self::default()
        }
    }

    pub fn with_max_iters(mut self, max_iters: u64) -> Self {
        self.max_iters = Some(max_iters);
        self
    }

    fn pause(&self, iter: u64) {
        if iter < self.spin_iters {
            std::hint::spin_loop();
        } else if iter < self.spin_iters.saturating_add(self.yield_iters) {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.sleep);
        }
    }
}

/// Run `check` until it is ready, pacing with `policy`.
///
/// `check` runs at least once, even with a zero budget or an already
/// cancelled token, so a slot that is already ready is always observed.
pub fn poll_until<T>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut check: impl FnMut() -> Result<Poll<T>>,
) -> Result<T> {
    let mut iter: u64 = 0;
    loop {
        if let Poll::Ready(v) = check()? {
            return Ok(v);
        }
        if cancel.is_cancelled() {
            return Err(RingError::Cancelled);
        }
        iter = iter.saturating_add(1);
        if let Some(max) = policy.max_iters
            && iter >= max
        {
            ring_warn!(iterations = iter, "poll budget exhausted; peer may be stalled");
            return Err(RingError::PollBudgetExhausted { iterations: iter });
        }
        policy.pause(iter);
    }
}
