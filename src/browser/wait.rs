//! Bounded waiting.
//!
//! All timing goes through `tokio::time`, so tests drive it with a paused
//! clock instead of sleeping for real.

use super::ScrollOutcome;
use crate::error::CrawlResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_retry::strategy::ExponentialBackoff;

/// Re-check cadence for [`poll_until`]: starts near `initial`, doubles, caps
/// at `max_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn new(initial: Duration, max_interval: Duration) -> Self {
        Self {
            initial,
            max_interval: max_interval.max(initial),
        }
    }

    fn intervals(&self) -> ExponentialBackoff {
        // The strategy yields factor × 2^n ms for n = 1, 2, …
        let half_ms = u64::try_from(self.initial.as_millis()).unwrap_or(u64::MAX).div_ceil(2);
        ExponentialBackoff::from_millis(2)
            .factor(half_ms.max(1))
            .max_delay(self.max_interval)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(2))
    }
}

/// Run `probe` until it yields a value or `timeout` passes.
///
/// The probe always runs at least once, and once more at the deadline.
/// Returns `Ok(None)` on timeout; the caller picks the error kind.
pub async fn poll_until<T, F, Fut>(timeout: Duration, policy: PollPolicy, mut probe: F) -> CrawlResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CrawlResult<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut intervals = policy.intervals();
    loop {
        if let Some(value) = probe().await? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let step = intervals.next().unwrap_or(policy.max_interval);
        sleep(step.min(deadline - now)).await;
    }
}

/// Scroll, pause, measure; stop once two consecutive heights match or after
/// `max_iterations` passes.
pub async fn scroll_until_stable<S, SFut, M, MFut>(
    max_iterations: u32,
    pause: Duration,
    mut scroll: S,
    mut measure: M,
) -> CrawlResult<ScrollOutcome>
where
    S: FnMut() -> SFut,
    SFut: Future<Output = CrawlResult<()>>,
    M: FnMut() -> MFut,
    MFut: Future<Output = CrawlResult<u64>>,
{
    let mut previous = 0u64;
    for iteration in 1..=max_iterations {
        scroll().await?;
        sleep(pause).await;
        let height = measure().await?;
        if height == previous {
            return Ok(ScrollOutcome {
                iterations: iteration,
                final_height: height,
                exhausted: true,
            });
        }
        previous = height;
    }
    Ok(ScrollOutcome {
        iterations: max_iterations,
        final_height: previous,
        exhausted: false,
    })
}
