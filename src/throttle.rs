//! Start concurrency throttle.
//!
//! A process-wide admission gate bounding how many start operations may be in
//! flight at once, as a workaround for hosts that destabilize under start
//! storms. Waiters poll on a fixed interval rather than blocking on a wake:
//! a freed slot is claimed within one poll interval, and no ordering among
//! waiters is promised.

use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Environment variable naming the maximum number of parallel starts.
/// Absent, unparsable, or non-positive means unlimited.
pub const MAX_PARALLEL_START_ENV: &str = "HOSTCOMPUTE_MAX_PARALLEL_START";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct StartThrottle {
    max_parallel: usize,
    in_progress: Mutex<usize>,
    poll_interval: Duration,
}

/// Slot held for the duration of one start operation. Dropping it frees the
/// slot.
pub struct StartPermit<'a> {
    throttle: Option<&'a StartThrottle>,
}

impl StartThrottle {
    /// `max_parallel == 0` disables throttling.
    pub fn new(max_parallel: usize) -> Self {
        Self::with_poll_interval(max_parallel, POLL_INTERVAL)
    }

    pub fn with_poll_interval(max_parallel: usize, poll_interval: Duration) -> Self {
        Self {
            max_parallel,
            in_progress: Mutex::new(0),
            poll_interval,
        }
    }

    pub fn from_env() -> Self {
        Self::new(parse_max(std::env::var(MAX_PARALLEL_START_ENV).ok().as_deref()))
    }

    /// Waits for a free slot, polling until one opens.
    pub async fn acquire(&self) -> StartPermit<'_> {
        if self.max_parallel == 0 {
            return StartPermit { throttle: None };
        }
        loop {
            {
                let mut in_progress = self.in_progress.lock();
                if *in_progress < self.max_parallel {
                    *in_progress += 1;
                    return StartPermit {
                        throttle: Some(self),
                    };
                }
            }
            debug!(max = self.max_parallel, "start throttle at capacity, polling");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn release(&self) {
        let mut in_progress = self.in_progress.lock();
        *in_progress = in_progress.saturating_sub(1);
    }
}

impl Drop for StartPermit<'_> {
    fn drop(&mut self) {
        if let Some(throttle) = self.throttle {
            throttle.release();
        }
    }
}

/// The process-wide throttle consulted by every start operation, configured
/// once from the environment.
pub fn global() -> &'static StartThrottle {
    static GLOBAL: OnceLock<StartThrottle> = OnceLock::new();
    GLOBAL.get_or_init(StartThrottle::from_env)
}

fn parse_max(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.parse::<i64>().ok())
        .filter(|&value| value > 0)
        .map(|value| value as usize)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn parse_max_rejects_garbage_and_non_positive() {
        assert_eq!(parse_max(None), 0);
        assert_eq!(parse_max(Some("")), 0);
        assert_eq!(parse_max(Some("nope")), 0);
        assert_eq!(parse_max(Some("-3")), 0);
        assert_eq!(parse_max(Some("0")), 0);
        assert_eq!(parse_max(Some("4")), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_never_exceed_the_maximum() {
        let throttle = Arc::new(StartThrottle::with_poll_interval(
            2,
            Duration::from_millis(5),
        ));
        let active = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                let active = Arc::clone(&active);
                let high_water = Arc::clone(&high_water);
                tokio::spawn(async move {
                    let _permit = throttle.acquire().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(high_water.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn zero_maximum_means_unlimited() {
        let throttle = StartThrottle::new(0);
        let _a = throttle.acquire().await;
        let _b = throttle.acquire().await;
        let _c = throttle.acquire().await;
    }

    #[tokio::test]
    async fn released_slot_is_reclaimed() {
        let throttle = StartThrottle::with_poll_interval(1, Duration::from_millis(1));
        {
            let _permit = throttle.acquire().await;
        }
        // Freed on drop; a second acquire proceeds.
        let _again = throttle.acquire().await;
    }
}
