//! Aggregation feeds: per-domain composition of the fetch client, cache,
//! calc worker and staged loader into periodically refreshing, cancelable
//! data streams.
//!
//! Shared discipline across feeds: starting a refresh cancels the previous
//! in-flight cycle for that feed ("last write wins" by cancellation), and a
//! cancelled cycle never surfaces as a user-visible error.

pub mod blue_dollar;
pub mod exchange_rates;
pub mod latam;
pub mod remittance;

use crate::cancel::CancelToken;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Per-feed slot holding the current cycle's cancellation token.
#[derive(Default)]
pub(crate) struct CycleGuard {
    current: Mutex<Option<CancelToken>>,
}

impl CycleGuard {
    /// Cancel the previous cycle (if any) and hand out a token for the new
    /// one.
    pub(crate) fn begin(&self) -> CancelToken {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            previous.cancel();
        }
        let token = CancelToken::new();
        *current = Some(token.clone());
        token
    }

    /// Cancel whatever cycle is in flight (teardown path).
    pub(crate) fn cancel_current(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }
}

/// Seconds until the next scheduled refresh, clamped at zero.
pub(crate) fn secs_until(deadline: Option<Instant>) -> u64 {
    deadline
        .map(|d| d.saturating_duration_since(Instant::now()).as_secs())
        .unwrap_or(0)
}

/// Next refresh deadline from now.
pub(crate) fn next_deadline(interval: Duration) -> Instant {
    Instant::now() + interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_cancels_previous_cycle() {
        let guard = CycleGuard::default();
        let first = guard.begin();
        assert!(!first.is_cancelled());
        let second = guard.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn secs_until_counts_down() {
        let deadline = Some(next_deadline(Duration::from_secs(300)));
        assert_eq!(secs_until(deadline), 300);
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(secs_until(deadline), 200);
        tokio::time::advance(Duration::from_secs(400)).await;
        assert_eq!(secs_until(deadline), 0);
    }
}
