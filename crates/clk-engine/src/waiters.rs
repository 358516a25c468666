//! Bounded waiters and cancellable sleeps. Every retry backoff and async
//! readiness poll in the engine suspends through here, so cancellation has a
//! single choke point.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sleep unless cancelled. `true` when the full duration elapsed.
pub async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Exponential backoff sleep: `base × 2ⁿ`. `true` when it slept.
pub async fn backoff_sleep(cancel: &CancellationToken, base: Duration, attempt: u32) -> bool {
    let factor = 2u32.saturating_pow(attempt);
    sleep_cancellable(cancel, base.saturating_mul(factor)).await
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// A bounded finite-state wait: poll every `poll_interval` until the poll
/// function yields a value, the deadline passes, or the run is cancelled.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub description: &'static str,
    pub poll_interval: Duration,
    pub deadline: Duration,
}

impl Waiter {
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut poll: F,
    ) -> anyhow::Result<WaitOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            if let Some(value) = poll().await? {
                return Ok(WaitOutcome::Ready(value));
            }
            if started.elapsed() >= self.deadline {
                debug!(waiter = self.description, "deadline reached");
                return Ok(WaitOutcome::TimedOut);
            }
            if !sleep_cancellable(cancel, self.poll_interval).await {
                return Ok(WaitOutcome::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn waiter_returns_ready_value() {
        let polls = AtomicU32::new(0);
        let waiter = Waiter {
            description: "test",
            poll_interval: Duration::from_millis(1),
            deadline: Duration::from_secs(5),
        };
        let cancel = CancellationToken::new();
        let outcome = waiter
            .run(&cancel, || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n >= 2 { Some("done") } else { None }) }
            })
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready("done"));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn waiter_times_out() {
        let waiter = Waiter {
            description: "test",
            poll_interval: Duration::from_millis(1),
            deadline: Duration::from_millis(10),
        };
        let cancel = CancellationToken::new();
        let outcome: WaitOutcome<()> = waiter
            .run(&cancel, || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn waiter_observes_cancellation() {
        let waiter = Waiter {
            description: "test",
            poll_interval: Duration::from_secs(60),
            deadline: Duration::from_secs(600),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome: WaitOutcome<()> = waiter
            .run(&cancel, || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_false() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_cancellable(&cancel, Duration::from_secs(60)).await);
        assert!(sleep_cancellable(&CancellationToken::new(), Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn poll_error_propagates() {
        let waiter = Waiter {
            description: "test",
            poll_interval: Duration::from_millis(1),
            deadline: Duration::from_millis(10),
        };
        let cancel = CancellationToken::new();
        let result: anyhow::Result<WaitOutcome<()>> = waiter
            .run(&cancel, || async { anyhow::bail!("poll broke") })
            .await;
        assert!(result.is_err());
    }
}
