use super::Error;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Re-export so embedders can tune schedules without adding a dependency.
pub use exponential_backoff::Backoff;

/// RetryPolicy is the backoff schedule applied to DocStore and LeaseMap
/// calls: exponential from one second with factor two, ±20% jitter,
/// capped at thirty seconds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        let mut backoff = Backoff::new(
            attempts,
            Duration::from_secs(1),
            Some(Duration::from_secs(30)),
        );
        backoff.set_factor(2);
        backoff.set_jitter(0.2);
        Self { attempts, backoff }
    }

    pub fn with_min(mut self, min: Duration) -> Self {
        self.backoff.set_min(min);
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.backoff.set_max(Some(max));
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The pause after the given 1-based attempt, or None when the
    /// schedule is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        self.backoff.next(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Invoke `op` until it succeeds, fails terminally, or the policy's
/// attempts are exhausted. Budget-exhaustion failures sleep and retry
/// without consuming an attempt. `cancel` halts further attempts but an
/// in-flight call is always allowed to settle.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op_name: &str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let err = match op().await {
            Ok(ok) => return Ok(ok),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        if !err.is_budget() {
            attempt += 1;
        }
        let Some(pause) = policy.delay(attempt.max(1)) else {
            tracing::warn!(op = op_name, attempt, ?err, "retries exhausted");
            return Err(err);
        };

        tracing::warn!(op = op_name, attempt, ?pause, ?err, "backend call failed; backing off");

        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            () = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = retry(&RetryPolicy::new(5), &CancellationToken::new(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient("flake".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> =
            retry(&RetryPolicy::new(5), &CancellationToken::new(), "op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Terminal("bad request".to_string())) }
            })
            .await;
        assert!(matches!(out, Err(Error::Terminal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_does_not_consume_attempts() {
        let calls = AtomicU32::new(0);
        let out = retry(&RetryPolicy::new(2), &CancellationToken::new(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 8 {
                    Err(Error::BudgetExhausted)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        // Eight budget failures would exhaust a two-attempt policy if they
        // counted as progress.
        assert_eq!(out.unwrap(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_halts_between_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out: Result<(), _> = retry(&RetryPolicy::default(), &cancel, "op", || async {
            panic!("must not be invoked after cancellation")
        })
        .await;
        assert!(matches!(out, Err(Error::Cancelled)));
    }
}
