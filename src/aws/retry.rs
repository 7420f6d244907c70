use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry behavior for one class of AWS call, exposed as plain configuration
/// instead of per-handler callbacks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Target group deletion races listener removal inside AWS; a fixed 10s
    /// delay for up to 10 attempts rides out the lag.
    pub fn target_group_delete() -> Self {
        RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Exponential backoff: `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, the error stops being retryable, or the
/// policy's attempt budget runs out.
pub async fn retry_on<T, E, F, Fut, P>(policy: &RetryPolicy, mut op: F, retryable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && retryable(&err) => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(%err, attempt, ?delay, "retrying AWS call");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(30),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(5));
        assert_eq!(policy.delay_for(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(20));
        assert_eq!(policy.delay_for(4), Duration::from_millis(30));
        assert_eq!(policy.delay_for(10), Duration::from_millis(30));
    }

    #[test]
    fn tg_delete_policy_is_fixed_delay() {
        let policy = RetryPolicy::target_group_delete();
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(7), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let result: Result<u32, String> = retry_on(
            &policy,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("in use".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::target_group_delete();
        let result: Result<(), String> = retry_on(
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("access denied".to_string()) }
            },
            |e| e.contains("in use"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
