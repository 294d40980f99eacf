use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Exponential backoff shared by every AI call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// Rate-limit failures (as judged by `is_rate_limited`) and other failures
/// back off on the same doubling schedule; the distinction only changes what
/// gets logged. The last error is returned once attempts run out.
pub async fn retry_with_backoff<T, E, Op, Fut, P>(
    policy: &RetryPolicy,
    is_rate_limited: P,
    op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    retry_with_backoff_using(policy, is_rate_limited, tokio::time::sleep, op).await
}

/// Same as [`retry_with_backoff`] with an explicit sleeper.
pub async fn retry_with_backoff_using<T, E, Op, Fut, P, S, SleepFut>(
    policy: &RetryPolicy,
    is_rate_limited: P,
    mut sleep: S,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    S: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 >= attempts => return Err(err),
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                if is_rate_limited(&err) {
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "rate limited, backing off");
                } else {
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "call failed, retrying");
                }
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    enum FakeError {
        RateLimited,
        Broken,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn recording_sleeper(
        log: Arc<Mutex<Vec<Duration>>>,
    ) -> impl FnMut(Duration) -> std::future::Ready<()> {
        move |d| {
            log.lock().unwrap().push(d);
            std::future::ready(())
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn two_rate_limits_then_success_sleeps_twice_increasing() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let mut calls = 0;
        let result = retry_with_backoff_using(
            &RetryPolicy::default(),
            |e: &FakeError| matches!(e, FakeError::RateLimited),
            recording_sleeper(sleeps.clone()),
            || {
                calls += 1;
                let outcome = if calls < 3 {
                    Err(FakeError::RateLimited)
                } else {
                    Ok("summary")
                };
                std::future::ready(outcome)
            },
        )
        .await;

        assert_eq!(result.unwrap(), "summary");
        let sleeps = sleeps.lock().unwrap();
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[0] < sleeps[1]);
        assert_eq!(sleeps[0], Duration::from_secs(1));
        assert_eq!(sleeps[1], Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_last_error() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let mut calls = 0;
        let result: Result<(), FakeError> = retry_with_backoff_using(
            &RetryPolicy::default(),
            |e: &FakeError| matches!(e, FakeError::RateLimited),
            recording_sleeper(sleeps.clone()),
            || {
                calls += 1;
                let err = if calls == 3 {
                    FakeError::Broken
                } else {
                    FakeError::RateLimited
                };
                std::future::ready(Err(err))
            },
        )
        .await;

        assert!(matches!(result, Err(FakeError::Broken)));
        assert_eq!(calls, 3);
        assert_eq!(sleeps.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn first_success_never_sleeps() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let result: Result<u8, FakeError> = retry_with_backoff_using(
            &RetryPolicy::default(),
            |_| false,
            recording_sleeper(sleeps.clone()),
            || std::future::ready(Ok(7)),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(sleeps.lock().unwrap().is_empty());
    }
}
