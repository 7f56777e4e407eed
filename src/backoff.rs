//! Bounded exponential backoff for upstream calls
//!
//! A failed attempt is retried when the transport errored or the provider answered
//! 429 or a 5xx status. Everything else (successes and ordinary 4xx) is handed back
//! unchanged for the caller to interpret.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry ceiling and delay bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            jitter: Duration::from_millis(150),
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    #[must_use]
    pub fn base_delay_for_attempt(
        &self,
        attempt: u32,
    ) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `attempt` with uniform jitter applied
    #[must_use]
    pub fn delay_for_attempt(
        &self,
        attempt: u32,
    ) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay_for_attempt(attempt) + jitter
    }

    /// Longest delay this policy can ever produce
    #[must_use]
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.base_delay_for_attempt(attempt) + self.jitter)
            .sum()
    }
}

/// Whether a completed attempt is worth retrying
pub trait Retryable {
    fn should_retry(&self) -> bool;
}

/// 429 and every 5xx are transient
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

impl Retryable for reqwest::Response {
    fn should_retry(&self) -> bool {
        is_retryable_status(self.status().as_u16())
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the retry ceiling is hit.
///
/// # Errors
///
/// Returns the last transport error when every attempt failed to complete.
pub async fn issue<F, Fut, R, E>(
    policy: &BackoffPolicy,
    mut attempt: F,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: Retryable,
    E: std::fmt::Display,
{
    let mut retries = 0;
    loop {
        let result = attempt().await;

        let reason = match &result {
            Ok(response) if response.should_retry() => Some("retryable status".to_string()),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };
        let Some(reason) = reason else {
            return result;
        };

        if retries >= policy.max_retries {
            tracing::warn!("Giving up after {} retries: {}", retries, reason);
            return result;
        }

        let delay = policy.delay_for_attempt(retries);
        tracing::warn!(
            attempt = retries + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Upstream attempt failed ({}), retrying",
            reason
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    struct Status(u16);

    impl Retryable for Status {
        fn should_retry(&self) -> bool {
            is_retryable_status(self.0)
        }
    }

    fn scripted(statuses: Vec<Result<u16, &'static str>>) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<Status, &'static str>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
            let outcome = statuses.get(n).copied().unwrap_or(Ok(200));
            std::future::ready(outcome.map(Status))
        };
        (calls, attempt)
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= policy.base_delay);
            assert!(delay <= policy.base_delay + policy.jitter);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_429s_then_success() {
        let policy = BackoffPolicy::default();
        let (calls, attempt) = scripted(vec![Ok(429), Ok(429), Ok(200)]);

        let started = Instant::now();
        let response = issue(&policy, attempt).await.unwrap();
        let waited = started.elapsed();

        assert_eq!(response, Status(200));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(waited >= policy.base_delay_for_attempt(0) + policy.base_delay_for_attempt(1));
        assert!(waited <= 2 * (policy.max_delay + policy.jitter));
        assert!(waited <= policy.max_total_delay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let (calls, attempt) = scripted(vec![Ok(404)]);
        let response = issue(&BackoffPolicy::default(), attempt).await.unwrap();
        assert_eq!(response, Status(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_server_error() {
        let (calls, attempt) = scripted(vec![Ok(500), Ok(502), Ok(503), Ok(200)]);
        let response = issue(&BackoffPolicy::default(), attempt).await.unwrap();
        assert_eq!(response, Status(503));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let (calls, attempt) = scripted(vec![Err("connection reset"), Ok(200)]);
        assert_eq!(issue(&BackoffPolicy::default(), attempt).await, Ok(Status(200)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let (calls, attempt) = scripted(vec![Err("refused"), Err("refused"), Err("refused")]);
        assert_eq!(issue(&BackoffPolicy::default(), attempt).await, Err("refused"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_policy() {
        let (calls, attempt) = scripted(vec![Ok(503)]);
        assert_eq!(issue(&BackoffPolicy::none(), attempt).await, Ok(Status(503)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
