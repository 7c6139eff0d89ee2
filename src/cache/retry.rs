//! Bounded retry around a cancellable async operation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(300);

type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;
type RetryPredicate = Arc<dyn Fn(&QueryError, u32) -> bool + Send + Sync>;

/// Pause before the next attempt, either fixed or derived from the attempt
/// number (1-based count of failures so far).
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    Computed(DelayFn),
}

impl RetryDelay {
    pub fn computed(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    fn for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Computed(f) => f(attempt),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 behave as 1.
    pub attempts: u32,
    pub delay: RetryDelay,
    /// Decides whether a failure is worth another attempt. Retries everything
    /// when unset.
    pub retry_on: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: RetryDelay::Fixed(DEFAULT_RETRY_DELAY),
            retry_on: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("delay", &self.delay)
            .field("retry_on", &self.retry_on.as_ref().map(|_| ".."))
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = RetryDelay::Fixed(delay);
        self
    }

    pub fn with_computed_delay(
        mut self,
        f: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay = RetryDelay::computed(f);
        self
    }

    pub fn with_retry_on(
        mut self,
        f: impl Fn(&QueryError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Some(Arc::new(f));
        self
    }

    fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn should_retry(&self, error: &QueryError, attempt: u32) -> bool {
        self.retry_on.as_ref().is_none_or(|f| f(error, attempt))
    }

    /// Serializable subset; computed delays and predicates are dropped.
    pub fn settings(&self) -> RetrySettings {
        RetrySettings {
            attempts: self.attempts,
            delay_ms: match &self.delay {
                RetryDelay::Fixed(delay) => Some(delay.as_millis() as u64),
                RetryDelay::Computed(_) => None,
            },
        }
    }
}

/// Plain-data retry configuration, as found in config files and persisted
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay_ms: Some(DEFAULT_RETRY_DELAY.as_millis() as u64),
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            attempts: settings.attempts,
            delay: RetryDelay::Fixed(
                settings
                    .delay_ms
                    .map_or(DEFAULT_RETRY_DELAY, Duration::from_millis),
            ),
            retry_on: None,
        }
    }
}

/// Run `op` until it succeeds, the policy gives up, or `token` is cancelled.
///
/// `op` receives the zero-based attempt index. `on_retry(attempt, attempts)`
/// fires before every attempt after the first, with a 1-based attempt
/// number. Cancellation is never retried and interrupts both the running
/// attempt and the pause between attempts. On exhaustion the last error is
/// returned.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
    mut on_retry: impl FnMut(u32, u32),
) -> Result<T, QueryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let attempts = policy.effective_attempts();
    let mut last_error = None;

    for attempt in 0..attempts {
        if token.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        if attempt > 0 {
            on_retry(attempt + 1, attempts);
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(QueryError::Cancelled),
            result = op(attempt) => result,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => error,
        };

        let failures = attempt + 1;
        if failures == attempts || !policy.should_retry(&error, failures) {
            last_error = Some(error);
            break;
        }

        let delay = policy.delay.for_attempt(failures);
        last_error = Some(error);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(QueryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    Err(last_error.unwrap_or(QueryError::Cancelled))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn failing(
        calls: &Arc<AtomicU32>,
        succeed_on: u32,
    ) -> impl FnMut(u32) -> futures::future::Ready<Result<u32, QueryError>> {
        let calls = calls.clone();
        move |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(if attempt + 1 >= succeed_on {
                Ok(attempt)
            } else {
                Err(QueryError::fetch(format!("attempt {attempt} failed")))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();
        let policy = RetryPolicy::new(3).with_delay(Duration::from_millis(10));
        let token = CancellationToken::new();

        let result = run_with_retry(&policy, &token, failing(&calls, 3), |attempt, attempts| {
            retries.push((attempt, attempts))
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![(2, 3), (3, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2).with_delay(Duration::ZERO);
        let token = CancellationToken::new();

        let error = run_with_retry(&policy, &token, failing(&calls, 10), |_, _| {})
            .await
            .unwrap_err();

        assert_eq!(error.to_string(), "fetch failed: attempt 1 failed");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(0);
        let token = CancellationToken::new();

        let _ = run_with_retry(&policy, &token, failing(&calls, 10), |_, _| {}).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5)
            .with_delay(Duration::ZERO)
            .with_retry_on(|_, failures| failures < 2);
        let token = CancellationToken::new();

        let _ = run_with_retry(&policy, &token, failing(&calls, 10), |_, _| {}).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_delay_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5).with_delay(Duration::from_secs(60));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let error = run_with_retry(&policy, &token, failing(&calls, 10), |_, _| {})
            .await
            .unwrap_err();

        assert!(error.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_errors_skip_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(3).with_delay(Duration::ZERO);
        let token = CancellationToken::new();

        let error = run_with_retry(
            &policy,
            &token,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Err::<(), _>(QueryError::Cancelled))
            },
            |_, _| {},
        )
        .await
        .unwrap_err();

        assert!(error.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settings_convert_to_policy() {
        let policy = RetryPolicy::from(RetrySettings {
            attempts: 4,
            delay_ms: Some(50),
        });
        assert_eq!(policy.attempts, 4);
        assert_eq!(policy.settings().delay_ms, Some(50));
    }
}
