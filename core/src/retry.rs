//! Bounded retries with exponential backoff
//!
//! A handler makes at most `max_retries + 1` attempts. After failed attempt `n`
//! it waits `base_delay * 2^(n-1)` (capped by `max_delay`, optionally jittered)
//! before the next one. A successful attempt returns at once.

use crate::{
    classifier::{RetryAll, RetryClassifier, RetryContext},
    errors::RetryError,
    telemetry::{MetricsFacade, MetricsSink, names},
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first
    pub max_retries: u32,

    /// Delay after the first failed attempt; doubled for each further attempt
    #[serde(rename = "base_delay_ms", with = "crate::config::serde_millis")]
    pub base_delay: Duration,

    /// Upper bound for a single delay
    #[serde(
        rename = "max_delay_ms",
        with = "crate::config::serde_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,

    /// Jitter factor (0.0 = exact delays, 1.0 = full jitter)
    /// Uses chrono-machines formula: delay * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: None,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait after failed attempt `attempt` (1-based) before the next one
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let base = self.base_delay.as_millis() as u64;
        let mut delay_ms = base.saturating_mul(1u64 << exponent);
        if let Some(max_delay) = self.max_delay {
            delay_ms = delay_ms.min(max_delay.as_millis() as u64);
        }

        if self.jitter_factor > 0.0 && delay_ms > 0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: delay_ms,
                multiplier: 1.0,
                max_delay_ms: delay_ms,
            };
            return Duration::from_millis(policy.calculate_delay(1, self.jitter_factor) as u64);
        }

        Duration::from_millis(delay_ms)
    }

    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            errors.push("retry.jitter_factor must be within 0.0..=1.0".to_string());
        }
        if let Some(max_delay) = self.max_delay
            && max_delay < self.base_delay
        {
            errors.push("retry.max_delay_ms must not be below retry.base_delay_ms".to_string());
        }
    }
}

/// Retries an operation on behalf of one calling service
///
/// The handler holds no per-call state and can be shared freely.
///
/// # Example
///
/// ```rust
/// use mcp_resilience::{CircuitBreakerRegistry, RetryConfig, RetryHandler};
/// use std::time::Duration;
///
/// let registry = CircuitBreakerRegistry::default();
/// let breaker = registry.get("weather");
/// let retry = RetryHandler::new(
///     "weather",
///     RetryConfig::default().with_base_delay(Duration::from_millis(1)),
/// );
///
/// let forecast = retry.execute_with_retry(|| breaker.execute(|| Ok::<_, std::io::Error>("sunny")));
/// assert_eq!(forecast.unwrap(), "sunny");
/// ```
#[derive(Debug, Clone)]
pub struct RetryHandler {
    service: String,
    config: RetryConfig,
    metrics: Arc<dyn MetricsSink>,
    classifier: Arc<dyn RetryClassifier>,
}

impl RetryHandler {
    /// Handler reporting to the `metrics` crate and retrying every error
    pub fn new(service: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            service: service.into(),
            config,
            metrics: Arc::new(MetricsFacade),
            classifier: Arc::new(RetryAll),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Only retry errors the classifier accepts
    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or attempts run out, sleeping the
    /// calling thread between attempts
    pub fn execute_with_retry<T, E, F>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Display + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation() {
                Ok(value) => {
                    self.record_attempt(attempt, "success");
                    return Ok(value);
                }
                Err(e) => match self.after_failure(attempt, e) {
                    ControlFlow::Continue(delay) => std::thread::sleep(delay),
                    ControlFlow::Break(err) => return Err(err),
                },
            }
        }
    }

    /// Same as [`execute_with_retry`](Self::execute_with_retry) but waits with
    /// `tokio::time::sleep`, so only the current task is suspended
    pub async fn execute_with_retry_async<T, E, F, Fut>(
        &self,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    self.record_attempt(attempt, "success");
                    return Ok(value);
                }
                Err(e) => match self.after_failure(attempt, e) {
                    ControlFlow::Continue(delay) => tokio::time::sleep(delay).await,
                    ControlFlow::Break(err) => return Err(err),
                },
            }
        }
    }

    /// Bookkeeping for a failed attempt: either the delay before the next
    /// attempt or the error to surface
    fn after_failure<E>(&self, attempt: u32, error: E) -> ControlFlow<RetryError<E>, Duration>
    where
        E: Display + 'static,
    {
        self.record_attempt(attempt, "failure");
        let max_attempts = self.config.max_attempts();

        let ctx = RetryContext {
            service: &self.service,
            attempt,
            error: &error as &dyn Any,
        };
        if !self.classifier.should_retry(&ctx) {
            tracing::error!(
                service = %self.service,
                attempt,
                error = %error,
                "Non-retryable error, giving up"
            );
            self.record_failure("not_retryable");
            return ControlFlow::Break(RetryError::NotRetryable {
                service: self.service.clone(),
                attempt,
                source: error,
            });
        }

        if attempt >= max_attempts {
            tracing::error!(
                service = %self.service,
                attempts = attempt,
                error = %error,
                "Retries exhausted"
            );
            self.record_failure("max_retries_exceeded");
            return ControlFlow::Break(RetryError::Exhausted {
                service: self.service.clone(),
                attempts: attempt,
                source: error,
            });
        }

        let delay = self.config.delay_for(attempt);
        tracing::warn!(
            service = %self.service,
            attempt,
            max_attempts,
            delay = ?delay,
            error = %error,
            "Attempt failed, retrying"
        );
        ControlFlow::Continue(delay)
    }

    fn record_attempt(&self, attempt: u32, outcome: &str) {
        let attempt = attempt.to_string();
        self.metrics.increment(
            names::RETRY_ATTEMPT,
            &[
                ("service", self.service.as_str()),
                ("attempt", attempt.as_str()),
                ("outcome", outcome),
            ],
        );
    }

    fn record_failure(&self, reason: &str) {
        self.metrics.increment(
            names::RETRY_FAILURE,
            &[("service", self.service.as_str()), ("reason", reason)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::PredicateClassifier;
    use crate::telemetry::MemoryMetrics;
    use std::time::Instant;

    fn handler(max_retries: u32, base_ms: u64) -> (RetryHandler, Arc<MemoryMetrics>) {
        let metrics = Arc::new(MemoryMetrics::new());
        let handler = RetryHandler::new(
            "test",
            RetryConfig::default()
                .with_max_retries(max_retries)
                .with_base_delay(Duration::from_millis(base_ms)),
        )
        .with_metrics(metrics.clone());
        (handler, metrics)
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for(3), Duration::from_millis(4000));
        assert_eq!(config.max_attempts(), 4);
    }

    #[test]
    fn test_delay_capped_and_saturating() {
        let config = RetryConfig::default().with_max_delay(Duration::from_millis(2500));

        assert_eq!(config.delay_for(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for(3), Duration::from_millis(2500));
        assert_eq!(config.delay_for(200), Duration::from_millis(2500));

        let uncapped = RetryConfig::default();
        assert_eq!(uncapped.delay_for(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_jittered_delay_stays_within_bounds() {
        let config = RetryConfig::default().with_jitter_factor(0.5);

        for _ in 0..50 {
            let delay = config.delay_for(2);
            assert!(delay >= Duration::from_millis(1000), "delay {:?} too short", delay);
            assert!(delay <= Duration::from_millis(2000), "delay {:?} too long", delay);
        }
    }

    #[test]
    fn test_retry_succeeds_eventually() {
        let (handler, metrics) = handler(3, 1);
        let mut counter = 0;

        let result = handler.execute_with_retry(|| {
            counter += 1;
            if counter < 3 {
                Err("not yet")
            } else {
                Ok("success")
            }
        });

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter, 3);
        assert_eq!(
            metrics.count(names::RETRY_ATTEMPT, &[("attempt", "3"), ("outcome", "success")]),
            1
        );
        assert_eq!(metrics.total(names::RETRY_FAILURE), 0);
    }

    #[test]
    fn test_retry_exhausts_after_max_attempts() {
        let (handler, metrics) = handler(3, 10);
        let mut counter = 0;
        let start = Instant::now();

        let result: Result<(), _> = handler.execute_with_retry(|| {
            counter += 1;
            Err(format!("failure {}", counter))
        });

        // 10 + 20 + 40 ms of backoff between four attempts
        assert!(start.elapsed() >= Duration::from_millis(70));
        assert_eq!(counter, 4);
        match result {
            Err(RetryError::Exhausted {
                service,
                attempts,
                source,
            }) => {
                assert_eq!(service, "test");
                assert_eq!(attempts, 4);
                assert_eq!(source, "failure 4");
            }
            other => panic!("Expected RetryError::Exhausted, got {:?}", other),
        }
        assert_eq!(
            metrics.count(names::RETRY_ATTEMPT, &[("outcome", "failure")]),
            4
        );
        assert_eq!(
            metrics.count(names::RETRY_FAILURE, &[("service", "test"), ("reason", "max_retries_exceeded")]),
            1
        );
    }

    #[test]
    fn test_retry_no_delay_on_success() {
        let (handler, _metrics) = handler(3, 1000);
        let start = Instant::now();

        let result = handler.execute_with_retry(|| Ok::<_, String>("immediate success"));

        assert_eq!(result.unwrap(), "immediate success");
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_zero_retries_makes_one_attempt() {
        let (handler, _metrics) = handler(0, 1000);
        let mut counter = 0;

        let result: Result<(), _> = handler.execute_with_retry(|| {
            counter += 1;
            Err("nope")
        });

        assert_eq!(counter, 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[test]
    fn test_classifier_stops_retries() {
        let (handler, metrics) = handler(5, 1);
        let handler = handler.with_classifier(Arc::new(PredicateClassifier::new(|ctx| {
            ctx.error_as::<String>()
                .is_none_or(|e| !e.contains("401"))
        })));
        let mut counter = 0;

        let result: Result<(), _> = handler.execute_with_retry(|| {
            counter += 1;
            Err("HTTP 401".to_string())
        });

        assert_eq!(counter, 1);
        match result {
            Err(RetryError::NotRetryable { attempt, source, .. }) => {
                assert_eq!(attempt, 1);
                assert_eq!(source, "HTTP 401");
            }
            other => panic!("Expected RetryError::NotRetryable, got {:?}", other),
        }
        assert_eq!(
            metrics.count(names::RETRY_FAILURE, &[("reason", "not_retryable")]),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_backoff_schedule() {
        let (handler, _metrics) = handler(3, 1000);
        let start = tokio::time::Instant::now();
        let mut stamps = Vec::new();

        let result: Result<(), _> = handler
            .execute_with_retry_async(|| {
                stamps.push(start.elapsed());
                async { Err("unavailable") }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts(), 4);
        let gaps: Vec<u128> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_fails_twice_then_succeeds() {
        let (handler, _metrics) = handler(3, 1000);
        let start = tokio::time::Instant::now();
        let mut counter = 0;

        let result = handler
            .execute_with_retry_async(|| {
                counter += 1;
                let current = counter;
                async move {
                    if current < 3 {
                        Err(format!("attempt {} failed", current))
                    } else {
                        Ok(current)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_classifier_stops_retries_and_labels_attempts() {
        let (handler, metrics) = handler(5, 1000);
        let handler = handler.with_classifier(Arc::new(PredicateClassifier::new(|ctx| {
            ctx.error_as::<String>()
                .is_none_or(|e| !e.contains("401"))
        })));
        let start = tokio::time::Instant::now();
        let mut counter = 0;

        let result: Result<(), _> = handler
            .execute_with_retry_async(|| {
                counter += 1;
                let current = counter;
                async move {
                    if current == 1 {
                        Err("HTTP 503".to_string())
                    } else {
                        Err("HTTP 401".to_string())
                    }
                }
            })
            .await;

        assert_eq!(counter, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        match result {
            Err(RetryError::NotRetryable { service, attempt, source }) => {
                assert_eq!(service, "test");
                assert_eq!(attempt, 2);
                assert_eq!(source, "HTTP 401");
            }
            other => panic!("Expected RetryError::NotRetryable, got {:?}", other),
        }
        for attempt in ["1", "2"] {
            assert_eq!(
                metrics.count(
                    names::RETRY_ATTEMPT,
                    &[("service", "test"), ("attempt", attempt), ("outcome", "failure")]
                ),
                1
            );
        }
        assert_eq!(metrics.count(names::RETRY_ATTEMPT, &[("outcome", "success")]), 0);
        assert_eq!(
            metrics.count(
                names::RETRY_FAILURE,
                &[("service", "test"), ("reason", "not_retryable")]
            ),
            1
        );
        assert_eq!(
            metrics.count(names::RETRY_FAILURE, &[("reason", "max_retries_exceeded")]),
            0
        );
    }
}
