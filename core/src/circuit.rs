//! Circuit breaker implementation using atomic state
//!
//! The breaker is shared by every caller of one downstream dependency. Counters
//! and the last failure timestamp are independent atomics; the state is a single
//! atomic tag whose transitions are claimed with compare-and-swap so each
//! transition is reported once. The threshold check itself is not serialized
//! with the transition, so under contention the breaker may open a call or two
//! late; callers never observe a torn state.

use crate::{
    callbacks::{Callbacks, Transition},
    clock::{Clock, MonotonicClock},
    errors::CircuitError,
    telemetry::{MetricsFacade, MetricsSink, names},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consecutive failures in Closed that open the circuit
    pub failure_threshold: u32,

    /// Cool-down after the last failure before an Open circuit admits a probe
    #[serde(rename = "open_timeout_ms", with = "crate::config::serde_millis")]
    pub open_timeout: Duration,

    /// Consecutive successes in HalfOpen required to close the circuit
    pub half_open_max_calls: u32,

    /// Jitter factor for open_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        if self.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.half_open_max_calls == 0 {
            errors.push("circuit_breaker.half_open_max_calls must be at least 1".to_string());
        }
        if self.open_timeout.is_zero() {
            errors.push("circuit_breaker.open_timeout_ms must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            errors.push("circuit_breaker.jitter_factor must be within 0.0..=1.0".to_string());
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed = 0,
    /// Dependency presumed down, calls are rejected
    Open = 1,
    /// Cool-down elapsed, calls probe the dependency
    HalfOpen = 2,
}

impl CircuitState {
    /// Label used in logs and the `to` metric tag
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker guarding one named dependency
///
/// All methods take `&self`; share the breaker behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    config: Config,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_at: AtomicU64,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    callbacks: Callbacks,
}

impl CircuitBreaker {
    /// Create a breaker reporting to the `metrics` crate (use builder() for more options)
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        Self::with_parts(
            name.into(),
            config,
            Arc::new(MonotonicClock::new()),
            Arc::new(MetricsFacade),
            Callbacks::new(),
        )
    }

    pub(crate) fn with_parts(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_at: AtomicU64::new(0),
            clock,
            metrics,
            callbacks,
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// The operation is not invoked while the circuit is open; the call fails
    /// with [`CircuitError::Open`] instead. Operation errors come back as
    /// [`CircuitError::Execution`] after bookkeeping.
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let admitted = self.admit::<E>()?;
        let outcome = operation();
        self.settle(admitted, outcome)
    }

    /// Async counterpart of [`execute`](Self::execute) with the same state machine
    pub async fn execute_async<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admitted = self.admit::<E>()?;
        let outcome = operation().await;
        self.settle(admitted, outcome)
    }

    /// Decide whether a call may proceed, returning the state it runs under
    fn admit<E>(&self) -> Result<CircuitState, CircuitError<E>> {
        match self.current_state() {
            CircuitState::Open => {
                self.metrics
                    .increment(names::CIRCUIT_REJECTED, &[("name", self.name.as_str())]);
                tracing::debug!(circuit = %self.name, "Call rejected, circuit is open");
                Err(CircuitError::Open {
                    circuit: self.name.clone(),
                })
            }
            admitted => Ok(admitted),
        }
    }

    fn settle<T, E>(
        &self,
        admitted: CircuitState,
        outcome: Result<T, E>,
    ) -> Result<T, CircuitError<E>> {
        match outcome {
            Ok(value) => {
                self.on_success(admitted);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(admitted);
                Err(CircuitError::Execution(e))
            }
        }
    }

    /// State as seen by the next call, lapsing Open into HalfOpen once the
    /// cool-down has elapsed
    pub fn current_state(&self) -> CircuitState {
        let state = self.state();
        if state == CircuitState::Open && self.cool_down_elapsed() {
            self.transition(CircuitState::Open, CircuitState::HalfOpen);
            return self.state();
        }
        state
    }

    fn cool_down_elapsed(&self) -> bool {
        let last_failure = self.last_failure_at.load(Ordering::Acquire);
        let elapsed = self.clock.now_millis().saturating_sub(last_failure);

        // Apply jitter using chrono-machines if jitter_factor > 0
        let timeout_ms = if self.config.jitter_factor > 0.0 {
            let base = self.config.open_timeout.as_millis() as u64;
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: base,
                multiplier: 1.0,
                max_delay_ms: base,
            };
            policy.calculate_delay(1, self.config.jitter_factor) as u64
        } else {
            self.config.open_timeout.as_millis() as u64
        };

        // The probe is admitted strictly after the timeout
        elapsed > timeout_ms
    }

    fn on_success(&self, admitted: CircuitState) {
        self.failure_count.store(0, Ordering::Release);
        let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics
            .increment(names::CIRCUIT_SUCCESS, &[("name", self.name.as_str())]);

        if admitted == CircuitState::HalfOpen
            && successes >= self.config.half_open_max_calls
            && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
        {
            self.failure_count.store(0, Ordering::Release);
        }
    }

    fn on_failure(&self, admitted: CircuitState) {
        self.success_count.store(0, Ordering::Release);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_at
            .store(self.clock.now_millis(), Ordering::Release);
        self.metrics
            .increment(names::CIRCUIT_FAILURE, &[("name", self.name.as_str())]);

        match admitted {
            CircuitState::HalfOpen => {
                self.transition(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                self.transition(CircuitState::Closed, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Move `from -> to` if the breaker is still in `from`; reports the change
    /// only from the caller that won the swap
    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        if self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match to {
            CircuitState::Open => tracing::warn!(
                circuit = %self.name,
                from = %from,
                failures = self.failure_count.load(Ordering::Acquire),
                "Circuit breaker opened"
            ),
            _ => tracing::info!(circuit = %self.name, from = %from, to = %to, "Circuit breaker state change"),
        }

        self.metrics.increment(
            names::CIRCUIT_STATE_CHANGE,
            &[("name", self.name.as_str()), ("to", to.as_str())],
        );
        self.callbacks.fire(&Transition {
            circuit: &self.name,
            from,
            to,
        });
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stored state, without applying the cool-down check
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Consecutive successes since the last failure
    pub fn success_count(&self) -> u32 {
        self.success_count.load(Ordering::Acquire)
    }

    /// Clock reading of the most recent failure, in milliseconds
    pub fn last_failure_millis(&self) -> u64 {
        self.last_failure_at.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("success_count", &self.success_count())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemoryMetrics;
    use std::cell::Cell;

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>, Arc<MemoryMetrics>) {
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let circuit = CircuitBreaker::builder("test")
            .failure_threshold(threshold)
            .open_timeout(Duration::from_secs(30))
            .clock(clock.clone())
            .metrics(metrics.clone())
            .build();
        (circuit, clock, metrics)
    }

    fn fail(circuit: &CircuitBreaker) {
        let _ = circuit.execute(|| Err::<(), _>("boom"));
    }

    fn succeed(circuit: &CircuitBreaker) {
        let _ = circuit.execute(|| Ok::<_, &str>(()));
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let circuit = CircuitBreaker::new("test", Config::default());

        assert!(circuit.is_closed());
        assert!(!circuit.is_open());
        assert_eq!(circuit.name(), "test");
        assert_eq!(circuit.config().failure_threshold, 5);
        assert_eq!(circuit.config().open_timeout, Duration::from_secs(30));
        assert_eq!(circuit.config().half_open_max_calls, 3);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let (circuit, _clock, _metrics) = breaker(3);

        fail(&circuit);
        fail(&circuit);
        assert!(circuit.is_closed());
        assert_eq!(circuit.failure_count(), 2);

        fail(&circuit);
        assert!(circuit.is_open());
    }

    #[test]
    fn test_open_circuit_rejects_without_invoking() {
        let (circuit, _clock, metrics) = breaker(1);
        fail(&circuit);

        let invoked = Cell::new(false);
        let result = circuit.execute(|| {
            invoked.set(true);
            Ok::<_, &str>("unreachable")
        });

        assert!(!invoked.get());
        match result {
            Err(CircuitError::Open { circuit }) => assert_eq!(circuit, "test"),
            other => panic!("Expected CircuitError::Open, got {:?}", other),
        }
        assert_eq!(metrics.count(names::CIRCUIT_REJECTED, &[("name", "test")]), 1);
    }

    #[test]
    fn test_operation_error_passes_through() {
        let (circuit, _clock, _metrics) = breaker(5);

        let result = circuit.execute(|| Err::<(), _>("connection refused"));

        match result {
            Err(CircuitError::Execution(e)) => assert_eq!(e, "connection refused"),
            other => panic!("Expected CircuitError::Execution, got {:?}", other),
        }
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let (circuit, _clock, _metrics) = breaker(3);

        for _ in 0..10 {
            fail(&circuit);
            fail(&circuit);
            succeed(&circuit);
            assert_eq!(circuit.failure_count(), 0);
            assert!(circuit.is_closed());
        }
    }

    #[test]
    fn test_counters_never_both_nonzero() {
        let (circuit, _clock, _metrics) = breaker(100);

        for step in 0..20 {
            if step % 3 == 0 {
                succeed(&circuit);
            } else {
                fail(&circuit);
            }
            assert!(circuit.failure_count() == 0 || circuit.success_count() == 0);
        }
    }

    #[test]
    fn test_cool_down_admits_probe() {
        let (circuit, clock, metrics) = breaker(2);
        fail(&circuit);
        fail(&circuit);
        assert!(circuit.is_open());

        clock.advance(Duration::from_secs(29));
        assert_eq!(circuit.current_state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1001));
        let invoked = Cell::new(0);
        let result = circuit.execute(|| {
            invoked.set(invoked.get() + 1);
            Ok::<_, &str>(42)
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(invoked.get(), 1);
        assert!(circuit.is_half_open());
        assert_eq!(
            metrics.count(names::CIRCUIT_STATE_CHANGE, &[("to", "HALF_OPEN")]),
            1
        );
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let (circuit, clock, _metrics) = breaker(3);
        for _ in 0..3 {
            fail(&circuit);
        }
        clock.advance(Duration::from_secs(31));

        succeed(&circuit);
        succeed(&circuit);
        assert!(circuit.is_half_open());
        assert_eq!(circuit.success_count(), 2);

        fail(&circuit);
        assert!(circuit.is_open());
        assert_eq!(circuit.success_count(), 0);
        assert_eq!(circuit.last_failure_millis(), 31_000);

        // Cool-down restarts from the probe failure
        clock.advance(Duration::from_secs(10));
        assert_eq!(circuit.current_state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_closes_after_max_calls() {
        let (circuit, clock, metrics) = breaker(2);
        fail(&circuit);
        fail(&circuit);
        clock.advance(Duration::from_millis(30_001));

        succeed(&circuit);
        succeed(&circuit);
        assert!(circuit.is_half_open());

        succeed(&circuit);
        assert!(circuit.is_closed());
        assert_eq!(circuit.failure_count(), 0);
        assert_eq!(metrics.count(names::CIRCUIT_STATE_CHANGE, &[("to", "CLOSED")]), 1);
    }

    #[test]
    fn test_every_call_emits_exactly_one_outcome() {
        let (circuit, _clock, metrics) = breaker(2);

        succeed(&circuit);
        fail(&circuit);
        fail(&circuit);
        succeed(&circuit);
        succeed(&circuit);

        assert_eq!(metrics.total(names::CIRCUIT_SUCCESS), 1);
        assert_eq!(metrics.total(names::CIRCUIT_FAILURE), 2);
        assert_eq!(metrics.total(names::CIRCUIT_REJECTED), 2);
        assert_eq!(
            metrics.count(names::CIRCUIT_STATE_CHANGE, &[("name", "test"), ("to", "OPEN")]),
            1
        );
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let circuit = CircuitBreaker::builder("shared")
            .failure_threshold(5)
            .clock(clock)
            .metrics(metrics.clone())
            .build();

        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        let _ = circuit.execute(|| Err::<(), _>("down"));
                    }
                });
            }
        });

        assert!(circuit.is_open());
        assert_eq!(metrics.count(names::CIRCUIT_STATE_CHANGE, &[("to", "OPEN")]), 1);
        assert_eq!(
            metrics.total(names::CIRCUIT_FAILURE) + metrics.total(names::CIRCUIT_REJECTED),
            160
        );
    }

    #[test]
    fn test_debug_output_names_circuit() {
        let (circuit, _clock, _metrics) = breaker(2);
        fail(&circuit);

        let debug = format!("{:?}", circuit);

        assert!(debug.starts_with("CircuitBreaker {"));
        assert!(debug.contains("name: \"test\""));
        assert!(debug.contains("state: Closed"));
        assert!(debug.contains("failure_count: 1"));
    }

    #[test]
    fn test_jitter_disabled_uses_exact_timeout() {
        let clock = Arc::new(ManualClock::new());
        let circuit = CircuitBreaker::builder("test")
            .failure_threshold(1)
            .open_timeout(Duration::from_secs(1))
            .jitter_factor(0.0)
            .clock(clock.clone())
            .metrics(Arc::new(crate::NullMetrics))
            .build();
        fail(&circuit);

        clock.advance(Duration::from_millis(1000));
        assert_eq!(circuit.current_state(), CircuitState::Open);
        clock.advance(Duration::from_millis(1));
        assert_eq!(circuit.current_state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_still_open_at_exact_timeout() {
        let (circuit, clock, metrics) = breaker(1);
        fail(&circuit);

        clock.advance(Duration::from_secs(30));
        let invoked = Cell::new(false);
        let result = circuit.execute(|| {
            invoked.set(true);
            Ok::<_, &str>(())
        });

        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert!(!invoked.get());
        assert_eq!(circuit.current_state(), CircuitState::Open);
        assert_eq!(metrics.count(names::CIRCUIT_REJECTED, &[("name", "test")]), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(circuit.current_state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_jitter_never_extends_timeout() {
        for _ in 0..20 {
            let clock = Arc::new(ManualClock::new());
            let circuit = CircuitBreaker::builder("test")
                .failure_threshold(1)
                .open_timeout(Duration::from_secs(1))
                .jitter_factor(0.5)
                .clock(clock.clone())
                .metrics(Arc::new(crate::NullMetrics))
                .build();
            fail(&circuit);

            clock.advance(Duration::from_millis(1001));
            assert_eq!(circuit.current_state(), CircuitState::HalfOpen);
        }
    }

    #[tokio::test]
    async fn test_execute_async_shares_state_machine() {
        let (circuit, _clock, _metrics) = breaker(2);

        let ok = circuit.execute_async(|| async { Ok::<_, &str>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let _ = circuit.execute_async(|| async { Err::<(), _>("timeout") }).await;
        let _ = circuit.execute_async(|| async { Err::<(), _>("timeout") }).await;
        assert!(circuit.is_open());

        let rejected = circuit.execute_async(|| async { Ok::<_, &str>(8) }).await;
        assert!(matches!(rejected, Err(CircuitError::Open { .. })));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.as_str(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.as_str(), "HALF_OPEN");
    }
}
