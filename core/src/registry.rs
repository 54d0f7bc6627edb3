//! Process-wide lookup of circuit breakers by dependency name
//!
//! The registry is an ordinary value: construct one at startup, share it behind
//! an `Arc`, and build a fresh one per test.

use crate::{
    circuit::{CircuitBreaker, CircuitState, Config},
    clock::{Clock, MonotonicClock},
    telemetry::{MetricsFacade, MetricsSink},
};
use dashmap::DashMap;
use std::sync::Arc;

/// Point-in-time view of one registered breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// Lazily populated map from name to breaker; entries are never removed
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: Config,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreakerRegistry {
    /// Registry handing out breakers with `default_config`, reporting to the `metrics` crate
    pub fn new(default_config: Config) -> Self {
        Self::with_parts(
            default_config,
            Arc::new(MonotonicClock::new()),
            Arc::new(MetricsFacade),
        )
    }

    /// Registry whose breakers share the given clock and metrics sink
    pub fn with_parts(
        default_config: Config,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            clock,
            metrics,
        }
    }

    /// Get or create the breaker for `name` using the registry defaults
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(name, || self.default_config.clone())
    }

    /// Get or create the breaker for `name`
    ///
    /// `config` is only evaluated when the breaker does not exist yet; an
    /// existing breaker keeps the configuration it was created with. It runs
    /// outside the map's locks, so it may itself use the registry.
    pub fn get_with_config<C>(&self, name: &str, config: C) -> Arc<CircuitBreaker>
    where
        C: FnOnce() -> Config,
    {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        // Losing the insert race below discards this config
        let config = config();

        // The entry holds the shard lock, so concurrent first lookups create one breaker
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            tracing::info!(
                circuit = name,
                failure_threshold = config.failure_threshold,
                open_timeout = ?config.open_timeout,
                half_open_max_calls = config.half_open_max_calls,
                "Circuit breaker created"
            );
            Arc::new(CircuitBreaker::with_parts(
                name.to_string(),
                config,
                Arc::clone(&self.clock),
                Arc::clone(&self.metrics),
                Default::default(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Look up a breaker without creating it
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of every registered breaker, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// State and counters of every registered breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                BreakerSnapshot {
                    name: entry.key().clone(),
                    state: breaker.state(),
                    failure_count: breaker.failure_count(),
                    success_count: breaker.success_count(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn default_config(&self) -> &Config {
        &self.default_config
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
