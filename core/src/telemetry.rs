//! Metrics sinks for circuit breaker and retry events
//!
//! This module provides different sink implementations:
//! - `MetricsFacade`: Forwards counters to the `metrics` crate recorder
//! - `MemoryMetrics`: Thread-safe in-memory counter log for tests and inspection
//! - `NullMetrics`: No-op sink

use std::sync::{PoisonError, RwLock};

/// Counter names emitted by this crate
pub mod names {
    pub const CIRCUIT_SUCCESS: &str = "circuit_breaker.success";
    pub const CIRCUIT_FAILURE: &str = "circuit_breaker.failure";
    pub const CIRCUIT_REJECTED: &str = "circuit_breaker.rejected";
    pub const CIRCUIT_STATE_CHANGE: &str = "circuit_breaker.state_change";
    pub const RETRY_ATTEMPT: &str = "retry.attempt";
    pub const RETRY_FAILURE: &str = "retry.failure";
    pub const API_SUCCESS: &str = "api.success";
    pub const API_ERROR: &str = "api.error";
}

/// Anything that can increment a named counter carrying string labels
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]);
}

/// Sink forwarding to whatever recorder is installed for the `metrics` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsFacade;

impl MetricsSink for MetricsFacade {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        let labels: Vec<::metrics::Label> = labels
            .iter()
            .map(|(key, value)| ::metrics::Label::new(*key, value.to_string()))
            .collect();
        ::metrics::counter!(name, labels).increment(1);
    }
}

/// A single recorded counter increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl Increment {
    fn matches(&self, name: &str, labels: &[(&str, &str)]) -> bool {
        self.name == name
            && labels
                .iter()
                .all(|(k, v)| self.labels.iter().any(|(lk, lv)| lk == k && lv == v))
    }
}

/// Thread-safe in-memory sink
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    increments: RwLock<Vec<Increment>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of increments of `name` whose labels include every pair in `labels`
    pub fn count(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        let increments = self
            .increments
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        increments.iter().filter(|i| i.matches(name, labels)).count()
    }

    /// Number of increments of `name` regardless of labels
    pub fn total(&self, name: &str) -> usize {
        self.count(name, &[])
    }

    /// Copy of every recorded increment, oldest first
    pub fn increments(&self) -> Vec<Increment> {
        self.increments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.increments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetricsSink for MemoryMetrics {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        let increment = Increment {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.increments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(increment);
    }
}

/// No-op sink
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn increment(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
}
