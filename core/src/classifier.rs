//! Retry classification for failed attempts
//!
//! A classifier decides whether a failed attempt is worth retrying. The
//! default, [`RetryAll`], retries every error uniformly, including
//! [`CircuitError::Open`](crate::CircuitError::Open) from a nested breaker.

use std::any::Any;

/// Context provided to retry classifiers for error evaluation
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// Service label of the retry handler
    pub service: &'a str,
    /// 1-based number of the attempt that just failed
    pub attempt: u32,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
}

impl RetryContext<'_> {
    /// Downcast the error to a concrete type
    pub fn error_as<E: 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }
}

/// Trait for classifying failures - determines if an attempt should be retried
///
/// # Examples
///
/// ```rust
/// use mcp_resilience::{CircuitError, RetryClassifier, RetryContext};
///
/// #[derive(Debug)]
/// struct SkipOpenCircuit;
///
/// impl RetryClassifier for SkipOpenCircuit {
///     fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
///         // Retrying a rejected call only burns attempts
///         !ctx.error_as::<CircuitError<std::io::Error>>()
///             .is_some_and(|e| e.is_open())
///     }
/// }
/// ```
pub trait RetryClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` to retry, `false` to fail immediately with the error
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool;
}

/// Default classifier that retries every error
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl RetryClassifier for RetryAll {
    fn should_retry(&self, _ctx: &RetryContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&RetryContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&RetryContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> RetryClassifier for PredicateClassifier<F>
where
    F: Fn(&RetryContext<'_>) -> bool + Send + Sync,
{
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&RetryContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
