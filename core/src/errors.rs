//! Error types for circuit breaker, retry and configuration operations

use thiserror::Error;

/// Errors returned by [`CircuitBreaker::execute`](crate::CircuitBreaker::execute)
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("Circuit breaker is OPEN for {circuit}")]
    Open { circuit: String },
    /// The wrapped operation failed; the original error is carried unchanged
    #[error("{0}")]
    Execution(#[source] E),
}

impl<E> CircuitError<E> {
    /// True when the call was rejected without invoking the operation
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// Borrow the underlying operation error, if any
    pub fn execution(&self) -> Option<&E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }

    /// Take the underlying operation error, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

/// Errors returned by [`RetryHandler`](crate::RetryHandler)
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed; `source` is the error of the final attempt
    #[error("{service}: operation failed after {attempts} attempts: {source}")]
    Exhausted {
        service: String,
        attempts: u32,
        #[source]
        source: E,
    },
    /// The classifier refused to retry this error
    #[error("{service}: attempt {attempt} failed with a non-retryable error: {source}")]
    NotRetryable {
        service: String,
        attempt: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::NotRetryable { attempt, .. } => *attempt,
        }
    }

    /// Service label the handler was created for
    pub fn service(&self) -> &str {
        match self {
            RetryError::Exhausted { service, .. } | RetryError::NotRetryable { service, .. } => {
                service
            }
        }
    }

    /// Borrow the last underlying error
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::NotRetryable { source, .. } => {
                source
            }
        }
    }

    /// Take the last underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::NotRetryable { source, .. } => {
                source
            }
        }
    }
}

/// Errors raised while loading [`ResilienceConfig`](crate::ResilienceConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", .0.join(", "))]
    Invalid(Vec<String>),
}
