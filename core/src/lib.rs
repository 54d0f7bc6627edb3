//! MCP Resilience - shared failure handling for downstream calls
//!
//! This crate provides the resilience layer every MCP server wraps its remote
//! calls in:
//! - Lock-free circuit breaker state machine (Closed → Open → HalfOpen)
//! - Registry handing out one breaker per dependency name
//! - Retry handler with exponential backoff, blocking and async
//! - Counter metrics for every outcome and state change
//! - TOML configuration, including the shared HTTP client settings
//! - HTTP error classification and an opt-in classifier for transient failures
//!
//! # Example
//!
//! ```rust
//! use mcp_resilience::{CircuitBreakerRegistry, RetryConfig, RetryHandler};
//! use std::time::Duration;
//!
//! let registry = CircuitBreakerRegistry::default();
//! let breaker = registry.get("calendar");
//! let retry = RetryHandler::new(
//!     "calendar",
//!     RetryConfig::default().with_base_delay(Duration::from_millis(1)),
//! );
//!
//! let result = retry.execute_with_retry(|| {
//!     breaker.execute(|| {
//!         // Your service call here
//!         Ok::<_, std::io::Error>("3 events today")
//!     })
//! });
//! assert_eq!(result.unwrap(), "3 events today");
//!
//! // A rejected call never reaches the dependency
//! if breaker.is_open() {
//!     println!("calendar is down, skipping call");
//! }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
#[cfg(feature = "http")]
pub mod http;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use builder::CircuitBuilder;
pub use callbacks::{Callbacks, Transition};
pub use circuit::{CircuitBreaker, CircuitState, Config};
pub use classifier::{PredicateClassifier, RetryAll, RetryClassifier, RetryContext};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{HttpClientConfig, ResilienceConfig};
pub use errors::{CircuitError, ConfigError, RetryError};
#[cfg(feature = "http")]
pub use http::{ApiCalls, ApiError, ApiErrorKind, TransientApiErrors};
pub use registry::{BreakerSnapshot, CircuitBreakerRegistry};
pub use retry::{RetryConfig, RetryHandler};
pub use telemetry::{MemoryMetrics, MetricsFacade, MetricsSink, NullMetrics};
