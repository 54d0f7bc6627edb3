//! Configuration for the shared resilience layer
//!
//! Every section derives Serde with `#[serde(default)]`, so a config file only
//! needs the keys it overrides. Durations are written as integer milliseconds.
//!
//! ```toml
//! [circuit_breaker]
//! failure_threshold = 3
//! open_timeout_ms = 10000
//!
//! [retry]
//! max_retries = 2
//! base_delay_ms = 250
//!
//! [http_client]
//! user_agent = "2.1.0"
//! ```

use crate::{
    circuit::Config,
    clock::MonotonicClock,
    errors::ConfigError,
    registry::CircuitBreakerRegistry,
    retry::{RetryConfig, RetryHandler},
    telemetry::MetricsSink,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Defaults for breakers handed out by the registry
    pub circuit_breaker: Config,
    /// Defaults for retry handlers
    pub retry: RetryConfig,
    /// Settings for the shared outbound HTTP client
    pub http_client: HttpClientConfig,
}

impl ResilienceConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        self.circuit_breaker.validate(&mut errors);
        self.retry.validate(&mut errors);
        self.http_client.validate(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Registry whose breakers default to the `circuit_breaker` section
    pub fn registry(&self, metrics: Arc<dyn MetricsSink>) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::with_parts(
            self.circuit_breaker.clone(),
            Arc::new(MonotonicClock::new()),
            metrics,
        )
    }

    /// Retry handler for `service` using the `retry` section
    pub fn retry_handler(
        &self,
        service: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> RetryHandler {
        RetryHandler::new(service, self.retry.clone()).with_metrics(metrics)
    }
}

/// Settings for the shared outbound HTTP client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    #[serde(rename = "connect_timeout_ms", with = "serde_millis")]
    pub connect_timeout: Duration,

    /// Deadline for a whole request, response body included
    #[serde(rename = "request_timeout_ms", with = "serde_millis")]
    pub request_timeout: Duration,

    /// Idle connections kept per host
    pub max_idle_connections: usize,

    /// How long an idle pooled connection is kept
    #[serde(rename = "keep_alive_ms", with = "serde_millis")]
    pub keep_alive: Duration,

    /// Version appended to the `MCP-Monkeys/` user agent
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_idle_connections: 10,
            keep_alive: Duration::from_secs(5 * 60),
            user_agent: "1.0.0".to_string(),
        }
    }
}

impl HttpClientConfig {
    /// Full `User-Agent` header value
    pub fn user_agent_header(&self) -> String {
        format!("MCP-Monkeys/{}", self.user_agent)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.connect_timeout.is_zero() {
            errors.push("http_client.connect_timeout_ms must be greater than 0".to_string());
        }
        if self.request_timeout.is_zero() {
            errors.push("http_client.request_timeout_ms must be greater than 0".to_string());
        }
        if self.user_agent.trim().is_empty() {
            errors.push("http_client.user_agent must not be empty".to_string());
        }
    }
}

/// Serde helpers writing `Duration` as integer milliseconds
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    /// Same encoding for `Option<Duration>`
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}
