//! Shared outbound HTTP client and classification of its failures

use crate::classifier::{RetryClassifier, RetryContext};
use crate::config::HttpClientConfig;
use crate::errors::CircuitError;
use crate::telemetry::{MetricsSink, names};
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;

impl HttpClientConfig {
    /// Build the `reqwest::Client` every downstream caller should share
    ///
    /// The client is internally reference counted; clone it rather than
    /// building one per request so the connection pool is reused.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        tracing::info!(
            connect_timeout = ?self.connect_timeout,
            request_timeout = ?self.request_timeout,
            max_idle_connections = self.max_idle_connections,
            keep_alive = ?self.keep_alive,
            "Building shared HTTP client"
        );

        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(self.max_idle_connections)
            .pool_idle_timeout(self.keep_alive)
            .user_agent(self.user_agent_header())
            .build()
    }
}

/// What went wrong with a downstream API call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    /// HTTP 400
    BadRequest,
    /// HTTP 401 or 403
    Auth,
    /// HTTP 404
    NotFound,
    /// HTTP 429
    RateLimited,
    /// Any 5xx
    Server,
    /// The request never produced a response
    Network,
    /// The request timed out
    Timeout,
    /// Any other non-success status
    Unknown,
}

impl ApiErrorKind {
    /// Map a response status; `None` for 2xx
    pub fn from_status(status: StatusCode) -> Option<Self> {
        if status.is_success() {
            return None;
        }
        Some(match status.as_u16() {
            400 => Self::BadRequest,
            401 | 403 => Self::Auth,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        })
    }

    /// Classify a transport error reported by `reqwest`
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(kind) = err.status().and_then(Self::from_status) {
            kind
        } else if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network
        }
    }

    /// Error code shared with the MCP servers' error payloads
    pub fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Auth => "INVALID_API_KEY",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMIT_EXCEEDED",
            Self::Server => "SERVER_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Value of the `type` label on `api.error`
    pub fn metric_type(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limit",
            Self::Server => "server_error",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Transient failures worth another attempt
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server | Self::Network | Self::Timeout
        )
    }
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A failed downstream API call
#[derive(Debug, Error)]
#[error("{service}: API call failed with {kind}{}", status_suffix(.status))]
pub struct ApiError {
    pub service: String,
    pub kind: ApiErrorKind,
    /// Response status, when the server answered
    pub status: Option<StatusCode>,
    #[source]
    pub source: Option<reqwest::Error>,
}

fn status_suffix(status: &Option<StatusCode>) -> String {
    status
        .map(|s| format!(" (HTTP {})", s.as_u16()))
        .unwrap_or_default()
}

impl ApiError {
    /// Error for a non-success response status; `None` for 2xx
    pub fn from_status(service: impl Into<String>, status: StatusCode) -> Option<Self> {
        ApiErrorKind::from_status(status).map(|kind| Self {
            service: service.into(),
            kind,
            status: Some(status),
            source: None,
        })
    }

    pub fn from_reqwest(service: impl Into<String>, err: reqwest::Error) -> Self {
        Self {
            service: service.into(),
            kind: ApiErrorKind::from_reqwest(&err),
            status: err.status(),
            source: Some(err),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Turns responses of one service into `ApiError`s and counts the outcomes
///
/// Every checked call increments `api.success{service}` or
/// `api.error{service,type}`.
#[derive(Debug, Clone)]
pub struct ApiCalls {
    service: String,
    metrics: Arc<dyn MetricsSink>,
}

impl ApiCalls {
    pub fn new(service: impl Into<String>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            service: service.into(),
            metrics,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Send a request and fail on transport errors or non-2xx statuses
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ApiError> {
        match request.send().await {
            Ok(response) => {
                self.check_status(response.status())?;
                Ok(response)
            }
            Err(err) => {
                tracing::error!(service = %self.service, error = %err, "HTTP request failed");
                Err(self.record(ApiError::from_reqwest(self.service.as_str(), err)))
            }
        }
    }

    /// Record and classify a response status
    pub fn check_status(&self, status: StatusCode) -> Result<StatusCode, ApiError> {
        match ApiError::from_status(self.service.as_str(), status) {
            None => {
                self.metrics
                    .increment(names::API_SUCCESS, &[("service", self.service.as_str())]);
                Ok(status)
            }
            Some(err) => {
                tracing::warn!(
                    service = %self.service,
                    status = status.as_u16(),
                    code = err.kind.code(),
                    "API call returned an error status"
                );
                Err(self.record(err))
            }
        }
    }

    fn record(&self, err: ApiError) -> ApiError {
        self.metrics.increment(
            names::API_ERROR,
            &[
                ("service", self.service.as_str()),
                ("type", err.kind.metric_type()),
            ],
        );
        err
    }
}

/// Retries only transient API failures
///
/// Retries rate limiting, 5xx, network errors, timeouts and `std::io::Error`,
/// whether raised directly or inside [`CircuitError::Execution`]. Everything
/// else, a rejection by an open circuit included, fails on the first attempt.
/// Opt in with [`RetryHandler::with_classifier`](crate::RetryHandler::with_classifier).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientApiErrors;

impl TransientApiErrors {
    fn check<E: 'static>(ctx: &RetryContext<'_>, retryable: impl Fn(&E) -> bool) -> Option<bool> {
        if let Some(err) = ctx.error_as::<E>() {
            return Some(retryable(err));
        }
        ctx.error_as::<CircuitError<E>>()
            .map(|err| err.execution().is_some_and(&retryable))
    }
}

impl RetryClassifier for TransientApiErrors {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        Self::check::<ApiError>(ctx, ApiError::is_retryable)
            .or_else(|| {
                Self::check::<reqwest::Error>(ctx, |e| ApiErrorKind::from_reqwest(e).is_retryable())
            })
            .or_else(|| Self::check::<std::io::Error>(ctx, |_| true))
            .unwrap_or(false)
    }
}
