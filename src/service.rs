//! Admission service façade.
//!
//! Transport-neutral request handling: input validation, delegation to the
//! [`TokenBucketLimiter`], failure mapping onto a closed set of [`Code`]s and
//! per-decision metrics. The HTTP adapter lives in `http`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{BucketStore, Metrics, TokenBucketLimiter, key_prefix};

/// Outcome class of a façade call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    /// Success.
    Ok,
    /// The request was malformed (e.g. empty key). Not retryable.
    InvalidArgument,
    /// The caller's deadline expired before the store answered.
    DeadlineExceeded,
    /// The store failed or replied with garbage. Callers apply their own backoff.
    Internal,
}

impl Code {
    /// Every code with its transport mapping: `(code, http status, grpc status)`.
    pub const MAPPING: [(Code, u16, i32); 4] = [
        (Code::Ok, 200, 0),
        (Code::InvalidArgument, 400, 3),
        (Code::DeadlineExceeded, 504, 4),
        (Code::Internal, 500, 13),
    ];

    /// HTTP status code for this outcome.
    pub fn http_status(self) -> u16 {
        Self::MAPPING
            .iter()
            .find(|(code, _, _)| *code == self)
            .map(|(_, http, _)| *http)
            .unwrap_or(500)
    }

    /// gRPC status code for this outcome.
    pub fn grpc_code(self) -> i32 {
        Self::MAPPING
            .iter()
            .find(|(code, _, _)| *code == self)
            .map(|(_, _, grpc)| *grpc)
            .unwrap_or(13)
    }
}

/// A failed façade call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    /// Outcome class.
    pub code: Code,
    /// Diagnostic text.
    pub message: String,
}

impl Status {
    /// Input validation failure.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: Code::InvalidArgument,
            message: message.into(),
        }
    }

    /// Store or internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: Code::Internal,
            message: message.into(),
        }
    }

    /// Deadline expiry.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self {
            code: Code::DeadlineExceeded,
            message: message.into(),
        }
    }
}

/// `Allow` request. Zero or negative `tokens`, `burst` and `rate` select defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AllowRequest {
    /// Caller key, e.g. `user:123`.
    pub key: String,
    /// Tokens to consume.
    #[serde(default)]
    pub tokens: i64,
    /// Capacity override.
    #[serde(default)]
    pub burst: i64,
    /// Refill rate override (tokens per second).
    #[serde(default)]
    pub rate: f64,
}

/// `Allow` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllowResponse {
    /// Whether the tokens were consumed.
    pub allowed: bool,
    /// Whole tokens left.
    pub remaining: i64,
    /// Capacity used.
    pub limit: i64,
    /// Epoch seconds at which the bucket is full again.
    pub reset_at: i64,
    /// Seconds until the request would succeed; `0` when allowed.
    pub retry_after: f64,
}

/// `Peek` request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PeekRequest {
    /// Caller key.
    pub key: String,
}

/// `Peek` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeekResponse {
    /// Whole tokens available.
    pub remaining: i64,
    /// Capacity used.
    pub limit: i64,
    /// Epoch seconds at which the bucket is full again.
    pub reset_at: i64,
}

/// Health of the store as seen by this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    /// The store answered the liveness probe.
    Serving,
    /// The store did not answer.
    NotServing,
}

/// `HealthCheck` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResponse {
    /// Serving status.
    pub status: ServingStatus,
    /// `ok`, or the store error text.
    pub store_status: String,
}

/// The admission service.
#[derive(Debug)]
pub struct AdmissionService<S> {
    limiter: Arc<TokenBucketLimiter<S>>,
    metrics: Arc<Metrics>,
}

impl<S: BucketStore> AdmissionService<S> {
    /// Create the façade over a shared limiter.
    pub fn new(limiter: Arc<TokenBucketLimiter<S>>, metrics: Arc<Metrics>) -> Self {
        Self { limiter, metrics }
    }

    /// The wrapped limiter.
    pub fn limiter(&self) -> &TokenBucketLimiter<S> {
        &self.limiter
    }

    /// The metric families this service records into.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Consume tokens for `request.key`.
    pub async fn allow(&self, request: AllowRequest) -> Result<AllowResponse, Status> {
        let _timer = self.metrics.request_timer("Allow");
        self.allow_inner(request).await
    }

    async fn allow_inner(&self, request: AllowRequest) -> Result<AllowResponse, Status> {
        validate_key(&request.key)?;

        let decision = self
            .limiter
            .allow(&request.key, request.tokens, request.burst, request.rate)
            .await
            .map_err(|err| {
                self.metrics.inc_internal_error("Allow", err.kind());
                Status::internal(format!("rate limit check failed: {err}"))
            })?;

        self.metrics.record_decision(
            key_prefix(&request.key),
            decision.allowed,
            decision.remaining,
        );

        Ok(AllowResponse {
            allowed: decision.allowed,
            remaining: decision.remaining,
            limit: decision.limit,
            reset_at: decision.reset_at,
            retry_after: decision.retry_after,
        })
    }

    /// Observe `request.key`'s bucket with the default parameters.
    pub async fn peek(&self, request: PeekRequest) -> Result<PeekResponse, Status> {
        let _timer = self.metrics.request_timer("Peek");
        self.peek_inner(request).await
    }

    async fn peek_inner(&self, request: PeekRequest) -> Result<PeekResponse, Status> {
        validate_key(&request.key)?;

        let decision = self
            .limiter
            .peek(&request.key, 0, 0f64)
            .await
            .map_err(|err| {
                self.metrics.inc_internal_error("Peek", err.kind());
                Status::internal(format!("peek failed: {err}"))
            })?;

        Ok(PeekResponse {
            remaining: decision.remaining,
            limit: decision.limit,
            reset_at: decision.reset_at,
        })
    }

    /// Report store liveness. Never fails; an unreachable store is `NotServing`.
    pub async fn health_check(&self) -> HealthCheckResponse {
        let _timer = self.metrics.request_timer("HealthCheck");
        match self.limiter.ping().await {
            Ok(()) => HealthCheckResponse {
                status: ServingStatus::Serving,
                store_status: "ok".to_string(),
            },
            Err(err) => {
                tracing::warn!(error = %err, "store health check failed");
                HealthCheckResponse {
                    status: ServingStatus::NotServing,
                    store_status: err.to_string(),
                }
            }
        }
    }
}

fn validate_key(key: &str) -> Result<(), Status> {
    if key.is_empty() {
        return Err(Status::invalid_argument("key is required"));
    }
    Ok(())
}
