//! HTTP/JSON transport for the [`AdmissionService`].
//!
//! | route | body | reply |
//! |---|---|---|
//! | `POST /v1/allow` | [`AllowRequest`] | [`AllowResponse`](crate::AllowResponse) |
//! | `POST /v1/peek` | [`PeekRequest`] | [`PeekResponse`](crate::PeekResponse) |
//! | `GET /v1/health` | | [`HealthCheckResponse`](crate::HealthCheckResponse), always 200 |
//! | `GET /health` | | `ok` (200) or `redis: <error>` (503) |
//! | `GET /metrics` | | Prometheus text exposition |
//!
//! A denial is a 200 with `allowed: false`. Failures carry
//! `{"code": "...", "error": "..."}` with the status from [`Code::http_status`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower::limit::GlobalConcurrencyLimitLayer;

use crate::{AdmissionService, AllowRequest, BucketStore, Code, PeekRequest, Status};

/// Requests slower than this are logged.
pub const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_millis(50);

/// Transport limits.
#[derive(Clone, Debug)]
pub struct HttpOptions {
    /// Maximum request body size in bytes.
    pub max_request_bytes: usize,
    /// Maximum number of requests handled at once; extra requests wait.
    pub max_concurrent_requests: usize,
    /// Deadline for one request, store round trip included.
    pub request_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            max_request_bytes: 4 * 1024 * 1024,
            max_concurrent_requests: 1000,
            request_timeout: Duration::from_secs(1),
        }
    }
}

struct AppState<S> {
    service: Arc<AdmissionService<S>>,
    request_timeout: Duration,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            request_timeout: self.request_timeout,
        }
    }
}

impl IntoResponse for Status {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "code": self.code, "error": self.message }));
        (status, body).into_response()
    }
}

/// Build the router for `service`.
pub fn router<S>(service: Arc<AdmissionService<S>>, options: &HttpOptions) -> Router
where
    S: BucketStore + 'static,
{
    let state = AppState {
        service,
        request_timeout: options.request_timeout,
    };

    Router::new()
        .route("/v1/allow", post(allow::<S>))
        .route("/v1/peek", post(peek::<S>))
        .route("/v1/health", get(health_check::<S>))
        .route("/health", get(health::<S>))
        .route("/metrics", get(metrics::<S>))
        .layer(DefaultBodyLimit::max(options.max_request_bytes))
        .layer(GlobalConcurrencyLimitLayer::new(
            options.max_concurrent_requests.max(1),
        ))
        .layer(middleware::from_fn(log_slow_requests))
        .with_state(state)
}

async fn allow<S: BucketStore + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<AllowRequest>,
) -> Result<Response, Status> {
    let response = tokio::time::timeout(state.request_timeout, state.service.allow(request))
        .await
        .map_err(|_| deadline_exceeded(&state, "Allow", "rate limit check timed out"))??;

    Ok(Json(response).into_response())
}

async fn peek<S: BucketStore + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<PeekRequest>,
) -> Result<Response, Status> {
    let response = tokio::time::timeout(state.request_timeout, state.service.peek(request))
        .await
        .map_err(|_| deadline_exceeded(&state, "Peek", "peek timed out"))??;

    Ok(Json(response).into_response())
}

fn deadline_exceeded<S: BucketStore>(state: &AppState<S>, method: &str, message: &str) -> Status {
    state.service.metrics().inc_internal_error(method, "deadline");
    tracing::warn!(
        method,
        timeout_ms = state.request_timeout.as_millis() as u64,
        "request deadline exceeded"
    );
    Status::deadline_exceeded(message)
}

async fn health_check<S: BucketStore + 'static>(State(state): State<AppState<S>>) -> Response {
    Json(state.service.health_check().await).into_response()
}

async fn health<S: BucketStore + 'static>(State(state): State<AppState<S>>) -> Response {
    match state.service.limiter().ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, format!("redis: {err}")).into_response(),
    }
}

async fn metrics<S: BucketStore + 'static>(State(state): State<AppState<S>>) -> Response {
    match state.service.metrics().encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            Status {
                code: Code::Internal,
                message: err.to_string(),
            }
            .into_response()
        }
    }
}

async fn log_slow_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let start = Instant::now();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    if elapsed > SLOW_REQUEST_THRESHOLD {
        tracing::warn!(
            %method,
            %path,
            elapsed_ms = elapsed.as_millis() as u64,
            status = response.status().as_u16(),
            "slow request"
        );
    }

    response
}
