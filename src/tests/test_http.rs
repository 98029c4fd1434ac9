use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::Value as Json;
use tower::ServiceExt;

use crate::{AdmissionService, BucketStore, EVAL_TOKEN_BUCKET, HttpOptions, http};

use super::{
    runtime,
    support::{Harness, ScriptedStore, StalledStore, harness, harness_with},
};

fn app<S: BucketStore + 'static>(h: &Harness<S>) -> Router {
    let service = AdmissionService::new(Arc::clone(&h.limiter), Arc::clone(&h.metrics));
    http::router(Arc::new(service), &HttpOptions::default())
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, Json) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[test]
fn allow_returns_the_decision() {
    let h = harness(2, 1.0);

    runtime::block_on(async {
        let (status, body) =
            send_json(app(&h), post_json("/v1/allow", r#"{"key":"user:1","tokens":1}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 1);
        assert_eq!(body["limit"], 2);
        assert_eq!(body["retry_after"], 0.0);
    });
}

#[test]
fn denial_is_still_ok() {
    let h = harness(1, 1.0);

    runtime::block_on(async {
        send(app(&h), post_json("/v1/allow", r#"{"key":"user:1"}"#)).await;

        let (status, body) = send_json(app(&h), post_json("/v1/allow", r#"{"key":"user:1"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], false);
        assert_eq!(body["retry_after"], 1.0);
    });
}

#[test]
fn empty_key_is_a_bad_request() {
    let h = harness(2, 1.0);

    runtime::block_on(async {
        let (status, body) = send_json(app(&h), post_json("/v1/allow", r#"{"key":""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_ARGUMENT");
        assert_eq!(body["error"], "key is required");
    });
}

#[test]
fn store_failure_is_an_internal_error() {
    let h = harness_with(ScriptedStore::failing("connection refused"), 2, 1.0);

    runtime::block_on(async {
        let (status, body) = send_json(app(&h), post_json("/v1/allow", r#"{"key":"a"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "INTERNAL");
    });
}

#[test]
fn peek_reports_remaining_tokens() {
    let h = harness(10, 1.0);

    runtime::block_on(async {
        send(app(&h), post_json("/v1/allow", r#"{"key":"k","tokens":4}"#)).await;

        let (status, body) = send_json(app(&h), post_json("/v1/peek", r#"{"key":"k"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 6);
        assert_eq!(body["limit"], 10);
        assert!(body.get("allowed").is_none());
    });
}

#[test]
fn structured_health_check_always_answers() {
    let up = harness(1, 1.0);
    let down = harness_with(ScriptedStore::failing("connection refused"), 1, 1.0);

    runtime::block_on(async {
        let (status, body) = send_json(app(&up), get("/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SERVING");
        assert_eq!(body["store_status"], "ok");

        let (status, body) = send_json(app(&down), get("/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "NOT_SERVING");
    });
}

#[test]
fn plain_health_reflects_store() {
    let up = harness(1, 1.0);
    let down = harness_with(ScriptedStore::failing("connection refused"), 1, 1.0);

    runtime::block_on(async {
        let (status, body) = send(app(&up), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");

        let (status, body) = send(app(&down), get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(String::from_utf8(body).unwrap().starts_with("redis: "));
    });
}

#[test]
fn metrics_are_exposed_after_traffic() {
    let h = harness(5, 1.0);

    runtime::block_on(async {
        send(app(&h), post_json("/v1/allow", r#"{"key":"user:1"}"#)).await;

        let (status, body) = send(app(&h), get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);

        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("ratelimiter_requests_total"));
        assert!(text.contains(r#"decision="allowed""#));
        assert!(text.contains("ratelimiter_redis_latency_seconds"));
    });
}

#[test]
fn deadline_expiry_is_timed_and_counted() {
    let h = harness_with(StalledStore::new(Duration::from_millis(200)), 1, 1.0);
    let service = Arc::new(AdmissionService::new(
        Arc::clone(&h.limiter),
        Arc::clone(&h.metrics),
    ));
    let options = HttpOptions {
        request_timeout: Duration::from_millis(20),
        ..HttpOptions::default()
    };

    runtime::block_on(async {
        let router = http::router(Arc::clone(&service), &options);
        let (status, body) = send_json(router, post_json("/v1/allow", r#"{"key":"a"}"#)).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "DEADLINE_EXCEEDED");

        let router = http::router(Arc::clone(&service), &options);
        let (status, _) = send_json(router, post_json("/v1/peek", r#"{"key":"a"}"#)).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    });

    let rpc_samples = |method: &str| {
        h.metrics
            .request_duration_seconds
            .with_label_values(&[method])
            .get_sample_count()
    };
    assert_eq!(rpc_samples("Allow"), 1);
    assert_eq!(rpc_samples("Peek"), 1);

    let store_samples = h
        .metrics
        .redis_latency_seconds
        .with_label_values(&[EVAL_TOKEN_BUCKET])
        .get_sample_count();
    assert_eq!(store_samples, 2);
    assert_eq!(h.metrics.redis_errors_total.get(), 2);

    let deadlines = |method: &str| {
        h.metrics
            .internal_errors_total
            .with_label_values(&[method, "deadline"])
            .get()
    };
    assert_eq!(deadlines("Allow"), 1);
    assert_eq!(deadlines("Peek"), 1);
}
