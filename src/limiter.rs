//! Token-bucket limiter client.
//!
//! [`TokenBucketLimiter`] is the only caller of the bucket store. It resolves per-call
//! overrides against process defaults, namespaces keys, stamps each call with the
//! caller's clock and turns the store's raw reply into a [`Decision`].

use std::sync::Arc;

use prometheus::HistogramTimer;
use redis::Value;

use crate::{
    BucketCapacity, BucketScriptArgs, BucketStore, Clock, Decision, EVAL_TOKEN_BUCKET,
    KeyPrefix, Metrics, RefillRate, SystemClock, TollgateError,
};

/// Process-wide limiter settings.
#[derive(Clone, Debug)]
pub struct LimiterOptions {
    /// Namespace for stored bucket keys.
    pub key_prefix: KeyPrefix,
    /// Capacity used when a call passes `burst <= 0`.
    pub default_burst: BucketCapacity,
    /// Refill rate used when a call passes `rate <= 0`.
    pub default_rate: RefillRate,
}

/// Distributed token-bucket limiter.
///
/// # Semantics
///
/// - A denial is `Ok(Decision { allowed: false, .. })`; errors mean the store could not
///   decide (unreachable, script failure, malformed reply).
/// - Nothing is retried. Callers choose between failing open and failing closed.
/// - [`peek`](Self::peek) consumes nothing but still applies refill and advances the
///   bucket's refill watermark.
///
/// # Examples
///
/// ```no_run
/// # async fn run() -> Result<(), tollgate::TollgateError> {
/// use std::sync::Arc;
/// use tollgate::{
///     BucketCapacity, KeyPrefix, LimiterOptions, MemoryBucketStore, Metrics, RefillRate,
///     TokenBucketLimiter,
/// };
///
/// let limiter = TokenBucketLimiter::new(
///     MemoryBucketStore::new(),
///     LimiterOptions {
///         key_prefix: KeyPrefix::default(),
///         default_burst: BucketCapacity::try_from(5).unwrap(),
///         default_rate: RefillRate::try_from(1.0).unwrap(),
///     },
///     Arc::new(Metrics::new()?),
/// );
///
/// let decision = limiter.allow("user:123", 1, 0, 0.0).await?;
/// assert!(decision.allowed);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TokenBucketLimiter<S> {
    store: S,
    key_prefix: KeyPrefix,
    default_burst: BucketCapacity,
    default_rate: RefillRate,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl<S: BucketStore> TokenBucketLimiter<S> {
    /// Create a limiter that reads the system clock.
    pub fn new(store: S, options: LimiterOptions, metrics: Arc<Metrics>) -> Self {
        Self::with_clock(store, options, metrics, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(
        store: S,
        options: LimiterOptions,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key_prefix: options.key_prefix,
            default_burst: options.default_burst,
            default_rate: options.default_rate,
            clock,
            metrics,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Try to consume `requested` tokens from `key`'s bucket.
    ///
    /// `requested <= 0` is treated as 1. `burst <= 0` and `rate <= 0` (or a non-finite
    /// rate) select the process defaults.
    pub async fn allow(
        &self,
        key: &str,
        requested: i64,
        burst: i64,
        rate: f64,
    ) -> Result<Decision, TollgateError> {
        let requested = if requested <= 0 { 1 } else { requested as u64 };
        self.eval(key, requested, burst, rate).await
    }

    /// Observe `key`'s bucket without consuming tokens.
    pub async fn peek(&self, key: &str, burst: i64, rate: f64) -> Result<Decision, TollgateError> {
        self.eval(key, 0, burst, rate).await
    }

    /// Check that the store is reachable.
    pub async fn ping(&self) -> Result<(), TollgateError> {
        self.store.ping().await
    }

    fn resolve(&self, burst: i64, rate: f64) -> (u64, f64) {
        let capacity = if burst <= 0 {
            *self.default_burst
        } else {
            burst as u64
        };
        let rate = match RefillRate::try_from(rate) {
            Ok(rate) => *rate,
            Err(_) => *self.default_rate,
        };

        (capacity, rate)
    }

    async fn eval(
        &self,
        key: &str,
        requested: u64,
        burst: i64,
        rate: f64,
    ) -> Result<Decision, TollgateError> {
        let (capacity, rate) = self.resolve(burst, rate);
        let store_key = self.key_prefix.namespaced(key);
        let args = BucketScriptArgs {
            capacity,
            rate,
            now: self.clock.now_seconds(),
            requested,
        };

        let call = StoreCall::start(&self.metrics, &store_key);
        let result = self.store.eval_token_bucket(&store_key, &args).await;
        call.settle();

        let decision = result.and_then(Decision::try_from);
        if let Err(err) = &decision {
            self.metrics.inc_store_errors();
            tracing::error!(error = %err, key = %store_key, "token bucket evaluation failed");
        }

        decision
    }
}

/// One in-flight store round trip.
///
/// Latency is observed however the call ends. A call dropped before the store replied
/// (caller deadline, client gone) also counts as a store error.
struct StoreCall<'a> {
    metrics: &'a Metrics,
    key: &'a str,
    timer: Option<HistogramTimer>,
}

impl<'a> StoreCall<'a> {
    fn start(metrics: &'a Metrics, key: &'a str) -> Self {
        Self {
            metrics,
            key,
            timer: Some(metrics.store_timer(EVAL_TOKEN_BUCKET)),
        }
    }

    fn settle(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.observe_duration();
        }
    }
}

impl Drop for StoreCall<'_> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.observe_duration();
            self.metrics.inc_store_errors();
            tracing::warn!(
                key = %self.key,
                "token bucket evaluation abandoned before the store replied"
            );
        }
    }
}

impl TryFrom<Value> for Decision {
    type Error = TollgateError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(TollgateError::MalformedReply(format!(
                    "expected an array, got {other:?}"
                )));
            }
        };

        let [allowed, remaining, limit, reset_at, retry_after] =
            <[Value; 5]>::try_from(items).map_err(|items| {
                TollgateError::MalformedReply(format!(
                    "expected 5 elements, got {}",
                    items.len()
                ))
            })?;

        Ok(Decision {
            allowed: int_field("allowed", &allowed)? == 1,
            remaining: int_field("remaining", &remaining)?,
            limit: int_field("limit", &limit)?,
            reset_at: int_field("reset_at", &reset_at)?,
            retry_after: float_field("retry_after", &retry_after)?,
        })
    }
}

fn int_field(name: &str, value: &Value) -> Result<i64, TollgateError> {
    let parsed = match value {
        Value::Int(n) => Some(*n),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok()),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| {
        TollgateError::MalformedReply(format!("{name} is not an integer: {value:?}"))
    })
}

fn float_field(name: &str, value: &Value) -> Result<f64, TollgateError> {
    let parsed = match value {
        Value::Int(n) => Some(*n as f64),
        Value::Double(d) => Some(*d),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok()),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    };

    parsed.filter(|f: &f64| f.is_finite()).ok_or_else(|| {
        TollgateError::MalformedReply(format!("{name} is not a number: {value:?}"))
    })
}
