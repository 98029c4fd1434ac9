use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use redis::Value;

use crate::{
    BucketCapacity, BucketScriptArgs, BucketStore, KeyPrefix, LimiterOptions, ManualClock,
    MemoryBucketStore, Metrics, RefillRate, TokenBucketLimiter, TollgateError,
};

pub(super) const T0: f64 = 1_700_000_000.0;

pub(super) fn options(burst: u64, rate: f64) -> LimiterOptions {
    LimiterOptions {
        key_prefix: KeyPrefix::default(),
        default_burst: BucketCapacity::try_from(burst).unwrap(),
        default_rate: RefillRate::try_from(rate).unwrap(),
    }
}

pub(super) struct Harness<S> {
    pub limiter: Arc<TokenBucketLimiter<S>>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<Metrics>,
}

impl<S: BucketStore> Harness<S> {
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

pub(super) fn harness_with<S: BucketStore>(store: S, burst: u64, rate: f64) -> Harness<S> {
    let clock = Arc::new(ManualClock::new(T0));
    let metrics = Arc::new(Metrics::new().unwrap());
    let limiter = Arc::new(TokenBucketLimiter::with_clock(
        store,
        options(burst, rate),
        metrics.clone(),
        clock.clone(),
    ));

    Harness {
        limiter,
        clock,
        metrics,
    }
}

pub(super) fn harness(burst: u64, rate: f64) -> Harness<MemoryBucketStore> {
    harness_with(MemoryBucketStore::new(), burst, rate)
}

/// Wraps a [`MemoryBucketStore`] and counts round trips.
#[derive(Debug, Default)]
pub(super) struct CountingStore {
    pub inner: MemoryBucketStore,
    pub evals: AtomicUsize,
    pub pings: AtomicUsize,
}

impl CountingStore {
    pub fn evals(&self) -> usize {
        self.evals.load(Ordering::SeqCst)
    }
}

impl BucketStore for CountingStore {
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: &BucketScriptArgs,
    ) -> Result<Value, TollgateError> {
        self.evals.fetch_add(1, Ordering::SeqCst);
        self.inner.eval_token_bucket(key, args).await
    }

    async fn ping(&self) -> Result<(), TollgateError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.inner.ping().await
    }
}

/// Replies with whatever it is told to and records the arguments it saw.
#[derive(Debug)]
pub(super) struct ScriptedStore {
    reply: Result<Value, String>,
    pub calls: Mutex<Vec<(String, BucketScriptArgs)>>,
    ping_error: Option<String>,
}

impl ScriptedStore {
    pub fn replying(reply: Value) -> Self {
        Self {
            reply: Ok(reply),
            calls: Mutex::new(Vec::new()),
            ping_error: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            calls: Mutex::new(Vec::new()),
            ping_error: Some(message.to_string()),
        }
    }

    pub fn last_call(&self) -> (String, BucketScriptArgs) {
        self.calls.lock().unwrap().last().cloned().unwrap()
    }
}

fn io_error(message: &str) -> TollgateError {
    TollgateError::RedisError(redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        message.to_string(),
    )))
}

impl BucketStore for ScriptedStore {
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: &BucketScriptArgs,
    ) -> Result<Value, TollgateError> {
        self.calls.lock().unwrap().push((key.to_string(), *args));

        match &self.reply {
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(io_error(message)),
        }
    }

    async fn ping(&self) -> Result<(), TollgateError> {
        match &self.ping_error {
            Some(message) => Err(io_error(message)),
            None => Ok(()),
        }
    }
}

/// Answers only after `delay`, long enough for callers to give up first.
#[derive(Debug)]
pub(super) struct StalledStore {
    delay: Duration,
}

impl StalledStore {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BucketStore for StalledStore {
    async fn eval_token_bucket(
        &self,
        _key: &str,
        _args: &BucketScriptArgs,
    ) -> Result<Value, TollgateError> {
        tokio::time::sleep(self.delay).await;
        Ok(Value::Nil)
    }

    async fn ping(&self) -> Result<(), TollgateError> {
        Ok(())
    }
}

pub(super) fn reply(allowed: i64, remaining: i64, limit: i64, reset_at: i64, retry_after: &str) -> Value {
    Value::Array(vec![
        Value::Int(allowed),
        Value::Int(remaining),
        Value::Int(limit),
        Value::Int(reset_at),
        Value::BulkString(retry_after.as_bytes().to_vec()),
    ])
}
