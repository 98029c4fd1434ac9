use dashmap::{DashMap, mapref::entry::Entry};
use redis::Value;

use crate::{BucketScriptArgs, BucketState, BucketStore, TollgateError, apply_step};

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: f64,
}

/// In-process bucket store.
///
/// Runs [`apply_step`] while holding the [`DashMap`] entry lock for the key, which gives
/// the same per-key atomicity the Redis script has, but only within this process.
/// Expiry is judged against the caller-supplied `now`, mirroring the Redis TTL.
///
/// # When to Use
///
/// - Single-replica deployments
/// - Tests and benchmarks that should not depend on a running Redis
///
/// State is not shared across processes and does not survive restarts.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, StoredBucket>,
}

impl MemoryBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored buckets, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// `true` if no bucket is stored.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket whose expiry is at or before `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: f64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
        before.saturating_sub(self.buckets.len())
    }

    /// Stored state for a namespaced key, ignoring expiry.
    pub fn snapshot(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|bucket| bucket.state)
    }

    fn step(&self, key: &str, args: &BucketScriptArgs) -> Value {
        let expires_at = args.now + args.ttl_seconds() as f64;

        let reply = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get();
                let current = (stored.expires_at > args.now).then_some(stored.state);
                let (state, reply) = apply_step(current, args);
                occupied.insert(StoredBucket { state, expires_at });
                reply
            }
            Entry::Vacant(vacant) => {
                let (state, reply) = apply_step(None, args);
                vacant.insert(StoredBucket { state, expires_at });
                reply
            }
        };

        reply.to_value()
    }
}

impl BucketStore for MemoryBucketStore {
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: &BucketScriptArgs,
    ) -> Result<Value, TollgateError> {
        Ok(self.step(key, args))
    }

    async fn ping(&self) -> Result<(), TollgateError> {
        Ok(())
    }
}
