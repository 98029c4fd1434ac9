//! Bucket state storage.
//!
//! Every admission decision is one atomic token-bucket step executed by a store:
//!
//! - [`RedisBucketStore`]: runs [`TOKEN_BUCKET_SCRIPT`] inside Redis, atomic across
//!   every replica that talks to the same Redis.
//! - [`MemoryBucketStore`]: runs the same step against a concurrent map under the
//!   per-key entry lock, atomic within one process.
//!
//! Both reply with the same five-element array, so the limiter parses one shape.

use std::future::Future;

use redis::Value;

use crate::TollgateError;

mod script;
pub use script::*;

mod redis_bucket_store;
pub use redis_bucket_store::*;

mod memory_bucket_store;
pub use memory_bucket_store::*;

/// Store command name used for latency labels.
pub const EVAL_TOKEN_BUCKET: &str = "eval_token_bucket";

/// A store that can execute the atomic token-bucket step.
pub trait BucketStore: Send + Sync {
    /// Refill then consume `args.requested` tokens from `key` in one indivisible step.
    ///
    /// Replies with `[allowed, remaining, limit, reset_at, retry_after]`.
    fn eval_token_bucket(
        &self,
        key: &str,
        args: &BucketScriptArgs,
    ) -> impl Future<Output = Result<Value, TollgateError>> + Send;

    /// Liveness probe.
    fn ping(&self) -> impl Future<Output = Result<(), TollgateError>> + Send;
}
