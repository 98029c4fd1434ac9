use std::{ops::Deref, sync::Arc};

use serde::Serialize;

use crate::TollgateError;

/// Bucket capacity (burst size) in whole tokens.
///
/// Used for the process-wide default; per-call overrides are plain integers where
/// `<= 0` selects this default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketCapacity(u64);

impl Deref for BucketCapacity {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for BucketCapacity {
    type Error = &'static str;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err("Bucket capacity must be greater than 0")
        } else if value > i64::MAX as u64 {
            Err("Bucket capacity must fit in a signed 64-bit integer")
        } else {
            Ok(Self(value))
        }
    }
}

/// Refill rate in tokens per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct RefillRate(f64);

impl Deref for RefillRate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for RefillRate {
    type Error = &'static str;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            Err("Refill rate must be finite")
        } else if value <= 0f64 {
            Err("Refill rate must be greater than 0")
        } else {
            Ok(Self(value))
        }
    }
}

/// A validated namespace prepended to every bucket key before it reaches the store.
///
/// Stored keys look like `<prefix>:<caller key>`. The prefix:
/// - Must not be empty
/// - Must not be longer than 255 bytes
/// - Must not contain colons
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix(Arc<str>);

impl KeyPrefix {
    /// The default prefix, `rl`.
    pub fn default_prefix() -> Self {
        Self(Arc::from("rl"))
    }

    /// Namespace a caller key under this prefix.
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.0, key)
    }
}

impl Default for KeyPrefix {
    fn default() -> Self {
        Self::default_prefix()
    }
}

impl Deref for KeyPrefix {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for KeyPrefix {
    type Error = TollgateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(TollgateError::InvalidKeyPrefix(
                "key prefix must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(TollgateError::InvalidKeyPrefix(
                "key prefix must not be longer than 255 characters".to_string(),
            ))
        } else if value.contains(':') {
            Err(TollgateError::InvalidKeyPrefix(
                "key prefix must not contain colons".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

/// Outcome of one admission check.
///
/// A denial is a successful outcome with `allowed == false`; store failures are
/// reported as errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the requested tokens were consumed.
    pub allowed: bool,
    /// Whole tokens left in the bucket after the decision.
    pub remaining: i64,
    /// The capacity used for the decision.
    pub limit: i64,
    /// Epoch seconds at which the bucket will be full again.
    pub reset_at: i64,
    /// Seconds to wait before the same request would succeed; `0` when allowed.
    pub retry_after: f64,
}

/// Metric label for a caller key: everything before the first `:`, or the whole key.
///
/// `"user:123"` becomes `"user"`, `"ip:10.0.0.1"` becomes `"ip"`.
pub fn key_prefix(key: &str) -> &str {
    match key.find(':') {
        Some(idx) => &key[..idx],
        None => key,
    }
}
