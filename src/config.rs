//! Server configuration.
//!
//! Every flag can also be set through the environment variable named next to it.
//! The library itself never reads the environment; the binary turns a [`Config`]
//! into constructor arguments.

use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{
    BucketCapacity, HttpOptions, KeyPrefix, LimiterOptions, RedisStoreOptions, RefillRate,
    TollgateError,
};

/// Where bucket state lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Shared Redis; required when more than one replica runs.
    Redis,
    /// In-process map; single replica only.
    Memory,
}

/// Command-line / environment configuration for `tollgate-server`.
#[derive(Parser, Clone, Debug)]
#[command(
    name = "tollgate-server",
    about = "Distributed token-bucket rate limiting service"
)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:50051")]
    pub listen_addr: SocketAddr,

    /// Bucket store backend
    #[arg(long, env = "STORE_BACKEND", value_enum, default_value_t = StoreBackend::Redis)]
    pub store: StoreBackend,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    pub redis_url: String,

    /// Number of pooled Redis connections
    #[arg(long, env = "REDIS_POOL_SIZE", default_value_t = 4)]
    pub redis_pool_size: usize,

    /// Redis connect timeout in milliseconds
    #[arg(long, env = "REDIS_DIAL_TIMEOUT_MS", default_value_t = 500)]
    pub redis_connect_timeout_ms: u64,

    /// Redis reply timeout in milliseconds
    #[arg(long, env = "REDIS_READ_TIMEOUT_MS", default_value_t = 200)]
    pub redis_response_timeout_ms: u64,

    /// Namespace for stored bucket keys (no colons)
    #[arg(long, env = "KEY_PREFIX", default_value = "rl")]
    pub key_prefix: String,

    /// Default bucket capacity when a request passes burst <= 0
    #[arg(long, env = "DEFAULT_BURST", default_value_t = 100)]
    pub default_burst: u64,

    /// Default refill rate (tokens/s) when a request passes rate <= 0
    #[arg(long, env = "DEFAULT_RATE", default_value_t = 10.0)]
    pub default_rate: f64,

    /// Maximum request body size in bytes
    #[arg(long, env = "MAX_RECV_MSG_SIZE", default_value_t = 4 * 1024 * 1024)]
    pub max_request_bytes: usize,

    /// Maximum number of concurrently handled requests
    #[arg(long, env = "MAX_CONCURRENT_STREAMS", default_value_t = 1000)]
    pub max_concurrent_requests: usize,

    /// Per-request deadline in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 1000)]
    pub request_timeout_ms: u64,
}

/// A configuration value failed validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `--default-burst` is invalid.
    #[error("invalid default burst: {0}")]
    DefaultBurst(&'static str),
    /// `--default-rate` is invalid.
    #[error("invalid default rate: {0}")]
    DefaultRate(&'static str),
    /// `--key-prefix` is invalid.
    #[error(transparent)]
    KeyPrefix(#[from] TollgateError),
}

impl Config {
    /// Limiter settings.
    pub fn limiter_options(&self) -> Result<LimiterOptions, ConfigError> {
        Ok(LimiterOptions {
            key_prefix: KeyPrefix::try_from(self.key_prefix.clone())?,
            default_burst: BucketCapacity::try_from(self.default_burst)
                .map_err(ConfigError::DefaultBurst)?,
            default_rate: RefillRate::try_from(self.default_rate)
                .map_err(ConfigError::DefaultRate)?,
        })
    }

    /// Redis pool settings.
    pub fn redis_options(&self) -> RedisStoreOptions {
        RedisStoreOptions {
            pool_size: self.redis_pool_size,
            connection_timeout: Duration::from_millis(self.redis_connect_timeout_ms),
            response_timeout: Duration::from_millis(self.redis_response_timeout_ms),
        }
    }

    /// Transport limits.
    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            max_request_bytes: self.max_request_bytes,
            max_concurrent_requests: self.max_concurrent_requests,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}
