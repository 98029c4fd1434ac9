/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    /// Redis error (connection, timeout or script failure).
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The token bucket script replied with an unexpected shape.
    #[error("unexpected token bucket reply: {0}")]
    MalformedReply(String),

    /// Invalid connection count for the Redis connection pool.
    #[error("invalid redis connection count: {0}")]
    InvalidConnectionCount(String),

    /// Invalid key prefix.
    #[error("invalid key prefix: {0}")]
    InvalidKeyPrefix(String),

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl TollgateError {
    /// Short, stable label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RedisError(_) => "redis",
            Self::MalformedReply(_) => "malformed_reply",
            Self::InvalidConnectionCount(_) => "config",
            Self::InvalidKeyPrefix(_) => "config",
            Self::Metrics(_) => "metrics",
        }
    }
}
