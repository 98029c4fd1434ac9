use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use redis::{
    Client, Script, Value,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::{BucketScriptArgs, BucketStore, TOKEN_BUCKET_SCRIPT, TollgateError};

/// A round-robin pool of [`redis::aio::ConnectionManager`]s.
///
/// Each manager multiplexes requests over one connection and reconnects on its own,
/// so the pool needs no locking.
pub struct RedisConnectionPool {
    connection_managers: Arc<Vec<ConnectionManager>>,
    track_index: AtomicUsize,
}

impl RedisConnectionPool {
    /// Open `options.pool_size` managed connections from `client`.
    pub async fn from_client(
        client: Client,
        options: &RedisStoreOptions,
    ) -> Result<Self, TollgateError> {
        let connection_count = options.pool_size;
        if connection_count == 0 {
            return Err(TollgateError::InvalidConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connection_managers = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            let config = ConnectionManagerConfig::new()
                .set_connection_timeout(options.connection_timeout)
                .set_response_timeout(options.response_timeout);
            connection_managers.push(client.get_connection_manager_with_config(config).await?);
        }

        Ok(Self {
            connection_managers: Arc::new(connection_managers),
            track_index: AtomicUsize::new(0),
        })
    }

    /// Number of managed connections.
    pub fn len(&self) -> usize {
        self.connection_managers.len()
    }

    /// Always `false`; a pool holds at least one connection.
    pub fn is_empty(&self) -> bool {
        self.connection_managers.is_empty()
    }

    pub(crate) fn get(&self) -> ConnectionManager {
        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        self.connection_managers[index % self.connection_managers.len()].clone()
    }
}

impl Clone for RedisConnectionPool {
    fn clone(&self) -> Self {
        Self {
            connection_managers: self.connection_managers.clone(),
            track_index: AtomicUsize::new(0),
        }
    }
}

impl fmt::Debug for RedisConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnectionPool")
            .field("connections", &self.connection_managers.len())
            .finish_non_exhaustive()
    }
}

/// Connection settings for [`RedisBucketStore::connect`].
#[derive(Clone, Debug)]
pub struct RedisStoreOptions {
    /// Number of managed connections in the pool.
    pub pool_size: usize,
    /// Timeout for establishing a connection.
    pub connection_timeout: Duration,
    /// Timeout for a single command reply.
    pub response_timeout: Duration,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            connection_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_millis(200),
        }
    }
}

/// Bucket store backed by Redis.
///
/// Each step is one `EVALSHA` of [`TOKEN_BUCKET_SCRIPT`] (falling back to `EVAL` the
/// first time a server has not cached it), so a step is atomic with respect to every
/// other client of the same Redis.
///
/// # Requirements
///
/// - **Redis version:** >= 4.0 (multi-field `HSET`)
#[derive(Clone, Debug)]
pub struct RedisBucketStore {
    pool: RedisConnectionPool,
    script: Script,
}

impl RedisBucketStore {
    /// Wrap an existing pool.
    pub fn new(pool: RedisConnectionPool) -> Self {
        Self {
            pool,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    /// Open a pool against `url`.
    ///
    /// ```ignore
    /// let store = RedisBucketStore::connect("redis://127.0.0.1:6379/", RedisStoreOptions::default()).await?;
    /// ```
    pub async fn connect(url: &str, options: RedisStoreOptions) -> Result<Self, TollgateError> {
        let client = Client::open(url)?;
        let pool = RedisConnectionPool::from_client(client, &options).await?;

        Ok(Self::new(pool))
    }
}

impl BucketStore for RedisBucketStore {
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: &BucketScriptArgs,
    ) -> Result<Value, TollgateError> {
        let mut connection_manager = self.pool.get();

        let reply: Value = self
            .script
            .key(key)
            .arg(args.capacity)
            .arg(args.rate)
            .arg(args.now)
            .arg(args.requested)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(reply)
    }

    async fn ping(&self) -> Result<(), TollgateError> {
        let mut connection_manager = self.pool.get();
        let _: String = redis::cmd("PING")
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    }
}
