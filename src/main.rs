use std::{sync::Arc, time::Duration};

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tollgate::{
    AdmissionService, BucketStore, Clock, Config, MemoryBucketStore, Metrics, RedisBucketStore,
    StoreBackend, SystemClock, TokenBucketLimiter, http,
};

const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tollgate=info".parse()?),
        )
        .init();

    let config = Config::parse();
    let limiter_options = config.limiter_options()?;
    let metrics = Arc::new(Metrics::new()?);

    match config.store {
        StoreBackend::Redis => {
            let store = RedisBucketStore::connect(&config.redis_url, config.redis_options()).await?;
            store.ping().await?;
            tracing::info!(redis_url = %config.redis_url, pool_size = config.redis_pool_size, "connected to redis");

            let limiter = Arc::new(TokenBucketLimiter::new(store, limiter_options, metrics.clone()));
            serve(&config, limiter, metrics).await
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-process store; limits are not shared between replicas");

            let limiter = Arc::new(TokenBucketLimiter::new(
                MemoryBucketStore::new(),
                limiter_options,
                metrics.clone(),
            ));
            spawn_purge_loop(Arc::clone(&limiter));
            serve(&config, limiter, metrics).await
        }
    }
}

async fn serve<S>(
    config: &Config,
    limiter: Arc<TokenBucketLimiter<S>>,
    metrics: Arc<Metrics>,
) -> Result<(), Box<dyn std::error::Error>>
where
    S: BucketStore + 'static,
{
    let service = Arc::new(AdmissionService::new(limiter, metrics));
    let app = http::router(service, &config.http_options());

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

fn spawn_purge_loop(limiter: Arc<TokenBucketLimiter<MemoryBucketStore>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MEMORY_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let removed = limiter.store().purge_expired(SystemClock.now_seconds());
            if removed > 0 {
                tracing::debug!(removed, "purged expired buckets");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("received shutdown signal");
}
