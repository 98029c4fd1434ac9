use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use tokio::sync::{Mutex, mpsc};

use tollgate::{
    BucketCapacity, BucketStore, KeyPrefix, LimiterOptions, MemoryBucketStore, Metrics,
    RedisBucketStore, RedisStoreOptions, RefillRate, TokenBucketLimiter,
};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Store {
    Memory,
    Redis,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyDist {
    Hot,
    Uniform,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Mode {
    Max,
    TargetQps,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tollgate-stress",
    about = "Load test / benchmark harness for tollgate"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Store::Memory)]
    store: Store,

    #[arg(long, value_enum, default_value_t = Mode::Max)]
    mode: Mode,

    #[arg(long, value_enum, default_value_t = KeyDist::Hot)]
    key_dist: KeyDist,

    #[arg(long, default_value_t = 8)]
    workers: usize,

    #[arg(long, default_value_t = 30)]
    duration_s: u64,

    #[arg(long, default_value_t = 10_000)]
    key_space: usize,

    #[arg(long, default_value_t = 100)]
    burst: u64,

    #[arg(long, default_value_t = 10.0)]
    rate: f64,

    /// Only used when `--mode target-qps`.
    #[arg(long, default_value_t = 10_000)]
    target_qps: u64,

    #[arg(long, default_value_t = 100)]
    sample_every: u64,

    #[arg(long, default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    #[arg(long, default_value = "stress")]
    redis_prefix: String,

    #[arg(long, default_value_t = 4)]
    redis_pool_size: usize,
}

#[derive(Default)]
struct Counts {
    allowed: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
}

fn build_keys(args: &Args) -> Arc<Vec<String>> {
    let n = match args.key_dist {
        KeyDist::Hot => 1,
        KeyDist::Uniform => args.key_space.max(1),
    };
    Arc::new((0..n).map(|i| format!("user:{i}")).collect())
}

fn should_sample(iter: u64, sample_every: u64) -> bool {
    if sample_every <= 1 {
        return true;
    }

    iter.is_multiple_of(sample_every)
}

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap()
}

fn xorshift(seed: &mut u64) -> u64 {
    *seed ^= *seed >> 12;
    *seed ^= *seed << 25;
    *seed ^= *seed >> 27;
    *seed = seed.wrapping_mul(0x2545_F491_4F6C_DD1D);
    *seed
}

fn print_results(args: &Args, elapsed: Duration, hist: &Histogram<u64>, counts: &Counts) {
    let allowed = counts.allowed.load(Ordering::Relaxed);
    let denied = counts.denied.load(Ordering::Relaxed);
    let errors = counts.errors.load(Ordering::Relaxed);
    let ops = allowed + denied + errors;

    println!("store={:?} mode={:?}", args.store, args.mode);
    println!(
        "workers={} duration_s={} burst={} rate={} key_dist={:?} key_space={}",
        args.workers, args.duration_s, args.burst, args.rate, args.key_dist, args.key_space
    );
    println!(
        "elapsed_s={:.3} ops={} ops_per_s={:.0}",
        elapsed.as_secs_f64(),
        ops,
        ops as f64 / elapsed.as_secs_f64()
    );
    println!("allowed={allowed} denied={denied} errors={errors}");
    if !hist.is_empty() {
        println!(
            "lat_us p50={} p95={} p99={} p999={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max()
        );
        println!("sample_every={} samples={}", args.sample_every, hist.len());
    } else {
        println!("no latency samples collected");
    }
}

async fn call<S: BucketStore>(
    limiter: &TokenBucketLimiter<S>,
    key: &str,
    iter: u64,
    args: &Args,
    hist: &mut Histogram<u64>,
    counts: &Counts,
) {
    let t0 = should_sample(iter, args.sample_every).then(Instant::now);

    let res = limiter.allow(key, 1, 0, 0.0).await;

    if let Some(t0) = t0 {
        let us = t0.elapsed().as_micros() as u64;
        let _ = hist.record(us.max(1));
    }

    match res {
        Ok(d) if d.allowed => counts.allowed.fetch_add(1, Ordering::Relaxed),
        Ok(_) => counts.denied.fetch_add(1, Ordering::Relaxed),
        Err(_) => counts.errors.fetch_add(1, Ordering::Relaxed),
    };
}

async fn run_max<S: BucketStore + 'static>(
    args: &Args,
    limiter: Arc<TokenBucketLimiter<S>>,
    counts: Arc<Counts>,
) -> Histogram<u64> {
    let keys = build_keys(args);
    let stop = Arc::new(AtomicBool::new(false));

    let mut join = Vec::with_capacity(args.workers);
    for w in 0..args.workers {
        let limiter = Arc::clone(&limiter);
        let keys = Arc::clone(&keys);
        let stop = Arc::clone(&stop);
        let counts = Arc::clone(&counts);
        let args = args.clone();

        join.push(tokio::spawn(async move {
            let mut hist = new_histogram();
            let mut seed = (w as u64 + 1) * 0x9E37_79B9_7F4A_7C15;
            let mut i = 0_u64;

            while !stop.load(Ordering::Relaxed) {
                i = i.wrapping_add(1);
                let key = &keys[(xorshift(&mut seed) as usize) % keys.len()];
                call(&limiter, key, i, &args, &mut hist, &counts).await;
            }

            hist
        }));
    }

    tokio::time::sleep(Duration::from_secs(args.duration_s)).await;
    stop.store(true, Ordering::Relaxed);

    let mut merged = new_histogram();
    for j in join {
        merged.add(&j.await.unwrap()).unwrap();
    }
    merged
}

async fn run_target_qps<S: BucketStore + 'static>(
    args: &Args,
    limiter: Arc<TokenBucketLimiter<S>>,
    counts: Arc<Counts>,
) -> Histogram<u64> {
    let keys = build_keys(args);
    let (tx, rx) = mpsc::channel::<usize>(args.workers.max(1) * 64);
    let rx = Arc::new(Mutex::new(rx));

    let mut join = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let limiter = Arc::clone(&limiter);
        let keys = Arc::clone(&keys);
        let rx = Arc::clone(&rx);
        let counts = Arc::clone(&counts);
        let args = args.clone();

        join.push(tokio::spawn(async move {
            let mut hist = new_histogram();
            let mut i = 0_u64;

            loop {
                let next = rx.lock().await.recv().await;
                let Some(idx) = next else {
                    break;
                };
                i = i.wrapping_add(1);
                call(&limiter, &keys[idx], i, &args, &mut hist, &counts).await;
            }

            hist
        }));
    }

    let per_op = Duration::from_nanos(1_000_000_000u64 / args.target_qps.max(1));
    let deadline = Instant::now() + Duration::from_secs(args.duration_s);
    let mut ticker = tokio::time::interval(per_op);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
    let mut seed = 0xD134_2543_DE82_EF95_u64;

    while Instant::now() < deadline {
        ticker.tick().await;
        let idx = (xorshift(&mut seed) as usize) % keys.len();
        if tx.send(idx).await.is_err() {
            break;
        }
    }
    drop(tx);

    let mut merged = new_histogram();
    for j in join {
        merged.add(&j.await.unwrap()).unwrap();
    }
    merged
}

async fn run<S: BucketStore + 'static>(args: Args, store: S) {
    let limiter = Arc::new(TokenBucketLimiter::new(
        store,
        LimiterOptions {
            key_prefix: KeyPrefix::try_from(args.redis_prefix.clone()).unwrap(),
            default_burst: BucketCapacity::try_from(args.burst).unwrap(),
            default_rate: RefillRate::try_from(args.rate).unwrap(),
        },
        Arc::new(Metrics::new().unwrap()),
    ));
    let counts = Arc::new(Counts::default());

    let started = Instant::now();
    let hist = match args.mode {
        Mode::Max => run_max(&args, limiter, Arc::clone(&counts)).await,
        Mode::TargetQps => run_target_qps(&args, limiter, Arc::clone(&counts)).await,
    };

    print_results(&args, started.elapsed(), &hist, &counts);
}

fn main() {
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.workers.max(2))
        .build()
        .unwrap();

    let store = args.store;
    rt.block_on(async move {
        match store {
            Store::Memory => run(args, MemoryBucketStore::new()).await,
            Store::Redis => {
                let options = RedisStoreOptions {
                    pool_size: args.redis_pool_size,
                    ..RedisStoreOptions::default()
                };
                let store = RedisBucketStore::connect(&args.redis_url, options)
                    .await
                    .unwrap();
                run(args, store).await;
            }
        }
    });
}
