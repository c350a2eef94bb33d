//! nearcache - Near Cache Workload Driver
//!
//! Runs a concurrent read/write workload against a near cache in front of
//! the in-memory back store, while an external writer mutates the back
//! store and the near tier is truncated periodically.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Workload Driver                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workers    │───▶│  Coherence   │───▶│   Back Store │       │
//! │  │ (N threads)  │    │    Engine    │◀───│   (events)   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │         ▲                   ▲                   ▲               │
//! │     truncate timer     statistics         external writer       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nearcache::adapters::{InMemoryBackStore, LocalFrontStore, StatisticsExporter};
use nearcache::{
    BackStore, ClientId, CoherenceEngine, EngineConfig, InvalidationStrategy, StatisticsSnapshot,
};

type Engine = CoherenceEngine<u64, Bytes>;
type Back = InMemoryBackStore<u64, Bytes>;

// =============================================================================
// CLI Arguments
// =============================================================================

/// nearcache - exercise a near cache under concurrent load
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Invalidation strategy (none, present, logical, all)
    #[arg(long, env = "NEARCACHE_STRATEGY", value_parser = parse_strategy)]
    strategy: Option<InvalidationStrategy>,

    /// Worker threads
    #[arg(long, env = "NEARCACHE_THREADS", default_value = "8")]
    threads: usize,

    /// Distinct keys in the workload
    #[arg(long, env = "NEARCACHE_KEYS", default_value = "4096")]
    keys: u64,

    /// Operations per worker
    #[arg(long, env = "NEARCACHE_OPS", default_value = "20000")]
    ops_per_thread: usize,

    /// Fraction of operations that write (0.0 - 1.0)
    #[arg(long, env = "NEARCACHE_WRITE_RATIO", default_value = "0.1")]
    write_ratio: f64,

    /// Front store capacity in entries
    #[arg(long, env = "NEARCACHE_FRONT_CAPACITY", default_value = "1024")]
    front_capacity: usize,

    /// Key lock wait in milliseconds (negative waits forever)
    #[arg(long, env = "NEARCACHE_LOCK_TIMEOUT_MS", allow_negative_numbers = true)]
    lock_timeout_ms: Option<i64>,

    /// YAML engine configuration
    #[arg(long, env = "NEARCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Truncate the near tier every N milliseconds
    #[arg(long, env = "NEARCACHE_TRUNCATE_EVERY_MS")]
    truncate_every: Option<u64>,

    /// Updates applied to the back store by an external writer
    #[arg(long, env = "NEARCACHE_EXTERNAL_UPDATES", default_value = "2000")]
    external_updates: usize,

    /// Simulated back-store read latency in microseconds
    #[arg(long, env = "NEARCACHE_BACK_LATENCY_US", default_value = "50")]
    back_latency_us: u64,

    /// Deliver back-store events from a dispatcher thread
    #[arg(long, env = "NEARCACHE_DISPATCH_ASYNC")]
    dispatch_async: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting nearcache workload");
    info!("  Strategy: {}", config.strategy);
    info!("  Workers: {} x {} ops", args.threads, args.ops_per_thread);
    info!("  Keys: {}, front capacity: {}", args.keys, args.front_capacity);
    info!("  Lock timeout: {}ms", config.lock_timeout_ms);
    info!("  Async dispatch: {}", args.dispatch_async);

    let front = Arc::new(LocalFrontStore::<u64, Bytes>::new(args.front_capacity));
    let back = if args.dispatch_async {
        Back::with_async_dispatch().context("starting event dispatcher")?
    } else {
        Back::new()
    };
    let back = Arc::new(back.with_latency(Duration::from_micros(args.back_latency_us)));
    seed(&back, args.keys)?;

    let engine = Arc::new(Engine::new(config, front, back.clone())?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let truncator = args
        .truncate_every
        .map(|every| tokio::spawn(run_truncator(engine.clone(), every, stop_rx.clone())));

    let started = Instant::now();
    let workers: Vec<_> = (0..args.threads)
        .map(|worker| {
            let engine = engine.clone();
            let plan = WorkPlan::from_args(&args, worker as u64);
            tokio::task::spawn_blocking(move || run_worker(&engine, plan))
        })
        .collect();

    let writer = {
        let back = back.clone();
        let updates = args.external_updates;
        let keys = args.keys;
        tokio::task::spawn_blocking(move || run_external_writer(&back, keys, updates))
    };

    let mut totals = WorkerReport::default();
    for result in join_all(workers).await {
        totals.merge(result??);
    }
    writer.await??;
    back.flush_events();

    let _ = stop_tx.send(true);
    if let Some(truncator) = truncator {
        let truncations = truncator.await??;
        info!(truncations, "Truncator stopped");
    }

    let elapsed = started.elapsed();
    let statistics = engine.statistics();
    let front_size = engine.front_len();

    engine.truncate()?;
    if engine.front_len() != 0 || !engine.lock_table().is_empty() {
        bail!(
            "truncate left {} front entries and {} locks",
            engine.front_len(),
            engine.lock_table().len()
        );
    }

    let report = Report {
        strategy: engine.strategy(),
        elapsed_ms: elapsed.as_millis() as u64,
        operations: totals.operations(),
        throughput: totals.operations() as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        workers: totals,
        hit_ratio: statistics.hit_ratio(),
        statistics: statistics.clone(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    let exporter = StatisticsExporter::new("workload")?;
    exporter.update(&statistics, front_size);
    print!("{}", exporter.render()?);

    engine.release();
    info!("Workload complete");
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

fn parse_strategy(s: &str) -> Result<InvalidationStrategy, String> {
    s.parse().map_err(|e: nearcache::Error| e.to_string())
}

/// Engine options: YAML file first, then command-line overrides.
fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(timeout) = args.lock_timeout_ms {
        config.lock_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn seed(back: &Back, keys: u64) -> nearcache::Result<()> {
    let loader = ClientId::new();
    let entries = (0..keys).map(|key| (key, value_for(key, 0))).collect();
    back.put_all(entries, loader)
}

fn value_for(key: u64, version: u64) -> Bytes {
    Bytes::from(format!("value-{}-{}", key, version))
}

// =============================================================================
// Workload
// =============================================================================

struct WorkPlan {
    worker: u64,
    keys: u64,
    operations: usize,
    write_ratio: f64,
}

impl WorkPlan {
    fn from_args(args: &Args, worker: u64) -> Self {
        Self {
            worker,
            keys: args.keys.max(1),
            operations: args.ops_per_thread,
            write_ratio: args.write_ratio.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
struct WorkerReport {
    reads: u64,
    batch_reads: u64,
    writes: u64,
    removes: u64,
    retryable_errors: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.reads += other.reads;
        self.batch_reads += other.batch_reads;
        self.writes += other.writes;
        self.removes += other.removes;
        self.retryable_errors += other.retryable_errors;
    }

    fn operations(&self) -> u64 {
        self.reads + self.batch_reads + self.writes + self.removes
    }
}

fn run_worker(engine: &Engine, plan: WorkPlan) -> nearcache::Result<WorkerReport> {
    let mut rng = SmallRng::seed_from_u64(plan.worker + 1);
    let mut report = WorkerReport::default();

    for op in 0..plan.operations {
        let key = rng.random_range(0..plan.keys);
        let roll: f64 = rng.random();

        let outcome = if roll < plan.write_ratio * 0.9 {
            report.writes += 1;
            engine
                .put(key, value_for(key, op as u64), None)
                .map(|_| ())
        } else if roll < plan.write_ratio {
            report.removes += 1;
            engine.remove(&key).map(|_| ())
        } else if roll < plan.write_ratio + 0.05 {
            report.batch_reads += 1;
            let batch: Vec<u64> = (0..8).map(|i| (key + i) % plan.keys).collect();
            engine.get_all(&batch).map(|_| ())
        } else {
            report.reads += 1;
            engine.get(&key).map(|_| ())
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                debug!(worker = plan.worker, key, "Retryable failure: {}", e);
                report.retryable_errors += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

/// Mutate the back store the way another process would.
fn run_external_writer(back: &Back, keys: u64, updates: usize) -> nearcache::Result<()> {
    let mut rng = SmallRng::seed_from_u64(0xE7);
    let other = ClientId::new();

    for version in 0..updates as u64 {
        let key = rng.random_range(0..keys.max(1));
        match version % 3 {
            0 => back.apply_synthetic_update(key, value_for(key, version)),
            1 => {
                back.put(key, value_for(key, version), None, other)?;
            }
            _ => {
                back.evict(&key);
            }
        }
    }
    Ok(())
}

async fn run_truncator(
    engine: Arc<Engine>,
    every_ms: u64,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<u64> {
    let mut interval = tokio::time::interval(Duration::from_millis(every_ms.max(1)));
    interval.tick().await;
    let mut truncations = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let engine = engine.clone();
                match tokio::task::spawn_blocking(move || engine.truncate()).await? {
                    Ok(()) => truncations += 1,
                    Err(e) => warn!("Truncate failed: {}", e),
                }
            }
            _ = stop.changed() => return Ok(truncations),
        }
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Serialize)]
struct Report {
    strategy: InvalidationStrategy,
    elapsed_ms: u64,
    operations: u64,
    throughput: f64,
    hit_ratio: f64,
    workers: WorkerReport,
    statistics: StatisticsSnapshot,
}
