mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ycsb_db::backends;
use ycsb_db::harness::run_workers;
use ycsb_db::verify::{VerifyConfig, VerifyStats, VerifyWorker};
use ycsb_db::{CallContext, DbConfig, Registry};

use crate::args::Args;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ycsb_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut registry = Registry::new();
    backends::register_builtin(&mut registry);

    if args.list {
        if let Err(e) = list_backends(&registry) {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    let runtime = match configure_runtime(&args) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_bench(&args, &registry)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn configure_runtime(args: &Args) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.worker_threads(args.worker_threads.unwrap_or_else(num_cpus::get).max(1));

    if let Some(stack_size) = args.thread_stack_size {
        builder.thread_stack_size(stack_size);
    }

    if let Some(max_threads) = args.max_blocking_threads {
        builder.max_blocking_threads(max_threads);
    }

    builder
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

fn load_config(args: &Args) -> Result<DbConfig> {
    let mut config = match &args.config {
        Some(path) => DbConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DbConfig::new(),
    };
    for property in &args.properties {
        config.set_property(property)?;
    }
    Ok(config)
}

fn list_backends(registry: &Registry) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    println!("Registered backends:");
    for name in registry.names() {
        // Open each backend in a scratch directory to query its capabilities.
        let scratch = std::env::temp_dir().join(format!("ycsb-db-list-{}", name));
        let config = DbConfig::new()
            .with(format!("{}.dir", name), scratch.to_string_lossy().into_owned())
            .with(format!("{}.drop_data", name), "true");
        match registry.create(name, &config) {
            Ok(db) => {
                println!("  {:<12} {}", name, db.capabilities());
                runtime.block_on(db.close())?;
            }
            Err(e) => println!("  {:<12} (unavailable: {})", name, e),
        }
    }
    Ok(())
}

async fn run_bench(args: &Args, registry: &Registry) -> Result<()> {
    if args.num_clients == 0 {
        bail!("--num-clients must be at least 1");
    }

    let config = load_config(args)?;
    let db = registry
        .create(&args.database, &config)
        .with_context(|| format!("creating {} backend", args.database))?;

    let caps = db.capabilities();
    let path = args.path.resolve(caps);
    if path != args.path {
        tracing::warn!(
            backend = db.name(),
            requested = ?args.path,
            "backend lacks the requested capability, falling back to single-record operations"
        );
    }

    let mut call = CallContext::new();
    if let Some(secs) = args.timeout_secs {
        call = call.with_timeout(Duration::from_secs(secs));
    }

    let ctrl_c = call.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling workers");
            ctrl_c.cancel();
        }
    });

    println!(
        "Running {} with {} concurrent clients ({:?} operations, {} capabilities)...",
        db.name(),
        args.num_clients,
        path,
        caps
    );

    let worker = Arc::new(VerifyWorker::new(VerifyConfig {
        table: args.table.clone(),
        record_count: args.record_count,
        load_pattern: args.load_pattern,
        chunk_size: args.chunk_size,
        path,
    }));

    let start = std::time::Instant::now();
    let reports = run_workers(db.clone(), &call, args.num_clients, worker).await;
    let elapsed = start.elapsed();
    db.close().await.context("closing database")?;
    let reports = reports?;

    let mut total = VerifyStats::default();
    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(stats) => total.merge(stats),
            Err(e) => {
                failed += 1;
                eprintln!("Client {} failed: {:#}", report.thread_id, e);
            }
        }
    }

    println!("\nBenchmark Complete");
    println!("{}", total);
    println!("Elapsed: {:.2?}", elapsed);

    if failed > 0 {
        bail!("{} of {} clients failed", failed, reports.len());
    }
    Ok(())
}
