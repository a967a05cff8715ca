//! Super-light Client Node
//!
//! Main entry point for building, serving and verifying ledgers.
//! Ledger servers persist their forest to disk and resume interrupted builds.
//! Verifiers connect to every server and run repeated tournaments.

use anyhow::{bail, Result};
use bisection_game::{LedgerServer, PeerLink, Verifier};
use clap::{Parser, Subcommand};
use ledger_forest::{BuildMetadata, Forest, ForestBuilder, NodeStore, SledStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{NodeConfig, VerifyConfig};

/// Super-light client for hash-chained ledgers
#[derive(Parser, Debug)]
#[command(name = "light-client")]
#[command(about = "Merkle forest ledgers and bisection game verification", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a ledger into a sled database, resuming an interrupted build
    Build {
        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Number of leaves
        #[arg(long)]
        size: u64,

        /// Tree dimension
        #[arg(long)]
        dim: Option<usize>,

        /// Make leaf K differ from the canonical ledger (0 = no divergence)
        #[arg(long, default_value = "0")]
        diff: u64,

        /// Leaves appended between durable commits
        #[arg(long)]
        commit_interval: Option<u64>,
    },

    /// Serve a built ledger to verifiers
    Serve {
        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Bind address
        #[arg(long)]
        addr: Option<String>,
    },

    /// Run tournaments against a set of ledger servers
    Verify {
        /// Tree dimension
        #[arg(long)]
        dim: Option<usize>,

        /// Tournaments per verifier
        #[arg(short = 'n', long)]
        runs: Option<usize>,

        /// Verifiers running side by side
        #[arg(short = 'p', long)]
        parallel: Option<usize>,

        /// Per-round deadline in milliseconds
        #[arg(long)]
        round_timeout_ms: Option<u64>,

        /// Ledger server addresses
        #[arg(required = true, num_args = 2..)]
        servers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Build {
            db,
            size,
            dim,
            diff,
            commit_interval,
        } => {
            if let Some(db) = db {
                config.db = db;
            }
            if let Some(dim) = dim {
                config.build.dim = dim;
            }
            if let Some(interval) = commit_interval {
                config.build.commit_interval = interval;
            }
            run_build(config, size, diff)
        }
        Command::Serve { db, addr } => {
            if let Some(db) = db {
                config.db = db;
            }
            if let Some(addr) = addr {
                config.addr = addr;
            }
            run_serve(config).await
        }
        Command::Verify {
            dim,
            runs,
            parallel,
            round_timeout_ms,
            servers,
        } => {
            if let Some(dim) = dim {
                config.verify.dim = dim;
            }
            if let Some(runs) = runs {
                config.verify.runs = runs;
            }
            if let Some(parallel) = parallel {
                config.verify.parallel = parallel;
            }
            if round_timeout_ms.is_some() {
                config.verify.round_timeout_ms = round_timeout_ms;
            }
            run_verify(config.verify, servers).await
        }
    }
}

/// Data of leaf `index` in the test ledger, with `diff` marking the divergent leaf
fn ledger_leaf(index: u64, diff: u64) -> Vec<u8> {
    let mut data = index.to_le_bytes().to_vec();
    if diff != 0 && index == diff {
        data.extend_from_slice(b"diff");
    }
    data
}

/// Build or extend a ledger on disk
fn run_build(config: NodeConfig, size: u64, diff: u64) -> Result<()> {
    tracing::info!("Building ledger");
    tracing::info!("  Database: {:?}", config.db);
    tracing::info!("  Leaves: {}", size);
    tracing::info!("  Dimension: {}", config.build.dim);
    tracing::info!("  Commit interval: {} leaves", config.build.commit_interval);
    if diff != 0 {
        tracing::info!("  Divergent leaf: {}", diff);
    }

    std::fs::create_dir_all(&config.db)?;
    let store = SledStore::open(&config.db)?;

    let mut builder = ForestBuilder::new_or_resume(store, config.build.dim)?
        .with_commit_interval(config.build.commit_interval);
    if builder.leaf_count() > 0 {
        tracing::info!("Resuming from {} committed leaves", builder.leaf_count());
    }

    let started = Instant::now();
    builder.extend_to(size, |index| ledger_leaf(index, diff))?;
    let forest = builder.finish()?;

    let sizes = forest.get_subtree_sizes()?;
    let metadata = BuildMetadata {
        dim: forest.dim(),
        leaf_count: forest.leaf_count()?,
        peak_count: sizes.len(),
        built_at: chrono::Utc::now().timestamp(),
    };
    forest.store().save_metadata(&metadata)?;

    tracing::info!(
        "Built {} leaves in {} peaks {:?} ({:.1}s, {} bytes on disk)",
        metadata.leaf_count,
        metadata.peak_count,
        sizes,
        started.elapsed().as_secs_f64(),
        forest.store().size_on_disk()?
    );

    forest.store().close()?;
    Ok(())
}

/// Serve a ledger until Ctrl+C
async fn run_serve(config: NodeConfig) -> Result<()> {
    tracing::info!("Starting ledger server");
    tracing::info!("  Database: {:?}", config.db);
    tracing::info!("  Bind address: {}", config.addr);

    let store = SledStore::open(&config.db)?;
    if let Some(metadata) = store.load_metadata()? {
        tracing::info!(
            "Ledger of {} leaves in {} peaks, built at {}",
            metadata.leaf_count,
            metadata.peak_count,
            chrono::DateTime::from_timestamp(metadata.built_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| metadata.built_at.to_string())
        );
    }

    let forest = Arc::new(Forest::open(store)?);
    tracing::info!(
        "Serving dimension {} with {} leaves",
        forest.dim(),
        forest.leaf_count()?
    );

    let server = LedgerServer::new(forest.clone());
    let local = server.start(&config.addr).await?;

    tracing::info!("Verifiers can connect to {}.", local);
    tracing::info!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    forest.store().close()?;
    tracing::info!("Ledger server stopped");

    Ok(())
}

/// Run `parallel` verifiers, each doing `runs` tournaments, and report latency
async fn run_verify(config: VerifyConfig, servers: Vec<String>) -> Result<()> {
    if servers.len() < 2 {
        bail!("verification needs at least two ledger servers");
    }

    tracing::info!("Starting verification");
    tracing::info!("  Servers: {}", servers.join(", "));
    tracing::info!("  Dimension: {}", config.dim);
    tracing::info!("  Runs: {} x {} verifiers", config.runs, config.parallel);
    if let Some(ms) = config.round_timeout_ms {
        tracing::info!("  Round timeout: {}ms", ms);
    }

    let servers = Arc::new(servers);
    let report_winner = config.parallel == 1;
    let mut handles = Vec::with_capacity(config.parallel);

    for id in 0..config.parallel {
        let servers = servers.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            verifier_task(id, &config, &servers, report_winner).await
        }));
    }

    let mut latencies = Vec::new();
    for handle in handles {
        latencies.extend(handle.await??);
    }

    match latency_stats(&latencies) {
        Some((mean, stddev)) => tracing::info!(
            "{} runs, mean {:.3}ms, stddev {:.3}ms",
            latencies.len(),
            mean,
            stddev
        ),
        None => tracing::info!("No runs completed"),
    }

    Ok(())
}

/// One verifier: connect to every server and time each tournament
async fn verifier_task(
    id: usize,
    config: &VerifyConfig,
    servers: &[String],
    report_winner: bool,
) -> Result<Vec<f64>> {
    let mut to = Vec::with_capacity(servers.len());
    let mut from = Vec::with_capacity(servers.len());
    for addr in servers {
        let (tx, rx) = PeerLink::connect(addr).await?.split();
        to.push(tx);
        from.push(rx);
    }

    let mut verifier = Verifier::new(to, from, config.verifier_config())?;
    let mut latencies = Vec::with_capacity(config.runs);

    for run in 0..config.runs {
        let started = Instant::now();
        let result = verifier.run().await?;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        latencies.push(elapsed);

        tracing::debug!(
            "Verifier {} run {}: winner {} after {} matches ({:.3}ms)",
            id,
            run,
            result.winner,
            result.matches.len(),
            elapsed
        );
        if report_winner {
            tracing::info!(
                "Winner: {} ({}) with {} leaves",
                result.winner,
                servers[result.winner],
                result.mountain_range.total()
            );
        }
    }

    Ok(latencies)
}

/// Mean and population standard deviation of the samples
fn latency_stats(samples: &[f64]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}
