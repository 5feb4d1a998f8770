use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use trafficd::agent::Agent;
use trafficd::config::Config;
use trafficd::dashboard::DashboardAggregator;
use trafficd::retention::RetentionCompressor;
use trafficd::sampler::run_tick;
use trafficd::source::PeerNames;
use trafficd::store::{unix_now, Store};

/// Traffic accounting agent for proxy users and WireGuard peers.
#[derive(Parser)]
#[command(name = "trafficd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity, overriding the configured level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Run one retention pass against the database and exit.
    Compact,

    /// Print recent sampler runs, newest first.
    Runs {
        /// Only show runs recorded by this source.
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the dashboard for a trailing window as JSON.
    Dashboard {
        /// Window length, e.g. "24h" or "7days".
        #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
        since: Duration,
    },
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("trafficd {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Compact) => rt.block_on(compact(cfg)),
        Some(Command::Runs { source, limit }) => runs(&cfg, source.as_deref(), limit),
        Some(Command::Dashboard { since }) => rt.block_on(dashboard(cfg, since)),
        Some(Command::Version) | None => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting trafficd",
            );
            rt.block_on(run(cfg))
        }
    }
}

async fn open_store(cfg: &Config) -> Result<Store> {
    let db_cfg = cfg.database.clone();
    tokio::task::spawn_blocking(move || Store::open(&db_cfg))
        .await
        .context("store open task panicked")?
        .with_context(|| format!("opening {}", cfg.database.path.display()))
}

async fn compact(cfg: Config) -> Result<()> {
    let store = open_store(&cfg).await?;
    let compressor = RetentionCompressor::new(store.clone(), cfg.retention);

    let run = run_tick(&compressor, &store, None).await;
    if let Some(error) = run.error {
        anyhow::bail!("retention pass failed: {error}");
    }

    println!("{}", serde_json::to_string_pretty(&compressor.last_outcome())?);
    Ok(())
}

fn runs(cfg: &Config, source: Option<&str>, limit: usize) -> Result<()> {
    let store = Store::open(&cfg.database)?;
    for run in store.recent_runs(source, limit)? {
        println!(
            "{}\t{:<12}\t{:>6}ms\t{:>6}\t{}",
            run.ts,
            run.source,
            run.duration_ms,
            run.inserted,
            run.error.as_deref().unwrap_or("ok"),
        );
    }
    Ok(())
}

async fn dashboard(cfg: Config, since: Duration) -> Result<()> {
    let store = open_store(&cfg).await?;
    let aggregator = DashboardAggregator::new(
        store,
        cfg.proxy.enabled,
        cfg.peers.enabled,
        PeerNames::new(cfg.peers.names),
        cfg.dashboard.top_limit,
    );

    let end = unix_now();
    let start = end.saturating_sub(i64::try_from(since.as_secs()).unwrap_or(i64::MAX));
    let dash = aggregator.build(start, end).await?;

    println!("{}", serde_json::to_string_pretty(&dash)?);
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("trafficd stopped");

    Ok(())
}
