use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use bizpulse::agent::{self, Agent};
use bizpulse::config::Config;
use bizpulse::trend::Grouping;

/// Business-event aggregation and live-ranking service.
#[derive(Parser)]
#[command(name = "bizpulse", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Run one aggregation cycle for a view and print it as JSON.
    Snapshot {
        /// View name from the configuration.
        #[arg(long)]
        view: String,

        /// Business day (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Restrict rankings and logs to this display name.
        #[arg(long)]
        identity: Option<String>,
    },

    /// Print sales and purchase trends grouped by period as JSON.
    Trend {
        #[arg(long, value_enum, default_value_t = Grouping::Month)]
        group: Grouping,
    },
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
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
        println!("bizpulse {}", version::full());
        return Ok(());
    }

    // Initialize tracing. Logs go to stderr so JSON output stays clean.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Snapshot {
            view,
            date,
            identity,
        }) => rt.block_on(print_snapshot(&cfg, &view, date, identity.as_deref())),
        Some(Command::Trend { group }) => rt.block_on(print_trend(&cfg, group)),
        Some(Command::Version) | None => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting bizpulse",
            );
            rt.block_on(async { run(cfg).await })
        }
    }
}

async fn print_snapshot(
    cfg: &Config,
    view: &str,
    date: Option<NaiveDate>,
    identity: Option<&str>,
) -> Result<()> {
    let json = agent::snapshot_once(cfg, view, date, identity).await?;
    println!("{json}");
    Ok(())
}

async fn print_trend(cfg: &Config, group: Grouping) -> Result<()> {
    let report = agent::trend_once(cfg, group).await?;
    let json = serde_json::to_string_pretty(&report).context("encoding trend report")?;
    println!("{json}");
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("bizpulse stopped");

    Ok(())
}
