//! # CI Suggester CLI (`cisug`)
//!
//! The `cisug` binary runs the offline corpus/index build against the asset
//! store and serves ranked CI suggestions.
//!
//! ## Usage
//!
//! ```bash
//! cisug --config ./config/cisug.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cisug etl` | Harvest CIs and changes, write the corpus |
//! | `cisug index` | Embed the corpus, write index, metadata and manifest |
//! | `cisug build` | `etl` then `index` once |
//! | `cisug run` | Dependency check, then `build` every `--interval` seconds |
//! | `cisug serve` | Start the HTTP query endpoint |
//! | `cisug suggest "<query>"` | Rank CIs for a query from the command line |
//! | `cisug check-deps` | Verify required applications on the asset store |
//! | `cisug stats` | Summarize the artifacts in the data directory |
//!
//! ## Examples
//!
//! ```bash
//! # Rebuild everything once
//! cisug build --config ./config/cisug.toml
//!
//! # Keep rebuilding every 10 minutes
//! cisug run --interval 600
//!
//! # Query from the shell
//! cisug suggest "payment gateway latency after deploy" --k 5
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use ci_suggester::config::{self, Config};
use ci_suggester::embedding::create_provider;
use ci_suggester::progress::ProgressMode;
use ci_suggester::source::TableApiSource;
use ci_suggester::{deps, pipeline, ranking, server, stats, telemetry};

/// CI Suggester: ranks configuration items for free-text queries using
/// semantic similarity and change history.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cisug.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cisug",
    about = "CI Suggester: ranked configuration-item suggestions from change history",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cisug.toml")]
    config: PathBuf,

    /// ETL progress on stderr: auto, human, json, or off.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest CIs and their recent changes and overwrite the corpus.
    Etl,

    /// Embed the corpus and rebuild the index.
    Index,

    /// Run `etl` then `index` once.
    Build,

    /// Rebuild repeatedly until a run fails or Ctrl-C.
    Run {
        /// Seconds to wait between runs.
        #[arg(long, default_value_t = 60)]
        interval: u64,

        /// Skip the dependency preflight.
        #[arg(long)]
        skip_deps: bool,
    },

    /// Start the HTTP query endpoint on `[server].bind`.
    Serve,

    /// Rank CIs for a query.
    Suggest {
        /// Free-text query.
        query: String,

        /// Number of results (defaults to `[server].default_k`).
        #[arg(long)]
        k: Option<i64>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check required applications on the asset store.
    CheckDeps,

    /// Summarize the artifacts in the data directory.
    Stats,
}

async fn dispatch(cfg: &Config, command: Commands, progress: ProgressMode) -> anyhow::Result<()> {
    match command {
        Commands::Etl => {
            let source = TableApiSource::new(&cfg.source)?;
            let n = pipeline::run_etl(cfg, &source, progress).await?;
            println!("Wrote {} CI profiles.", n);
        }
        Commands::Index => {
            let provider = create_provider(&cfg.embedding)?;
            let manifest = pipeline::run_index(cfg, provider.as_ref()).await?;
            println!(
                "Indexed {} CIs ({} dims, {}).",
                manifest.count, manifest.dims, manifest.model
            );
        }
        Commands::Build => {
            let source = TableApiSource::new(&cfg.source)?;
            let provider = create_provider(&cfg.embedding)?;
            let manifest = pipeline::run_build(cfg, &source, provider.as_ref(), progress).await?;
            println!("Built index of {} CIs.", manifest.count);
        }
        Commands::Run {
            interval,
            skip_deps,
        } => {
            let source = TableApiSource::new(&cfg.source)?;
            let provider = create_provider(&cfg.embedding)?;
            pipeline::run_loop(
                cfg,
                &source,
                provider.as_ref(),
                progress,
                Duration::from_secs(interval),
                skip_deps,
            )
            .await?;
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        Commands::Suggest { query, k, json } => {
            ranking::run_suggest(cfg, &query, k, json).await?;
        }
        Commands::CheckDeps => {
            let source = TableApiSource::new(&cfg.source)?;
            if !deps::check_dependencies(&cfg.dependencies, &source, cfg.source.page_size).await? {
                bail!("dependency check failed");
            }
            println!("Dependencies OK.");
        }
        Commands::Stats => {
            stats::run_stats(cfg)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let Some(progress) = ProgressMode::parse(&cli.progress) else {
        bail!(
            "invalid --progress value '{}': expected auto, human, json, or off",
            cli.progress
        );
    };

    let cfg = config::load_config(&cli.config)?;
    let telemetry = telemetry::init(&cfg)?;
    let process_id = telemetry.process_id;
    tracing::info!(stage = "process", %process_id, "cisug {} starting", env!("CARGO_PKG_VERSION"));

    let result = dispatch(&cfg, cli.command, progress).await;
    match &result {
        Ok(()) => tracing::info!(stage = "process", %process_id, "cisug finished"),
        Err(e) => tracing::error!(stage = "process", %process_id, "cisug failed: {:#}", e),
    }
    telemetry.shutdown().await;
    result
}
