//! LeaseKeeper - Lease-Based Leader Election
//!
//! Runs a single election candidate and reports on elections kept in a
//! shared SQLite file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leasekeeper::clock::{format_timestamp, Clock, SystemClock};
use leasekeeper::config::{LeaseKeeperConfig, StoreBackend};
use leasekeeper::election::Transition;
use leasekeeper::lease::{open_store, LeaseStore, SqliteLeaseStore};
use leasekeeper::{Error, LeaseCandidate};

/// LeaseKeeper - Lease-Based Leader Election
#[derive(Parser)]
#[command(name = "leasekeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "leasekeeper.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election and hold leadership until interrupted
    Run,

    /// Print the current lease record as JSON
    Status,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "leasekeeper.toml")]
        output: PathBuf,

        /// Candidate ID (generated when omitted)
        #[arg(long)]
        self_id: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config-driven commands load the file once, before logging is up, so
    // its logging settings apply and a generated self_id stays stable
    let loaded = match cli.command {
        Commands::Run | Commands::Status => Some(
            LeaseKeeperConfig::from_file(&cli.config)
                .with_context(|| format!("failed to load configuration from {:?}", cli.config)),
        ),
        _ => None,
    };
    let logging = match &loaded {
        Some(Ok(config)) => config.logging.clone(),
        _ => Default::default(),
    };
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Run => run_candidate(loaded.context("configuration not loaded")??).await,
        Commands::Status => run_status(loaded.context("configuration not loaded")??).await,
        Commands::Init { output, self_id } => run_init(output, self_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Join the election until Ctrl+C
async fn run_candidate(config: LeaseKeeperConfig) -> anyhow::Result<()> {
    tracing::info!(
        "Loaded configuration for candidate {} on {}",
        config.election.self_id,
        config.election.key
    );

    let store = open_store(&config).context("failed to open lease store")?;
    let candidate = LeaseCandidate::new(config.election.clone(), store, Arc::new(SystemClock))?;

    candidate.subscribe(|event| match event.transition {
        Transition::BecameLeader => tracing::info!(
            "#{} {} is now LEADER ({})",
            event.sequence,
            event.candidate_id,
            format_timestamp(event.at)
        ),
        Transition::LostLeadership => tracing::info!(
            "#{} {} is no longer leader ({})",
            event.sequence,
            event.candidate_id,
            format_timestamp(event.at)
        ),
    });

    candidate.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    candidate.stop().await?;
    Ok(())
}

/// Print the lease record of a SQLite-backed election
async fn run_status(config: LeaseKeeperConfig) -> anyhow::Result<()> {
    if config.store.backend != StoreBackend::Sqlite {
        bail!("status needs a shared store; the in-memory store only lives inside `run`");
    }
    let path = config
        .store
        .path
        .as_ref()
        .context("store.path is required for the sqlite backend")?;

    let store = SqliteLeaseStore::open(path, config.busy_timeout(), config.poll_interval())?;
    let now = SystemClock.now();
    let key = &config.election.key;

    let report = match store.read(key).await {
        Ok(Some(current)) => serde_json::json!({
            "store": store.path(),
            "key": key,
            "holder_id": current.record.holder_id,
            "held": current.record.is_held(now),
            "expires_at": current.record.expires_at,
            "expires_at_utc": format_timestamp(current.record.expires_at),
            "version": current.version,
        }),
        Ok(None) => serde_json::json!({
            "store": store.path(),
            "key": key,
            "held": false,
        }),
        Err(Error::MalformedRecord { version, reason, .. }) => serde_json::json!({
            "store": store.path(),
            "key": key,
            "held": false,
            "version": version,
            "malformed": reason,
        }),
        Err(e) => return Err(e.into()),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: PathBuf, self_id: Option<String>) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{:?} already exists", output);
    }

    let self_id = self_id.unwrap_or_else(leasekeeper::config::generate_self_id);
    let rendered = LeaseKeeperConfig::sample(&self_id).to_toml()?;
    std::fs::write(&output, rendered)
        .with_context(|| format!("failed to write {:?}", output))?;

    println!("Configuration written to {:?}", output);
    println!("Set election.key and store.path, then start with: leasekeeper run");
    Ok(())
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match LeaseKeeperConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Election key:   {}", config.election.key);
            println!("  Candidate:      {}", config.election.self_id);
            println!("  Lease duration: {:?}", config.election.lease_duration());
            println!("  Renew interval: {:?}", config.election.renew_interval());
            println!("  Store timeout:  {:?}", config.election.store_timeout());
            println!("  Store backend:  {:?}", config.store.backend);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration is invalid: {}", e);
            Err(e.into())
        }
    }
}
