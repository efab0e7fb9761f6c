//! Bazaar settlement daemon.
//!
//! Opens the settlement store, connects to a ledger node, recovers actions
//! left running by a previous process and periodically retries failed ones
//! until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use bazaar_core::address::Network;
use bazaar_core::traits::LedgerRpc;
use bazaar_ledger::{LedgerConfig, LedgerConnection, SubscriptionRegistry, WsLedgerClient};
use bazaar_settlement::config::seed_secret_from_env;
use bazaar_settlement::{SettlementConfig, SettlementService, SettlementStore};

/// How long the resume job gets to notice shutdown once in-flight actions
/// have drained.
const RESUME_JOB_EXIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "bazaar-settler", version, about = "Bazaar settlement daemon")]
struct Args {
    /// TOML config file. Missing files are ignored.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the settlement store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Ledger node WebSocket URL
    #[arg(long)]
    ledger_url: Option<String>,

    /// Settle against the test network
    #[arg(long)]
    testnet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(self, mut config: SettlementConfig) -> SettlementConfig {
        if self.testnet {
            config.network = Network::Testnet;
            if config.ledger == LedgerConfig::default() {
                config.ledger = LedgerConfig::for_network(Network::Testnet);
            }
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = Some(dir);
        }
        if let Some(url) = self.ledger_url {
            config.ledger.url = url;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = SettlementConfig::load(args.config.as_deref()).context("loading config")?;
    let config = args.apply(config);

    info!("Bazaar settler v{}", env!("CARGO_PKG_VERSION"));
    info!(network = ?config.network, data_dir = ?config.data_dir(), ledger = %config.ledger.url, "starting");

    std::fs::create_dir_all(config.data_dir()).context("creating data dir")?;
    let store = Arc::new(SettlementStore::open(config.store_path()).context("opening settlement store")?);

    let secret = seed_secret_from_env().context("reading seed secret")?;
    let deriver = config.wallet_deriver(&secret).context("decrypting master seed")?;

    let rpc: Arc<dyn LedgerRpc> = Arc::new(WsLedgerClient::new(config.ledger.clone()));
    let connection = Arc::new(LedgerConnection::new(rpc.clone(), config.ledger.clone()));
    let registry = Arc::new(SubscriptionRegistry::new(rpc));
    let service = Arc::new(SettlementService::new(
        store,
        connection.clone(),
        registry,
        deriver,
        config.orchestrator_settings(),
    ));

    connection.wait_for_connection().await.context("connecting to ledger")?;
    let recovered = service.recover_interrupted().context("recovering interrupted actions")?;
    if recovered > 0 {
        info!(recovered, "interrupted actions queued for resume");
    }

    let mut resume = tokio::spawn(service.clone().run_resume_job(config.resume_interval()));

    info!("settler running (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await.context("installing Ctrl+C handler")?;
    info!("received Ctrl+C, shutting down...");

    // Drain before touching the resume job; its pass may hold an in-flight guard.
    if !service.shutdown(config.shutdown_grace()).await {
        warn!(inflight = ?service.action_tracker().inflight(), "grace period elapsed with actions still running");
    }
    if tokio::time::timeout(RESUME_JOB_EXIT, &mut resume).await.is_err() {
        warn!("resume job did not stop, aborting");
        resume.abort();
    }
    info!("settler shutdown complete");
    Ok(())
}

/// Initialize tracing with the given level and output format.
///
/// `format = "json"` gives structured output; anything else is plain text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
