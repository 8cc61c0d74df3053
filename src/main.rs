use lottery_listener::config::Config;
use lottery_listener::onchain::{abi, AlloyLedger, TransactionSigner};
use lottery_listener::reconciler::{ReconcilerConfig, ReconcilerError, StateReconciler};
use lottery_listener::store::{MemoryStore, ProjectionStore, RedisProjectionStore};
use lottery_listener::upkeep::{UpkeepRequest, UpkeepTrigger};

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "lottery.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    // Load config
    let config_from_file = config_path.exists();
    let config = if config_from_file {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("lottery-listener v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_from_file {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }

    config.validate()?;
    let contract = config.contract_address()?;

    for (sig, ok) in abi::verify_topic_hashes() {
        if !ok {
            anyhow::bail!("event topic hash mismatch for {sig}");
        }
    }

    // --- Ledger ---
    let ledger = Arc::new(AlloyLedger::connect(&config.node.ws_url).await?);

    // --- Upkeep Trigger ---
    let upkeep_tx = if config.upkeep.enabled {
        let signer = if config.has_credentials() {
            match TransactionSigner::from_credential(&config.private_key) {
                Ok(signer) => {
                    info!(sender = %signer.address(), "upkeep signer loaded");
                    Some(signer)
                }
                Err(e) => {
                    error!(error = %e, "signing credential rejected, upkeep runs check-only");
                    None
                }
            }
        } else {
            warn!("LOTTERY_PRIVATE_KEY not set, upkeep runs check-only");
            None
        };

        let (tx, rx) = mpsc::unbounded_channel::<UpkeepRequest>();
        UpkeepTrigger::new(ledger.clone(), contract, signer, config.upkeep.max_in_flight)
            .start(rx);
        Some(tx)
    } else {
        info!("upkeep trigger disabled");
        None
    };

    let reconciler_config = ReconcilerConfig {
        contract,
        start_block: config.node.start_block,
        log_chunk_size: config.node.log_chunk_size,
    };

    // --- Projection Store + Reconciler ---
    let result = if config.store.url.starts_with("memory://") {
        warn!("using in-memory projection store, nothing will be persisted");
        run(ledger, MemoryStore::new(), reconciler_config, upkeep_tx).await
    } else {
        let mut store = RedisProjectionStore::connect(&config.store.url, &config.store.prefix)
            .await
            .context("connecting to projection store")?;
        store.ping().await.context("pinging projection store")?;
        run(ledger, store, reconciler_config, upkeep_tx).await
    };

    // `run` only comes back on a fatal error; in-flight upkeep tasks are abandoned.
    if let Err(e) = result {
        error!(error = %e, "listener stopped");
        return Err(e.into());
    }
    Ok(())
}

async fn run<S: ProjectionStore>(
    ledger: Arc<AlloyLedger>,
    store: S,
    config: ReconcilerConfig,
    upkeep_tx: Option<mpsc::UnboundedSender<UpkeepRequest>>,
) -> Result<(), ReconcilerError> {
    let mut reconciler = StateReconciler::new(ledger, store, config);
    if let Some(tx) = upkeep_tx {
        reconciler = reconciler.with_upkeep(tx);
    }

    tokio::select! {
        res = reconciler.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            Ok(())
        }
    }
}
