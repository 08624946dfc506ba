//! swap-settler daemon
//!
//! Wires the ledger, backends, reconcilers, and per-account drivers together
//! and runs them until a shutdown signal.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use swap_settler::api;
use swap_settler::backend::bitcoin::batch::BitcoinBatcher;
use swap_settler::backend::bitcoin::rpc::BitcoinRpc;
use swap_settler::backend::bitcoin::BitcoinBackend;
use swap_settler::backend::evm::{EvmBackend, EvmRpc};
use swap_settler::backend::SwapBackend;
use swap_settler::config::{AccountConfig, Settings};
use swap_settler::driver::SubscriptionDriver;
use swap_settler::keys::KeyCache;
use swap_settler::metrics::{self, MetricsServer};
use swap_settler::orderbook::{HttpOrderbook, OrderbookApi};
use swap_settler::reconcile::Reconciler;
use swap_settler::recovery::Recovery;
use swap_settler::store::SwapLedger;
use swap_settler::types::Chain;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting swap-settler v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        accounts = settings.accounts.len(),
        evm_chains = settings.enabled_evm_chains().len(),
        bitcoin = settings.bitcoin.enabled,
        "Loaded configuration"
    );

    // Open the swap ledger
    let ledger = Arc::new(SwapLedger::open(&settings.database.url).await?);
    info!("Swap ledger opened");

    // Key derivation cache, owned here and passed down
    let keys = Arc::new(KeyCache::new(settings.wallet.seed()?));

    // Order-book client
    let orderbook: Arc<dyn OrderbookApi> = Arc::new(HttpOrderbook::new(
        &settings.orderbook.http_url,
        &settings.orderbook.ws_url,
        std::time::Duration::from_secs(settings.orderbook.request_timeout_secs),
    )?);
    match orderbook.login().await {
        Ok(token) => orderbook.set_auth(token),
        Err(e) => warn!("order-book login failed, continuing unauthenticated: {e}"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared Bitcoin backend + batch executor
    let mut bitcoin_backend: Option<Arc<BitcoinBackend>> = None;
    let mut batcher: Option<Arc<BitcoinBatcher>> = None;
    if settings.bitcoin.enabled {
        let network = settings
            .bitcoin
            .chain
            .bitcoin_network()
            .context("bitcoin.chain is not a Bitcoin chain")?;
        let chain = Arc::new(BitcoinRpc::new(
            &settings.bitcoin.rpc_url,
            &settings.bitcoin.rpc_user,
            &settings.bitcoin.rpc_password,
        )?);
        let wallet = settings
            .accounts
            .iter()
            .find(|a| a.name == settings.bitcoin.wallet_account)
            .context("bitcoin.wallet_account is not a configured account")?;
        let key = keys.btc_key(settings.bitcoin.chain, &wallet.name, wallet.selector)?;
        let backend = Arc::new(BitcoinBackend::new(
            chain,
            network,
            key,
            settings.bitcoin.fee_tier,
        ));
        batcher = Some(Arc::new(BitcoinBatcher::new(
            ledger.clone(),
            backend.clone(),
            settings.settler.batch_capacity,
            settings.settler.batch_tick(),
        )));
        bitcoin_backend = Some(backend);
        info!(chain = %settings.bitcoin.chain, "Bitcoin backend initialized");
    }

    // One RPC stack per EVM chain, shared across accounts
    let mut evm_rpcs: HashMap<Chain, Arc<EvmRpc>> = HashMap::new();
    for (name, evm) in settings.enabled_evm_chains() {
        evm_rpcs.insert(evm.chain, Arc::new(EvmRpc::new(evm)?));
        info!(chain = %evm.chain, config = %name, "EVM backend initialized");
    }

    let recovery = Arc::new(Recovery::new(ledger.clone(), orderbook.clone()));

    // Startup recovery, then one driver task per account
    let mut driver_handles = Vec::new();
    for account in &settings.accounts {
        match recovery.run(&account.name).await {
            Ok(promoted) if promoted > 0 => {
                info!(account = %account.name, promoted, "startup recovery promoted records")
            }
            Ok(_) => {}
            Err(e) => warn!(account = %account.name, "startup recovery failed: {e}"),
        }

        let mut backends: HashMap<Chain, Arc<dyn SwapBackend>> = HashMap::new();
        if let Some(backend) = &bitcoin_backend {
            backends.insert(settings.bitcoin.chain, backend.clone());
        }
        for (_, evm) in settings.enabled_evm_chains() {
            let rpc = evm_rpcs
                .get(&evm.chain)
                .expect("rpc built for every enabled chain")
                .clone();
            let wallet = keys.evm_wallet(evm.chain, &account.name, account.selector)?;
            let contract = evm
                .contract_address
                .parse()
                .with_context(|| format!("invalid contract address for {}", evm.chain))?;
            backends.insert(
                evm.chain,
                Arc::new(EvmBackend::new(
                    rpc,
                    wallet,
                    contract,
                    evm.log_scan_step,
                    settings.settler.submit_timeout(),
                )),
            );
        }

        let signer = signer_address(&settings, &keys, account)?;
        let reconciler = Arc::new(Reconciler::new(
            account.name.clone(),
            signer,
            ledger.clone(),
            backends,
            batcher.clone(),
        ));
        let driver = SubscriptionDriver::new(
            reconciler,
            recovery.clone(),
            orderbook.clone(),
            ledger.clone(),
            settings.settler.poll_interval(),
        );
        let rx = shutdown_rx.clone();
        driver_handles.push(tokio::spawn(async move { driver.run(rx).await }));
    }
    info!(drivers = driver_handles.len(), "Account drivers started");

    // Batch executor tick
    let batch_handle = batcher.clone().map(|b| {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { b.run(rx).await })
    });

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let ledger = ledger.clone();
        let orderbook = orderbook.clone();
        async move {
            if let Err(e) = api::run_server(config, ledger, orderbook).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let ledger = ledger.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
                match ledger.health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Ledger health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("swap-settler is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Drivers and the batch executor drain their in-flight work first
    shutdown_tx.send(true).ok();
    for handle in driver_handles {
        let _ = handle.await;
    }
    if let Some(handle) = batch_handle {
        let _ = handle.await;
    }

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("swap-settler stopped");
    Ok(())
}

/// The order-book identity an account signs in with: an explicit configured
/// address, else the account's derived address on the first enabled EVM
/// chain, else its Bitcoin address.
fn signer_address(settings: &Settings, keys: &KeyCache, account: &AccountConfig) -> Result<String> {
    if let Some(address) = &account.address {
        return Ok(address.clone());
    }
    let mut evm = settings.enabled_evm_chains();
    evm.sort_by(|a, b| a.0.cmp(b.0));
    if let Some((_, chain)) = evm.first() {
        return Ok(keys.address(chain.chain, &account.name, account.selector)?);
    }
    if settings.bitcoin.enabled {
        return Ok(keys.address(settings.bitcoin.chain, &account.name, account.selector)?);
    }
    anyhow::bail!("no chain enabled to derive an address for {}", account.name)
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_settler=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
