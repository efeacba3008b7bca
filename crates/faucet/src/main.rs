//! Faucet service binary

use anyhow::Context;
use clap::Parser;
use empe_common::utils::logging::init_logging;
use empe_faucet::api::{router, AppState};
use empe_faucet::broadcast::RelayBroadcaster;
use empe_faucet::config::Secret;
use empe_faucet::metrics::FaucetMetrics;
use empe_faucet::wallet::{SecretPhraseKeyProvider, Wallet};
use empe_faucet::{DispatchSettings, Dispatcher, FaucetConfig, FaucetDatabase, FaucetService};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Server address
    #[arg(long)]
    server_addr: Option<String>,

    /// Broadcast relay URL
    #[arg(long)]
    rpc_url: Option<String>,

    /// Faucet wallet secret phrase
    #[arg(long)]
    mnemonic: Option<String>,

    /// Amount paid to each recipient
    #[arg(long)]
    amount: Option<u128>,

    /// Seconds between dispatch cycles
    #[arg(long)]
    dispatch_interval: Option<u64>,

    /// Rate limit window (seconds)
    #[arg(long)]
    rate_limit_window: Option<u64>,

    /// Database path
    #[arg(long)]
    db_path: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration: file, then FAUCET_* env, then CLI
    let mut config = match &args.config {
        Some(path) => FaucetConfig::from_file(path)?,
        None => FaucetConfig::from_env()?,
    };

    if let Some(addr) = args.server_addr {
        config.server_addr = addr;
    }
    if let Some(rpc_url) = args.rpc_url {
        config.rpc_url = rpc_url;
    }
    if let Some(mnemonic) = args.mnemonic {
        config.mnemonic = Secret::new(mnemonic);
    }
    if let Some(amount) = args.amount {
        config.amount = amount;
    }
    if let Some(interval) = args.dispatch_interval {
        config.dispatch_interval_secs = interval;
    }
    if let Some(window) = args.rate_limit_window {
        config.rate_limit_window_secs = window;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    let _log_guard = init_logging(&config.logging)?;
    config.validate()?;

    info!("Starting Empe Faucet Service v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  RPC URL: {}", config.rpc_url);
    info!("  Chain ID: {}", config.chain_id);
    info!("  Amount per recipient: {}{}", config.amount, config.denom);
    info!("  Dispatch interval: {}s", config.dispatch_interval_secs);
    info!(
        "  Rate limit: {} requests / {}s",
        config.max_requests_per_window, config.rate_limit_window_secs
    );

    // Derive the signing identity before anything else runs
    let wallet = Arc::new(Wallet::new(
        Arc::new(SecretPhraseKeyProvider),
        config.mnemonic.clone(),
        config.derivation_params(),
    ));
    let identity = wallet
        .identity()
        .await
        .context("Cannot derive the faucet wallet")?;
    let faucet_address = identity.address().to_string();

    // Initialize database
    let database = FaucetDatabase::open(&config.db_path)?;
    let queue = database.queue()?;
    let pending = queue.count().await?;
    info!(
        "Database initialized at: {} ({} requests pending from a previous run)",
        config.db_path, pending
    );

    let metrics = Arc::new(FaucetMetrics::new()?);
    metrics.queue_depth.set(pending as i64);

    let broadcaster = Arc::new(RelayBroadcaster::new(
        config.rpc_url.clone(),
        config.chain_id.clone(),
        config.rpc_timeout(),
    )?);
    let dispatcher = Arc::new(Dispatcher::new(
        queue,
        wallet,
        broadcaster,
        DispatchSettings::from_config(&config)?,
        metrics.clone(),
    ));
    let service = Arc::new(FaucetService::new(
        config.clone(),
        &database,
        faucet_address,
        metrics.clone(),
    )?);
    info!("Faucet service initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start dispatcher
    let mut ticker = tokio::time::interval(config.dispatch_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let dispatcher_task = tokio::spawn(
        Arc::clone(&dispatcher).run(ticker, shutdown_rx.clone()),
    );

    // Start reaper task
    let reaper_task = config.rate_limit_reap_interval().map(|interval| {
        info!("Reaping expired rate limit records every {:?}", interval);
        tokio::spawn(Arc::clone(&service).run_reaper(interval, shutdown_rx.clone()))
    });

    let app = router(AppState {
        service,
        dispatcher,
        metrics,
    });

    // Start server
    let addr: SocketAddr = config.server_addr.parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped, waiting for the dispatcher");
    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher_task.await {
        error!("Dispatcher task failed: {}", e);
    }
    if let Some(task) = reaper_task {
        if let Err(e) = task.await {
            error!("Reaper task failed: {}", e);
        }
    }

    database.flush().await?;
    info!("Shutting down gracefully");
    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
