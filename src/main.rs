//! LiquidityGuard - Depeg Monitor & Payout Attestation Service
//!
//! Polls a liquidity pool for reserve imbalance, tracks depeg risk
//! windows with hysteresis, snapshots evidence, and optionally watches
//! a lending market for collateral depeg with liquidation correlation.

use std::sync::Arc;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use liquidityguard::chain::pool::PoolReader;
use liquidityguard::chain::rpc::RpcClient;
use liquidityguard::config::Config;
use liquidityguard::lending::LendingMonitor;
use liquidityguard::oracle::PriceOracle;
use liquidityguard::sampler::PoolMonitor;
use liquidityguard::snapshot::SnapshotStore;
use liquidityguard::store::EventStore;
use liquidityguard::webhook::WebhookEmitter;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liquidityguard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("configuration")?;
    info!(
        pool = %config.pool_id,
        chain_id = config.chain_id,
        r_min_bps = config.r_min_bps,
        grace_period_secs = config.grace_period_secs,
        "starting liquidityguard"
    );

    let rpc = Arc::new(
        RpcClient::new(
            config.rpc_url.clone(),
            std::time::Duration::from_secs(config.rpc_timeout_secs),
        )
        .context("rpc client")?,
    );
    let store = EventStore::open(&config.db_path).context("event store")?;
    let snapshots = Arc::new(SnapshotStore::new(&config.snapshot_dir).context("snapshot store")?);
    let webhook = Arc::new(WebhookEmitter::new(
        config.webhook_url.clone(),
        config.webhook_secret.clone(),
    ));
    if config.signer_private_key.is_none() {
        warn!("no signer key configured, claim signing is disabled");
    }

    let reader = PoolReader::new(
        rpc.clone(),
        config.pool_address.clone(),
        config.fallback_coins.clone(),
        config.default_token_decimals,
    );
    let oracle = PriceOracle::from_config(&config, rpc.clone()).context("price oracle")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_monitor = PoolMonitor::new(
        &config,
        reader,
        oracle,
        store.clone(),
        snapshots.clone(),
        webhook.clone(),
    );
    let mut handles = vec![tokio::spawn(pool_monitor.run(shutdown_rx.clone()))];

    if let Some(market) = config.lending.clone() {
        let monitor = LendingMonitor::new(
            &config,
            market,
            rpc.clone(),
            store.clone(),
            snapshots.clone(),
            webhook.clone(),
        )
        .context("lending monitor")?;
        handles.push(tokio::spawn(monitor.run(shutdown_rx.clone())));
    }

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested, draining monitors");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("stopped");
    Ok(())
}
