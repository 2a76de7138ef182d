//! Collateral depeg watch for a lending market.
//!
//! The detector input here is the absolute deviation of the collateral
//! price from 1.0, in bps, guarded from above. While a window is open
//! the monitor also scans the lending pool's `LiquidationCall` logs and
//! attaches them to the window as evidence. Liquidations are
//! correlation only; they never open or close a window.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::keccak256;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::chain::rpc::RpcClient;
use crate::config::{Config, LendingConfig};
use crate::detector::{Guard, HysteresisDetector};
use crate::errors::{GuardError, Result};
use crate::oracle::{
    ChainlinkLatestSource, PoolAverageSource, PriceOracle, PriceRing, PriceSource, PythPullSource,
};
use crate::sampler::{now_ts, WindowTracker, BPS_SCALE};
use crate::snapshot::SnapshotStore;
use crate::store::{EventStore, PoolSample};
use crate::webhook::WebhookEmitter;

const LIQUIDATION_SIGNATURE: &str =
    "LiquidationCall(address,address,address,uint256,uint256,address,bool)";

fn liquidation_topic() -> String {
    format!("0x{}", hex::encode(keccak256(LIQUIDATION_SIGNATURE.as_bytes())))
}

pub fn deviation_bps(price: f64) -> i64 {
    ((price - 1.0).abs() * BPS_SCALE).round() as i64
}

pub struct LendingMonitor {
    market: LendingConfig,
    chain_id: u64,
    rpc: Arc<RpcClient>,
    oracle: PriceOracle,
    tracker: WindowTracker,
    liquidation_topic: String,
    last_log_block: Option<u64>,
}

impl LendingMonitor {
    pub fn new(
        config: &Config,
        market: LendingConfig,
        rpc: Arc<RpcClient>,
        store: EventStore,
        snapshots: Arc<SnapshotStore>,
        webhook: Arc<WebhookEmitter>,
    ) -> Result<Self> {
        let ring = Arc::new(RwLock::new(PriceRing::new(config.twap_ring_capacity)));
        let mut sources: Vec<Box<dyn PriceSource>> = Vec::new();
        if let Some(feed) = &market.price_feed_address {
            sources.push(Box::new(ChainlinkLatestSource::new(
                rpc.clone(),
                feed.clone(),
            )));
        }
        if let Some(feed_id) = &config.pyth_feed_id {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.rpc_timeout_secs))
                .build()
                .map_err(|e| GuardError::Configuration(format!("pyth client: {e}")))?;
            sources.push(Box::new(PythPullSource::new(
                client,
                config.pyth_endpoint.clone(),
                feed_id.clone(),
                config.pyth_max_age_secs,
            )));
        }
        sources.push(Box::new(PoolAverageSource::new(ring.clone())));
        let oracle = PriceOracle::new(sources, ring, config.twap_horizon_secs);

        let detector = HysteresisDetector::new(
            market.deviation_max_bps,
            market.grace_period_secs,
            Guard::Max,
        );
        let tracker = WindowTracker::new(
            market.market_id.clone(),
            config.chain_id,
            "DEPEG_COLLATERAL".to_string(),
            detector,
            store,
            snapshots,
            webhook,
        );
        Ok(Self {
            market,
            chain_id: config.chain_id,
            rpc,
            oracle,
            tracker,
            liquidation_topic: liquidation_topic(),
            last_log_block: None,
        })
    }

    fn build_sample(&self, timestamp: i64, block_number: u64, price: f64) -> PoolSample {
        let dev = deviation_bps(price);
        PoolSample {
            pool_id: self.market.market_id.clone(),
            chain_id: self.chain_id,
            timestamp,
            block_number,
            reserve_base: 0.0,
            reserve_quote: 0.0,
            total_supply: 0.0,
            price,
            r_bps: dev,
            loss_quote_bps: dev,
            twap_bps: (price * BPS_SCALE).round() as i64,
        }
    }

    async fn scan_liquidations(&self, sample: &PoolSample, from: u64, to: u64) {
        if from > to {
            return;
        }
        let logs = match self
            .rpc
            .get_logs(&self.market.pool_address, &self.liquidation_topic, from, to)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(market = %self.market.market_id, error = %e, "liquidation log scan failed");
                return;
            }
        };
        for log in logs {
            self.tracker
                .record_liquidation(sample, &log.transaction_hash)
                .await;
        }
    }

    pub async fn tick(&mut self) {
        let now = now_ts();
        let reading = match self.oracle.resolve_twap().await {
            Ok(reading) => reading,
            Err(GuardError::NoOracleAvailable) => {
                warn!(market = %self.market.market_id, "no price source available, tick skipped");
                return;
            }
            Err(e) => {
                warn!(market = %self.market.market_id, error = %e, "price resolution failed");
                return;
            }
        };
        // Feed the local average so short feed outages do not blind the
        // detector.
        self.oracle.record_pool_price(now, reading.price);

        let block_number = match self.rpc.block_number().await {
            Ok(n) => n,
            Err(e) => {
                warn!(market = %self.market.market_id, error = %e, "block lookup failed, tick skipped");
                return;
            }
        };

        let sample = self.build_sample(now, block_number, reading.price);
        let value = deviation_bps(reading.price);
        self.tracker.apply(&sample, value).await;

        let scan_from = self.last_log_block.map(|b| b + 1).unwrap_or(block_number);
        if self.tracker.active_risk_id().is_some() {
            self.scan_liquidations(&sample, scan_from, block_number).await;
        }
        self.last_log_block = Some(block_number);
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.market.poll_interval_ms));
        info!(market = %self.market.market_id, asset = %self.market.collateral_asset, "lending monitor started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!(market = %self.market.market_id, "lending monitor stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liquidation_topic_matches_aave_v3() {
        assert_eq!(
            liquidation_topic(),
            "0xe413a321e8681d831f4dbccbca790d2952b56f977908e45be37335533e005286"
        );
    }

    #[test]
    fn test_deviation_is_symmetric_in_bps() {
        assert_eq!(deviation_bps(1.0), 0);
        assert_eq!(deviation_bps(0.98), 200);
        assert_eq!(deviation_bps(1.02), 200);
        assert_eq!(deviation_bps(0.9495), 505);
    }
}
