//! Polling driver: one tick fetches a sample, advances the detector,
//! persists results, and fires snapshot/webhook side effects on
//! transitions.
//!
//! The tracker owns the per-market sequencing guarantees: samples are
//! applied in strictly increasing timestamp order (duplicates and
//! out-of-order ticks are dropped here, never fed to the detector), and
//! a persistence failure after a detector transition is logged loudly
//! but never rolls the in-memory machine back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain::pool::{format_units, parse_units, PoolReader};
use crate::chain::rpc::BlockRef;
use crate::config::Config;
use crate::detector::{Guard, HysteresisDetector, Transition};
use crate::errors::{GuardError, Result};
use crate::oracle::PriceOracle;
use crate::snapshot::{SampleSnapshot, SnapshotStore};
use crate::store::{EventStore, PoolSample, RiskState, SnapshotLabel, SnapshotRecord};
use crate::webhook::{WebhookEmitter, WebhookEvent};

pub const BPS_SCALE: f64 = 10_000.0;

#[derive(Debug)]
struct ActiveWindow {
    risk_id: String,
    start: i64,
    max_loss_bps: i64,
    min_r_bps: i64,
}

/// Per-market window bookkeeping around the detector: severity ratchet,
/// versioned persistence, evidence snapshots, webhooks.
pub struct WindowTracker {
    market_id: String,
    chain_id: u64,
    risk_type: String,
    detector: HysteresisDetector,
    store: EventStore,
    snapshots: Arc<SnapshotStore>,
    webhook: Arc<WebhookEmitter>,
    active: Option<ActiveWindow>,
    last_timestamp: Option<i64>,
}

impl WindowTracker {
    pub fn new(
        market_id: String,
        chain_id: u64,
        risk_type: String,
        detector: HysteresisDetector,
        store: EventStore,
        snapshots: Arc<SnapshotStore>,
        webhook: Arc<WebhookEmitter>,
    ) -> Self {
        Self {
            market_id,
            chain_id,
            risk_type,
            detector,
            store,
            snapshots,
            webhook,
            active: None,
            last_timestamp: None,
        }
    }

    pub fn active_risk_id(&self) -> Option<&str> {
        self.active.as_ref().map(|w| w.risk_id.as_str())
    }

    fn snapshot_of(&self, sample: &PoolSample) -> SampleSnapshot {
        SampleSnapshot {
            timestamp: sample.timestamp,
            block_number: sample.block_number,
            pool_id: sample.pool_id.clone(),
            chain_id: sample.chain_id,
            reserve_base: sample.reserve_base,
            reserve_quote: sample.reserve_quote,
            total_supply: sample.total_supply,
            price: sample.price,
            r_bps: sample.r_bps,
            loss_quote_bps: sample.loss_quote_bps,
            twap_bps: sample.twap_bps,
        }
    }

    fn store_evidence(
        &self,
        risk_id: &str,
        sample: &PoolSample,
        label: SnapshotLabel,
        note: String,
    ) -> String {
        let content_id = match self.snapshots.put(&self.snapshot_of(sample)) {
            Ok(cid) => cid,
            Err(e) => {
                error!(risk_id, error = %e, "snapshot write failed");
                String::new()
            }
        };
        let record = SnapshotRecord {
            snapshot_id: Uuid::new_v4().to_string(),
            risk_id: risk_id.to_string(),
            content_id: content_id.clone(),
            label: label.as_str().to_string(),
            note: Some(note),
            uploaded_at: sample.timestamp,
        };
        if let Err(e) = self.store.insert_snapshot(&record) {
            error!(risk_id, error = %e, "snapshot record write failed");
        }
        content_id
    }

    fn persist_window(
        &self,
        window: &ActiveWindow,
        state: RiskState,
        window_end: Option<i64>,
        sample: &PoolSample,
    ) {
        let result = self.store.append_risk_version(
            &window.risk_id,
            &self.market_id,
            self.chain_id,
            &self.risk_type,
            state,
            window.start,
            window_end,
            window.max_loss_bps,
            sample.twap_bps,
            sample.r_bps,
            sample.timestamp,
        );
        if let Err(e) = result {
            // The transition is a fact about observed reality; the
            // in-memory machine stays advanced and the next tick
            // writes a fresh version row.
            error!(risk_id = %window.risk_id, error = %e, "risk event write failed");
        }
    }

    /// Advance the tracker by one sample. `value_bps` is the detector
    /// input (reserve ratio or price deviation depending on market).
    pub async fn apply(&mut self, sample: &PoolSample, value_bps: i64) {
        if let Some(last) = self.last_timestamp {
            if sample.timestamp <= last {
                warn!(
                    market = %self.market_id,
                    timestamp = sample.timestamp,
                    last,
                    "non-monotonic sample dropped"
                );
                return;
            }
        }
        self.last_timestamp = Some(sample.timestamp);

        if let Err(e) = self.store.insert_sample(sample) {
            error!(market = %self.market_id, error = %e, "sample write failed");
        }

        // Ratchet the open window toward the worst observed values.
        if let Some(active) = self.active.as_mut() {
            active.max_loss_bps = active.max_loss_bps.max(sample.loss_quote_bps);
            active.min_r_bps = active.min_r_bps.min(sample.r_bps);
        }
        if let Some(active) = self.active.as_ref() {
            self.persist_window(active, RiskState::Open, None, sample);
        }

        match self.detector.on_sample(sample.timestamp, value_bps) {
            Some(Transition::Start { start, .. }) => {
                let risk_id = format!("{}|{start}", self.market_id);
                let snapshot_id = self.store_evidence(
                    &risk_id,
                    sample,
                    SnapshotLabel::DepegStart,
                    format!("depeg window opened at block {}", sample.block_number),
                );

                // The window is backdated to the first breaching
                // sample, so the ratchet must cover the grace period
                // too. Seed it from the persisted samples in range.
                let metrics = self
                    .store
                    .window_metrics(&self.market_id, start, sample.timestamp)
                    .ok();
                let window = ActiveWindow {
                    risk_id: risk_id.clone(),
                    start,
                    max_loss_bps: metrics
                        .as_ref()
                        .and_then(|m| m.max_loss_bps)
                        .unwrap_or(sample.loss_quote_bps),
                    min_r_bps: metrics
                        .as_ref()
                        .and_then(|m| m.min_r_bps)
                        .unwrap_or(sample.r_bps),
                };
                self.persist_window(&window, RiskState::Open, None, sample);
                self.active = Some(window);

                self.webhook
                    .emit(&WebhookEvent::DepegStart {
                        risk_id: risk_id.clone(),
                        timestamp: start,
                        r_bps: sample.r_bps,
                        snapshot_id,
                    })
                    .await;
                info!(risk_id = %risk_id, r_bps = sample.r_bps, "depeg window opened");
            }
            Some(Transition::End { end, .. }) => {
                let Some(mut window) = self.active.take() else {
                    return;
                };
                window.max_loss_bps = window.max_loss_bps.max(sample.loss_quote_bps);

                let snapshot_id = self.store_evidence(
                    &window.risk_id,
                    sample,
                    SnapshotLabel::DepegEnd,
                    format!("depeg window closed at block {}", sample.block_number),
                );
                self.persist_window(&window, RiskState::Resolved, Some(end), sample);

                self.webhook
                    .emit(&WebhookEvent::DepegEnd {
                        risk_id: window.risk_id.clone(),
                        timestamp: end,
                        severity_bps: window.max_loss_bps,
                        snapshot_id,
                    })
                    .await;
                info!(
                    risk_id = %window.risk_id,
                    duration = end - window.start,
                    severity_bps = window.max_loss_bps,
                    "depeg window closed"
                );
            }
            None => {}
        }
    }

    /// Append a correlated external event (liquidation) to the open
    /// window's evidence trail. No-op when no window is active, since
    /// correlation never drives state transitions.
    pub async fn record_liquidation(&self, sample: &PoolSample, transaction_hash: &str) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let snapshot_id = self.store_evidence(
            &active.risk_id,
            sample,
            SnapshotLabel::DepegLiq,
            format!("liquidation {transaction_hash} observed during depeg window"),
        );
        self.webhook
            .emit(&WebhookEvent::DepegLiq {
                risk_id: active.risk_id.clone(),
                timestamp: sample.timestamp,
                transaction_hash: transaction_hash.to_string(),
                snapshot_id,
            })
            .await;
        info!(risk_id = %active.risk_id, tx = %transaction_hash, "liquidation correlated");
    }
}

/// Long-lived polling loop for one liquidity pool.
pub struct PoolMonitor {
    pool_id: String,
    chain_id: u64,
    poll_interval: Duration,
    probe_amount: f64,
    reader: PoolReader,
    oracle: PriceOracle,
    tracker: WindowTracker,
}

impl PoolMonitor {
    pub fn new(
        config: &Config,
        reader: PoolReader,
        oracle: PriceOracle,
        store: EventStore,
        snapshots: Arc<SnapshotStore>,
        webhook: Arc<WebhookEmitter>,
    ) -> Self {
        let detector =
            HysteresisDetector::new(config.r_min_bps, config.grace_period_secs, Guard::Min);
        let tracker = WindowTracker::new(
            config.pool_id.clone(),
            config.chain_id,
            "DEPEG_LP".to_string(),
            detector,
            store,
            snapshots,
            webhook,
        );
        Self {
            pool_id: config.pool_id.clone(),
            chain_id: config.chain_id,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            probe_amount: config.probe_amount,
            reader,
            oracle,
            tracker,
        }
    }

    /// Take one full observation of the pool at the latest block.
    pub async fn fetch_sample(&self) -> Result<PoolSample> {
        let (block_number, timestamp) = self
            .rpc_block()
            .await
            .map_err(|e| GuardError::ChainRead(format!("block lookup: {e}")))?;
        let at = BlockRef::Number(block_number);

        let (coin0, coin1) = self.reader.coin_addresses().await?;
        let (dec0, dec1) = tokio::join!(
            self.reader.token_decimals(&coin0),
            self.reader.token_decimals(&coin1)
        );

        let ((raw_base, raw_quote), total_supply_raw) =
            tokio::try_join!(self.reader.balances(at), self.reader.total_supply(at))?;

        let reserve_base = format_units(raw_base, dec0);
        let reserve_quote = format_units(raw_quote, dec1);
        let total_supply = format_units(total_supply_raw, dec0);

        // Implied exchange rate: one base unit swapped into quote.
        let price = match self.reader.quote_swap(0, 1, parse_units(1.0, dec0), at).await {
            Some(out) => format_units(out, dec1),
            None => 1.0,
        };

        // Severity probe: quote -> base round trip against the
        // configured reference amount; a missing quote means severity
        // is unknown this tick, not an error.
        let probe_in = parse_units(self.probe_amount, dec1);
        let loss_quote_bps = match self.reader.quote_swap(1, 0, probe_in, at).await {
            Some(out) => {
                let amount_in = format_units(probe_in, dec1);
                let amount_out = format_units(out, dec0);
                if amount_in > 0.0 {
                    (((amount_in - amount_out) / amount_in * BPS_SCALE).round() as i64).max(0)
                } else {
                    0
                }
            }
            None => 0,
        };

        let total = reserve_base + reserve_quote;
        let r_bps = if total > 0.0 {
            ((reserve_base / total) * BPS_SCALE).round() as i64
        } else {
            0
        };

        self.oracle.record_pool_price(timestamp, price);
        let twap = self.oracle.resolve_twap().await?;
        let twap_bps = (twap.price * BPS_SCALE).round() as i64;

        Ok(PoolSample {
            pool_id: self.pool_id.clone(),
            chain_id: self.chain_id,
            timestamp,
            block_number,
            reserve_base,
            reserve_quote,
            total_supply,
            price,
            r_bps,
            loss_quote_bps,
            twap_bps,
        })
    }

    async fn rpc_block(&self) -> anyhow::Result<(u64, i64)> {
        let rpc = self.reader.rpc_handle();
        let number = rpc.block_number().await?;
        let timestamp = rpc.block_timestamp(number).await?;
        Ok((number, timestamp))
    }

    pub async fn tick(&mut self) {
        match self.fetch_sample().await {
            Ok(sample) => {
                let value = sample.r_bps;
                self.tracker.apply(&sample, value).await;
            }
            Err(GuardError::NoOracleAvailable) => {
                warn!(pool = %self.pool_id, "no oracle available, sample skipped");
            }
            Err(e) => {
                warn!(pool = %self.pool_id, error = %e, "sample tick failed, retrying next tick");
            }
        }
    }

    /// Run until shutdown is signalled; an in-flight tick finishes
    /// before the loop stops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        info!(pool = %self.pool_id, "pool monitor started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!(pool = %self.pool_id, "pool monitor stopping");
                    break;
                }
            }
        }
    }
}

/// Current wall-clock seconds; the lending monitor samples on its own
/// schedule rather than per block.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(ts: i64, r_bps: i64, loss_bps: i64) -> PoolSample {
        PoolSample {
            pool_id: "curve-pool".to_string(),
            chain_id: 1,
            timestamp: ts,
            block_number: 1_000 + ts as u64,
            reserve_base: 900_000.0,
            reserve_quote: 1_000_000.0,
            total_supply: 1_890_000.0,
            price: 0.996,
            r_bps,
            loss_quote_bps: loss_bps,
            twap_bps: 9_950,
        }
    }

    fn tracker(store: EventStore, dir: &std::path::Path, grace: u64) -> WindowTracker {
        WindowTracker::new(
            "curve-pool".to_string(),
            1,
            "DEPEG_LP".to_string(),
            HysteresisDetector::new(9_500, grace, Guard::Min),
            store,
            Arc::new(SnapshotStore::new(dir).unwrap()),
            Arc::new(WebhookEmitter::disabled()),
        )
    }

    #[tokio::test]
    async fn test_window_lifecycle_with_severity_ratchet() {
        let dir = tempdir().unwrap();
        let store = EventStore::open_memory().unwrap();
        let mut tracker = tracker(store.clone(), dir.path(), 600);

        // breach building, then crossing the grace period
        tracker.apply(&sample(1_000, 9_300, 80), 9_300).await;
        tracker.apply(&sample(1_300, 9_250, 60), 9_250).await;
        tracker.apply(&sample(1_600, 9_200, 150), 9_200).await;
        assert_eq!(tracker.active_risk_id(), Some("curve-pool|1000"));

        let open = store.latest_risk("curve-pool|1000").unwrap().unwrap();
        assert_eq!(open.state, RiskState::Open);
        assert_eq!(open.window_start, 1_000);
        assert_eq!(open.severity_bps, 150);

        // severity never decreases while open, even on a milder sample
        tracker.apply(&sample(1_900, 9_260, 40), 9_260).await;
        let ratcheted = store.latest_risk("curve-pool|1000").unwrap().unwrap();
        assert_eq!(ratcheted.severity_bps, 150);
        assert!(ratcheted.version > open.version);

        // recovery resolves the window
        tracker.apply(&sample(2_200, 9_700, 0), 9_700).await;
        let resolved = store.latest_risk("curve-pool|1000").unwrap().unwrap();
        assert_eq!(resolved.state, RiskState::Resolved);
        assert_eq!(resolved.window_end, Some(2_200));
        assert_eq!(resolved.severity_bps, 150);
        assert!(tracker.active_risk_id().is_none());

        let snapshots = store.snapshots_for("curve-pool|1000").unwrap();
        let labels: Vec<&str> = snapshots.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["DEPEG_START", "DEPEG_END"]);
        assert!(snapshots.iter().all(|s| s.content_id.starts_with("bafy")));
    }

    #[tokio::test]
    async fn test_short_dip_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let store = EventStore::open_memory().unwrap();
        let mut tracker = tracker(store.clone(), dir.path(), 600);

        tracker.apply(&sample(1_000, 9_300, 50), 9_300).await;
        tracker.apply(&sample(1_300, 9_600, 0), 9_600).await;
        assert!(tracker.active_risk_id().is_none());
        assert!(store.latest_risk("curve-pool|1000").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_samples_are_dropped() {
        let dir = tempdir().unwrap();
        let store = EventStore::open_memory().unwrap();
        let mut tracker = tracker(store.clone(), dir.path(), 0);

        tracker.apply(&sample(2_000, 9_300, 50), 9_300).await;
        assert!(tracker.active_risk_id().is_some());
        // stale tick must not reach the detector or the store
        tracker.apply(&sample(1_500, 9_900, 0), 9_900).await;
        assert!(tracker.active_risk_id().is_some());
        let metrics = store.window_metrics("curve-pool", 0, 3_000).unwrap();
        assert_eq!(metrics.samples, 1);
    }

    #[tokio::test]
    async fn test_liquidation_evidence_only_while_active() {
        let dir = tempdir().unwrap();
        let store = EventStore::open_memory().unwrap();
        let mut tracker = tracker(store.clone(), dir.path(), 0);

        // inactive: correlation is a no-op
        tracker.record_liquidation(&sample(900, 9_900, 0), "0xaaa").await;

        tracker.apply(&sample(1_000, 9_300, 100), 9_300).await;
        tracker.record_liquidation(&sample(1_050, 9_300, 100), "0xbbb").await;

        let snapshots = store.snapshots_for("curve-pool|1000").unwrap();
        let liq: Vec<_> = snapshots.iter().filter(|s| s.label == "DEPEG_LIQ").collect();
        assert_eq!(liq.len(), 1);
        assert!(liq[0].note.as_deref().unwrap().contains("0xbbb"));
    }
}
