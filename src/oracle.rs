//! Reference price / TWAP resolution with ordered source fallback.
//!
//! Sources are tried in a fixed priority order; an individual source
//! failure is logged as fallthrough and never retried within one
//! resolution call (retry policy belongs to the polling loop). Only
//! when every source fails does the call error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::chain::abi;
use crate::chain::rpc::{BlockRef, RpcClient};
use crate::config::Config;
use crate::errors::{GuardError, Result};

/// Tick base of the standard concentrated-liquidity price encoding.
const TICK_BASE: f64 = 1.0001;
const CHAINLINK_ANSWER_SCALE: f64 = 1e8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
    UniV3Observe,
    ChainlinkLatest,
    PythPull,
    PoolMovingAverage,
}

impl SourceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::UniV3Observe => "uni_v3_observe",
            SourceTag::ChainlinkLatest => "chainlink_latest",
            SourceTag::PythPull => "pyth_pull",
            SourceTag::PoolMovingAverage => "pool_moving_avg",
        }
    }
}

/// A resolved reference price with its averaging window, for audit.
#[derive(Debug, Clone)]
pub struct TwapReading {
    pub price: f64,
    pub source: SourceTag,
    pub window_start: i64,
    pub window_end: i64,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn tag(&self) -> SourceTag;
    async fn read(&self, horizon_secs: u64) -> Result<TwapReading>;
}

// =============================================================================
// Local sample ring
// =============================================================================

/// Bounded ring of (timestamp, implied pool price) observations fed by
/// the polling loop. Capacity and eviction are explicit constructor
/// state, not ambient buffers.
#[derive(Debug)]
pub struct PriceRing {
    capacity: usize,
    samples: VecDeque<(i64, f64)>,
}

impl PriceRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, timestamp: i64, price: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((timestamp, price));
    }

    /// Mean price of samples no older than `horizon_secs` before `now`.
    pub fn average_within(&self, now: i64, horizon_secs: u64) -> Option<f64> {
        let cutoff = now - horizon_secs as i64;
        let mut sum = 0.0;
        let mut count = 0usize;
        for &(ts, price) in &self.samples {
            if ts >= cutoff {
                sum += price;
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// =============================================================================
// Sources
// =============================================================================

/// (a) On-chain cumulative-tick observation over the lookback horizon.
pub struct UniV3ObserveSource {
    rpc: Arc<RpcClient>,
    pool: String,
}

impl UniV3ObserveSource {
    pub fn new(rpc: Arc<RpcClient>, pool: String) -> Self {
        Self { rpc, pool }
    }
}

#[async_trait]
impl PriceSource for UniV3ObserveSource {
    fn tag(&self) -> SourceTag {
        SourceTag::UniV3Observe
    }

    async fn read(&self, horizon_secs: u64) -> Result<TwapReading> {
        // observe(uint32[]) with secondsAgos = [horizon, 0]
        let words = [
            abi::uint_word(0x20),
            abi::uint_word(2),
            abi::uint_word(horizon_secs),
            abi::uint_word(0),
        ];
        let data = abi::encode_call("observe(uint32[])", &words);
        let raw = self
            .rpc
            .call(&self.pool, &data, BlockRef::Latest)
            .await
            .map_err(|e| GuardError::ChainRead(format!("observe: {e}")))?;

        // Return layout: two dynamic-array offsets, then each array as
        // a length word followed by elements.
        let ticks_at = abi::decode_u64(&raw, 0)
            .filter(|offset| offset % 32 == 0)
            .map(|offset| (offset / 32) as usize)
            .ok_or_else(|| GuardError::ChainRead("bad observe offset".to_string()))?;
        let len = abi::decode_u64(&raw, ticks_at)
            .ok_or_else(|| GuardError::ChainRead("bad observe length".to_string()))?;
        if len < 2 {
            return Err(GuardError::ChainRead("observe returned < 2 points".to_string()));
        }
        let tick0 = abi::decode_i128(&raw, ticks_at + 1)
            .ok_or_else(|| GuardError::ChainRead("bad tick cumulative".to_string()))?;
        let tick1 = abi::decode_i128(&raw, ticks_at + 2)
            .ok_or_else(|| GuardError::ChainRead("bad tick cumulative".to_string()))?;

        let avg_tick = (tick1 - tick0) as f64 / horizon_secs as f64;
        let now = Utc::now().timestamp();
        Ok(TwapReading {
            price: TICK_BASE.powf(avg_tick),
            source: self.tag(),
            window_start: now - horizon_secs as i64,
            window_end: now,
        })
    }
}

/// (b) Push-style aggregator's latest round.
pub struct ChainlinkLatestSource {
    rpc: Arc<RpcClient>,
    aggregator: String,
}

impl ChainlinkLatestSource {
    pub fn new(rpc: Arc<RpcClient>, aggregator: String) -> Self {
        Self { rpc, aggregator }
    }
}

#[async_trait]
impl PriceSource for ChainlinkLatestSource {
    fn tag(&self) -> SourceTag {
        SourceTag::ChainlinkLatest
    }

    async fn read(&self, horizon_secs: u64) -> Result<TwapReading> {
        let data = abi::encode_call("latestRoundData()", &[]);
        let raw = self
            .rpc
            .call(&self.aggregator, &data, BlockRef::Latest)
            .await
            .map_err(|e| GuardError::ChainRead(format!("latestRoundData: {e}")))?;

        // (roundId, answer, startedAt, updatedAt, answeredInRound)
        let answer = abi::decode_i128(&raw, 1)
            .ok_or_else(|| GuardError::ChainRead("bad aggregator answer".to_string()))?;
        let updated_at = abi::decode_u64(&raw, 3)
            .ok_or_else(|| GuardError::ChainRead("bad aggregator updatedAt".to_string()))?
            as i64;

        Ok(TwapReading {
            price: answer as f64 / CHAINLINK_ANSWER_SCALE,
            source: self.tag(),
            window_start: updated_at - horizon_secs as i64,
            window_end: updated_at,
        })
    }
}

/// (c) Pull-oracle network's latest signed update via the Hermes API,
/// accepted only within the freshness bound.
pub struct PythPullSource {
    client: reqwest::Client,
    endpoint: String,
    feed_id: String,
    max_age_secs: u64,
}

#[derive(Debug, Deserialize)]
struct HermesResponse {
    parsed: Vec<HermesParsedFeed>,
}

#[derive(Debug, Deserialize)]
struct HermesParsedFeed {
    price: HermesPrice,
}

#[derive(Debug, Deserialize)]
struct HermesPrice {
    price: String,
    expo: i32,
    publish_time: i64,
}

impl PythPullSource {
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        feed_id: String,
        max_age_secs: u64,
    ) -> Self {
        Self {
            client,
            endpoint,
            feed_id,
            max_age_secs,
        }
    }
}

#[async_trait]
impl PriceSource for PythPullSource {
    fn tag(&self) -> SourceTag {
        SourceTag::PythPull
    }

    async fn read(&self, _horizon_secs: u64) -> Result<TwapReading> {
        let url = format!(
            "{}/v2/updates/price/latest?ids[]={}",
            self.endpoint.trim_end_matches('/'),
            self.feed_id
        );
        let response: HermesResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GuardError::ChainRead(format!("hermes request: {e}")))?
            .json()
            .await
            .map_err(|e| GuardError::ChainRead(format!("hermes response: {e}")))?;

        let feed = response
            .parsed
            .first()
            .ok_or_else(|| GuardError::ChainRead("hermes returned no feeds".to_string()))?;

        let now = Utc::now().timestamp();
        if now - feed.price.publish_time > self.max_age_secs as i64 {
            return Err(GuardError::StaleData {
                published_at: feed.price.publish_time,
                max_age_secs: self.max_age_secs,
            });
        }

        let mantissa: f64 = feed
            .price
            .price
            .parse()
            .map_err(|e| GuardError::ChainRead(format!("hermes price parse: {e}")))?;
        Ok(TwapReading {
            price: mantissa * 10f64.powi(feed.price.expo),
            source: self.tag(),
            window_start: feed.price.publish_time,
            window_end: feed.price.publish_time,
        })
    }
}

/// (d) Moving average of the monitored pool's own implied price.
pub struct PoolAverageSource {
    ring: Arc<RwLock<PriceRing>>,
}

impl PoolAverageSource {
    pub fn new(ring: Arc<RwLock<PriceRing>>) -> Self {
        Self { ring }
    }
}

#[async_trait]
impl PriceSource for PoolAverageSource {
    fn tag(&self) -> SourceTag {
        SourceTag::PoolMovingAverage
    }

    async fn read(&self, horizon_secs: u64) -> Result<TwapReading> {
        let now = Utc::now().timestamp();
        let average = self
            .ring
            .read()
            .average_within(now, horizon_secs)
            .ok_or_else(|| GuardError::ChainRead("no local pool samples in horizon".to_string()))?;
        Ok(TwapReading {
            price: average,
            source: self.tag(),
            window_start: now - horizon_secs as i64,
            window_end: now,
        })
    }
}

// =============================================================================
// Oracle
// =============================================================================

pub struct PriceOracle {
    sources: Vec<Box<dyn PriceSource>>,
    ring: Arc<RwLock<PriceRing>>,
    horizon_secs: u64,
}

impl PriceOracle {
    pub fn new(
        sources: Vec<Box<dyn PriceSource>>,
        ring: Arc<RwLock<PriceRing>>,
        horizon_secs: u64,
    ) -> Self {
        Self {
            sources,
            ring,
            horizon_secs,
        }
    }

    /// Assemble the source priority order from configuration. The local
    /// moving average always terminates the chain so a freshly sampled
    /// pool can resolve without any external oracle.
    pub fn from_config(config: &Config, rpc: Arc<RpcClient>) -> Result<Self> {
        let ring = Arc::new(RwLock::new(PriceRing::new(config.twap_ring_capacity)));
        let mut sources: Vec<Box<dyn PriceSource>> = Vec::new();

        if let Some(pool) = &config.uni_v3_pool {
            sources.push(Box::new(UniV3ObserveSource::new(rpc.clone(), pool.clone())));
        }
        if let Some(aggregator) = &config.chainlink_aggregator {
            sources.push(Box::new(ChainlinkLatestSource::new(
                rpc.clone(),
                aggregator.clone(),
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

        Ok(Self::new(sources, ring, config.twap_horizon_secs))
    }

    /// Feed one implied pool price into the local ring.
    pub fn record_pool_price(&self, timestamp: i64, price: f64) {
        self.ring.write().push(timestamp, price);
    }

    /// Resolve a reference price from the first source that succeeds.
    pub async fn resolve_twap(&self) -> Result<TwapReading> {
        for source in &self.sources {
            match source.read(self.horizon_secs).await {
                Ok(reading) => {
                    debug!(
                        source = reading.source.as_str(),
                        price = reading.price,
                        "price source resolved"
                    );
                    return Ok(reading);
                }
                Err(e) => {
                    warn!(source = source.tag().as_str(), error = %e, "price source unavailable, falling through");
                }
            }
        }
        Err(GuardError::NoOracleAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource(SourceTag);

    #[async_trait]
    impl PriceSource for FailingSource {
        fn tag(&self) -> SourceTag {
            self.0
        }
        async fn read(&self, _horizon_secs: u64) -> Result<TwapReading> {
            Err(GuardError::ChainRead("unreachable endpoint".to_string()))
        }
    }

    struct StaleSource;

    #[async_trait]
    impl PriceSource for StaleSource {
        fn tag(&self) -> SourceTag {
            SourceTag::PythPull
        }
        async fn read(&self, _horizon_secs: u64) -> Result<TwapReading> {
            Err(GuardError::StaleData {
                published_at: 1_000,
                max_age_secs: 60,
            })
        }
    }

    struct FixedSource(SourceTag, f64);

    #[async_trait]
    impl PriceSource for FixedSource {
        fn tag(&self) -> SourceTag {
            self.0
        }
        async fn read(&self, horizon_secs: u64) -> Result<TwapReading> {
            Ok(TwapReading {
                price: self.1,
                source: self.0,
                window_start: 100 - horizon_secs as i64,
                window_end: 100,
            })
        }
    }

    fn oracle_with(sources: Vec<Box<dyn PriceSource>>) -> PriceOracle {
        let ring = Arc::new(RwLock::new(PriceRing::new(16)));
        PriceOracle::new(sources, ring, 1_800)
    }

    #[tokio::test]
    async fn test_fallback_stops_at_first_success() {
        let oracle = oracle_with(vec![
            Box::new(FailingSource(SourceTag::UniV3Observe)),
            Box::new(FixedSource(SourceTag::ChainlinkLatest, 0.998)),
            Box::new(FixedSource(SourceTag::PoolMovingAverage, 0.5)),
        ]);
        let reading = oracle.resolve_twap().await.unwrap();
        assert_eq!(reading.source, SourceTag::ChainlinkLatest);
        assert_eq!(reading.price, 0.998);
    }

    #[tokio::test]
    async fn test_stale_source_falls_through_to_last() {
        let oracle = oracle_with(vec![
            Box::new(FailingSource(SourceTag::UniV3Observe)),
            Box::new(FailingSource(SourceTag::ChainlinkLatest)),
            Box::new(StaleSource),
            Box::new(FixedSource(SourceTag::PoolMovingAverage, 1.001)),
        ]);
        let reading = oracle.resolve_twap().await.unwrap();
        assert_eq!(reading.source, SourceTag::PoolMovingAverage);
        assert_eq!(reading.price, 1.001);
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_no_oracle() {
        let oracle = oracle_with(vec![
            Box::new(FailingSource(SourceTag::UniV3Observe)),
            Box::new(FailingSource(SourceTag::ChainlinkLatest)),
            Box::new(StaleSource),
            Box::new(FailingSource(SourceTag::PoolMovingAverage)),
        ]);
        assert!(matches!(
            oracle.resolve_twap().await,
            Err(GuardError::NoOracleAvailable)
        ));
    }

    #[tokio::test]
    async fn test_local_average_uses_recorded_samples() {
        let ring = Arc::new(RwLock::new(PriceRing::new(16)));
        let oracle = PriceOracle::new(
            vec![Box::new(PoolAverageSource::new(ring.clone()))],
            ring,
            3_600,
        );
        let now = Utc::now().timestamp();
        oracle.record_pool_price(now - 120, 0.99);
        oracle.record_pool_price(now - 60, 1.01);
        // far outside the horizon, ignored
        oracle.record_pool_price(now - 100_000, 5.0);

        let reading = oracle.resolve_twap().await.unwrap();
        assert_eq!(reading.source, SourceTag::PoolMovingAverage);
        assert!((reading.price - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ring_eviction_is_bounded() {
        let mut ring = PriceRing::new(3);
        for i in 0..10 {
            ring.push(i, i as f64);
        }
        assert_eq!(ring.len(), 3);
        // oldest entries evicted; only 7, 8, 9 remain
        assert_eq!(ring.average_within(9, 100), Some(8.0));
    }
}
