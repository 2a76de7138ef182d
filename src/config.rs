//! Environment-driven configuration.
//!
//! Required values fail fast at startup; optional integrations (signer
//! key, webhook delivery, external oracles, lending-market monitor) are
//! carried as `Option` and simply disable their feature when unset.

use std::env;

use crate::errors::{GuardError, Result};

fn read_string(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn require_string(name: &str) -> Result<String> {
    read_string(name).ok_or_else(|| GuardError::Configuration(format!("{name} not set")))
}

fn read_u64(name: &str, default: u64) -> u64 {
    read_string(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn read_i64(name: &str, default: i64) -> i64 {
    read_string(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn read_f64(name: &str, default: f64) -> f64 {
    read_string(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Lending-market (collateral depeg + liquidation correlation) monitor.
#[derive(Debug, Clone)]
pub struct LendingConfig {
    /// Lending pool contract emitting liquidation events.
    pub pool_address: String,
    /// Collateral asset being watched for depeg.
    pub collateral_asset: String,
    /// Chainlink aggregator for the collateral price.
    pub price_feed_address: Option<String>,
    /// Market identifier used for risk ids, e.g. "aave-pyusd".
    pub market_id: String,
    /// Deviation ceiling in bps; above this the price is breaching.
    pub deviation_max_bps: i64,
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub rpc_timeout_secs: u64,
    pub chain_id: u64,

    pub pool_address: String,
    pub pool_id: String,
    pub poll_interval_ms: u64,

    /// Minimum acceptable reserve ratio in bps (unsafe side is below).
    pub r_min_bps: i64,
    pub grace_period_secs: u64,
    /// Reference quote-token amount for the severity probe swap.
    pub probe_amount: f64,
    /// Fallback when a token's `decimals()` cannot be read.
    pub default_token_decimals: u8,
    /// Statically configured coin pair, used when on-chain resolution fails.
    pub fallback_coins: Option<(String, String)>,

    pub twap_horizon_secs: u64,
    pub twap_ring_capacity: usize,
    pub uni_v3_pool: Option<String>,
    pub chainlink_aggregator: Option<String>,
    pub pyth_endpoint: String,
    pub pyth_feed_id: Option<String>,
    pub pyth_max_age_secs: u64,

    pub db_path: String,
    pub snapshot_dir: String,

    pub signer_private_key: Option<String>,
    pub payout_verifier: Option<String>,

    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,

    pub lending: Option<LendingConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let lending = read_string("LENDING_POOL_ADDRESS").map(|pool_address| LendingConfig {
            pool_address,
            collateral_asset: read_string("LENDING_COLLATERAL_ASSET").unwrap_or_default(),
            price_feed_address: read_string("LENDING_PRICE_FEED_ADDRESS"),
            market_id: read_string("LENDING_MARKET_ID").unwrap_or_else(|| "aave-collateral".to_string()),
            deviation_max_bps: read_i64("LENDING_DEVIATION_MAX_BPS", 200),
            grace_period_secs: read_u64("LENDING_GRACE_PERIOD_SECONDS", 0),
            poll_interval_ms: read_u64("LENDING_POLL_INTERVAL_MS", 10_000),
        });

        let fallback_coins = match (read_string("POOL_COIN0_ADDRESS"), read_string("POOL_COIN1_ADDRESS")) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        };

        Ok(Self {
            rpc_url: require_string("RPC_URL")?,
            rpc_timeout_secs: read_u64("RPC_TIMEOUT_SECONDS", 10),
            chain_id: read_u64("CHAIN_ID", 1),

            pool_address: require_string("POOL_ADDRESS")?,
            pool_id: read_string("POOL_ID").unwrap_or_else(|| "curve-pool".to_string()),
            poll_interval_ms: read_u64("POLL_INTERVAL_MS", 10_000),

            r_min_bps: read_i64("R_MIN_BPS", 9_500),
            grace_period_secs: read_u64("GRACE_PERIOD_SECONDS", 600),
            probe_amount: read_f64("PROBE_AMOUNT", 10_000.0),
            default_token_decimals: read_u64("DEFAULT_TOKEN_DECIMALS", 18) as u8,
            fallback_coins,

            twap_horizon_secs: read_u64("TWAP_HORIZON_SECONDS", 1_800),
            twap_ring_capacity: read_u64("TWAP_RING_CAPACITY", 1_080) as usize,
            uni_v3_pool: read_string("UNI_V3_POOL_ADDRESS"),
            chainlink_aggregator: read_string("CHAINLINK_AGGREGATOR_ADDRESS"),
            pyth_endpoint: read_string("PYTH_HERMES_ENDPOINT")
                .unwrap_or_else(|| "https://hermes.pyth.network".to_string()),
            pyth_feed_id: read_string("PYTH_PRICE_FEED_ID"),
            pyth_max_age_secs: read_u64("PYTH_MAX_AGE_SECONDS", 60),

            db_path: read_string("DB_PATH").unwrap_or_else(|| "liquidityguard.db".to_string()),
            snapshot_dir: read_string("SNAPSHOT_DIR").unwrap_or_else(|| "data/snapshots".to_string()),

            signer_private_key: read_string("SIGNER_PRIVATE_KEY"),
            payout_verifier: read_string("PAYOUT_VERIFIER_ADDRESS"),

            webhook_url: read_string("WEBHOOK_URL"),
            webhook_secret: read_string("WEBHOOK_SECRET"),

            lending,
        })
    }
}
