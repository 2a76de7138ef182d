//! Error taxonomy for the monitoring and claims pipeline.
//!
//! Infrastructure paths (storage, snapshot files, webhook delivery) use
//! `anyhow` with context; the variants here mark the boundaries callers
//! are expected to branch on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    /// Every ABI fallback variant for a chain read was exhausted.
    /// Recoverable by retrying on the next poll tick.
    #[error("chain read failed: {0}")]
    ChainRead(String),

    /// A required address or key is missing. Not retryable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// All price sources failed for this resolution call.
    /// The current sample is skipped, not the whole loop.
    #[error("no oracle source available")]
    NoOracleAvailable,

    /// Caller referenced a risk window that does not exist.
    #[error("risk not found: {0}")]
    RiskNotFound(String),

    /// An oracle reading is older than its freshness bound. Treated as
    /// source-unavailable by the oracle's fallthrough logic.
    #[error("stale oracle data: published at {published_at}, max age {max_age_secs}s")]
    StaleData {
        published_at: i64,
        max_age_secs: u64,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GuardError>;
