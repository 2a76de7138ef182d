//! Analytical event store.
//!
//! SQLite-backed, append-style: samples are immutable rows, risk windows
//! grow new version rows instead of mutating in place (readers take the
//! highest version), snapshots and claims are written once. The nonce
//! counter is the only read-modify-write key and is linearized under the
//! connection mutex.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS pool_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pool_id TEXT NOT NULL,
    chain_id INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    reserve_base REAL NOT NULL,
    reserve_quote REAL NOT NULL,
    total_supply REAL NOT NULL,
    price REAL NOT NULL,
    r_bps INTEGER NOT NULL,
    loss_quote_bps INTEGER NOT NULL,
    twap_bps INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pool_samples_ts
    ON pool_samples(pool_id, ts);

CREATE TABLE IF NOT EXISTS risk_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    risk_id TEXT NOT NULL,
    pool_id TEXT NOT NULL,
    chain_id INTEGER NOT NULL,
    risk_type TEXT NOT NULL,
    risk_state TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER,
    severity_bps INTEGER NOT NULL,
    twap_bps INTEGER NOT NULL,
    r_bps INTEGER NOT NULL,
    attested_at INTEGER NOT NULL,
    version INTEGER NOT NULL,
    UNIQUE(risk_id, version)
);

CREATE INDEX IF NOT EXISTS idx_risk_events_risk_id
    ON risk_events(risk_id, version);

CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id TEXT PRIMARY KEY,
    risk_id TEXT NOT NULL,
    content_id TEXT NOT NULL,
    label TEXT NOT NULL,
    note TEXT,
    uploaded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_risk_id
    ON snapshots(risk_id, uploaded_at);

CREATE TABLE IF NOT EXISTS claims (
    claim_id TEXT PRIMARY KEY,
    policy_id TEXT NOT NULL,
    risk_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    payout_amount TEXT NOT NULL,
    deductible_bps INTEGER NOT NULL,
    coverage_cap TEXT NOT NULL,
    nonce INTEGER NOT NULL,
    signature TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS claim_nonces (
    policy_id TEXT NOT NULL,
    risk_id TEXT NOT NULL,
    nonce INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (policy_id, risk_id)
);
"#;

/// One poll-tick observation. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSample {
    pub pool_id: String,
    pub chain_id: u64,
    pub timestamp: i64,
    pub block_number: u64,
    pub reserve_base: f64,
    pub reserve_quote: f64,
    pub total_supply: f64,
    pub price: f64,
    pub r_bps: i64,
    pub loss_quote_bps: i64,
    pub twap_bps: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskState {
    Open,
    Resolved,
}

impl RiskState {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskState::Open => "OPEN",
            RiskState::Resolved => "RESOLVED",
        }
    }

    fn from_str(value: &str) -> Self {
        match value {
            "RESOLVED" => RiskState::Resolved,
            _ => RiskState::Open,
        }
    }
}

/// Snapshot evidence labels, one case per transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLabel {
    DepegStart,
    DepegEnd,
    DepegLiq,
}

impl SnapshotLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotLabel::DepegStart => "DEPEG_START",
            SnapshotLabel::DepegEnd => "DEPEG_END",
            SnapshotLabel::DepegLiq => "DEPEG_LIQ",
        }
    }
}

/// The latest known state of one risk window (a single version row).
#[derive(Debug, Clone, Serialize)]
pub struct RiskWindow {
    pub risk_id: String,
    pub pool_id: String,
    pub chain_id: u64,
    pub risk_type: String,
    pub state: RiskState,
    pub window_start: i64,
    pub window_end: Option<i64>,
    pub severity_bps: i64,
    pub twap_bps: i64,
    pub r_bps: i64,
    pub attested_at: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub risk_id: String,
    pub content_id: String,
    pub label: String,
    pub note: Option<String>,
    pub uploaded_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimRecord {
    pub claim_id: String,
    pub policy_id: String,
    pub risk_id: String,
    pub mode: String,
    pub payout_amount: String,
    pub deductible_bps: u32,
    pub coverage_cap: String,
    pub nonce: u64,
    pub signature: String,
    pub state: String,
    pub created_at: i64,
}

/// Range aggregates over samples in a window.
#[derive(Debug, Clone, Default)]
pub struct WindowMetrics {
    pub min_r_bps: Option<i64>,
    pub max_loss_bps: Option<i64>,
    pub avg_twap_bps: Option<f64>,
    pub samples: i64,
}

pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(path = %db_path, "event store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert_sample(&self, sample: &PoolSample) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO pool_samples (
                pool_id, chain_id, ts, block_number, reserve_base,
                reserve_quote, total_supply, price, r_bps, loss_quote_bps, twap_bps
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                sample.pool_id,
                sample.chain_id as i64,
                sample.timestamp,
                sample.block_number as i64,
                sample.reserve_base,
                sample.reserve_quote,
                sample.total_supply,
                sample.price,
                sample.r_bps,
                sample.loss_quote_bps,
                sample.twap_bps,
            ],
        )?;
        Ok(())
    }

    /// Append a new version row for a risk window and return the version
    /// written. Versions are contiguous per risk id (1 = opened).
    pub fn append_risk_version(
        &self,
        risk_id: &str,
        pool_id: &str,
        chain_id: u64,
        risk_type: &str,
        state: RiskState,
        window_start: i64,
        window_end: Option<i64>,
        severity_bps: i64,
        twap_bps: i64,
        r_bps: i64,
        attested_at: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM risk_events WHERE risk_id = ?1",
            params![risk_id],
            |row| row.get(0),
        )?;
        conn.execute(
            r#"
            INSERT INTO risk_events (
                risk_id, pool_id, chain_id, risk_type, risk_state, window_start,
                window_end, severity_bps, twap_bps, r_bps, attested_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                risk_id,
                pool_id,
                chain_id as i64,
                risk_type,
                state.as_str(),
                window_start,
                window_end,
                severity_bps,
                twap_bps,
                r_bps,
                attested_at,
                version,
            ],
        )?;
        Ok(version)
    }

    /// Highest-version row for a risk id, if any.
    pub fn latest_risk(&self, risk_id: &str) -> Result<Option<RiskWindow>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT risk_id, pool_id, chain_id, risk_type, risk_state, window_start,
                   window_end, severity_bps, twap_bps, r_bps, attested_at, version
            FROM risk_events
            WHERE risk_id = ?1
            ORDER BY version DESC
            LIMIT 1
            "#,
            params![risk_id],
            |row| {
                Ok(RiskWindow {
                    risk_id: row.get(0)?,
                    pool_id: row.get(1)?,
                    chain_id: row.get::<_, i64>(2)? as u64,
                    risk_type: row.get(3)?,
                    state: RiskState::from_str(&row.get::<_, String>(4)?),
                    window_start: row.get(5)?,
                    window_end: row.get(6)?,
                    severity_bps: row.get(7)?,
                    twap_bps: row.get(8)?,
                    r_bps: row.get(9)?,
                    attested_at: row.get(10)?,
                    version: row.get(11)?,
                })
            },
        )
        .optional()
        .context("failed to read risk event")
    }

    /// min/max/avg aggregates over a pool's samples in [start, end].
    pub fn window_metrics(&self, pool_id: &str, start: i64, end: i64) -> Result<WindowMetrics> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT min(r_bps), max(loss_quote_bps), avg(twap_bps), count(*)
            FROM pool_samples
            WHERE pool_id = ?1 AND ts BETWEEN ?2 AND ?3
            "#,
            params![pool_id, start, end],
            |row| {
                Ok(WindowMetrics {
                    min_r_bps: row.get(0)?,
                    max_loss_bps: row.get(1)?,
                    avg_twap_bps: row.get(2)?,
                    samples: row.get(3)?,
                })
            },
        )
        .context("failed to aggregate window metrics")
    }

    pub fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO snapshots (snapshot_id, risk_id, content_id, label, note, uploaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.snapshot_id,
                record.risk_id,
                record.content_id,
                record.label,
                record.note,
                record.uploaded_at,
            ],
        )?;
        Ok(())
    }

    pub fn snapshots_for(&self, risk_id: &str) -> Result<Vec<SnapshotRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT snapshot_id, risk_id, content_id, label, note, uploaded_at
            FROM snapshots
            WHERE risk_id = ?1
            ORDER BY uploaded_at ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![risk_id], |row| {
                Ok(SnapshotRecord {
                    snapshot_id: row.get(0)?,
                    risk_id: row.get(1)?,
                    content_id: row.get(2)?,
                    label: row.get(3)?,
                    note: row.get(4)?,
                    uploaded_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Allocate the next nonce for (policy, risk). Strictly increasing
    /// from 1; the connection mutex makes read-increment-write atomic,
    /// so no two concurrent calls observe the same pre-increment value.
    pub fn next_nonce(&self, policy_id: &str, risk_id: &str, now: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let current: i64 = conn
            .query_row(
                "SELECT nonce FROM claim_nonces WHERE policy_id = ?1 AND risk_id = ?2",
                params![policy_id, risk_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let next = current + 1;
        conn.execute(
            r#"
            INSERT INTO claim_nonces (policy_id, risk_id, nonce, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(policy_id, risk_id) DO UPDATE SET
                nonce = excluded.nonce,
                updated_at = excluded.updated_at
            "#,
            params![policy_id, risk_id, next, now],
        )?;
        Ok(next as u64)
    }

    pub fn insert_claim(&self, record: &ClaimRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO claims (
                claim_id, policy_id, risk_id, mode, payout_amount, deductible_bps,
                coverage_cap, nonce, signature, state, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.claim_id,
                record.policy_id,
                record.risk_id,
                record.mode,
                record.payout_amount,
                record.deductible_bps,
                record.coverage_cap,
                record.nonce as i64,
                record.signature,
                record.state,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn claim_count(&self, risk_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT count(*) FROM claims WHERE risk_id = ?1",
            params![risk_id],
            |row| row.get(0),
        )
        .context("failed to count claims")
    }
}

impl Clone for EventStore {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}
