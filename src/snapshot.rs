//! Content-addressed snapshot store.
//!
//! Each snapshot is the full sample at a transition instant, serialized
//! as canonical JSON and stored under an identifier derived from its
//! SHA-256. Retrieval by identifier returns the exact original document.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Full sample state captured as evidence at a transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleSnapshot {
    pub timestamp: i64,
    pub block_number: u64,
    pub pool_id: String,
    pub chain_id: u64,
    pub reserve_base: f64,
    pub reserve_quote: f64,
    pub total_supply: f64,
    pub price: f64,
    pub r_bps: i64,
    pub loss_quote_bps: i64,
    pub twap_bps: i64,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, content_id: &str) -> PathBuf {
        self.dir.join(format!("{content_id}.json"))
    }

    /// Store a snapshot and return its deterministic content identifier.
    pub fn put(&self, snapshot: &SampleSnapshot) -> Result<String> {
        let content =
            serde_json::to_string_pretty(snapshot).context("failed to serialize snapshot")?;
        let digest = Sha256::digest(content.as_bytes());
        let content_id = format!("bafy{}", &hex::encode(digest)[..56]);

        let path = self.path_for(&content_id);
        fs::write(&path, &content)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;

        debug!(content_id = %content_id, block = snapshot.block_number, "snapshot stored");
        Ok(content_id)
    }

    /// Retrieve a snapshot by content identifier.
    pub fn get(&self, content_id: &str) -> Result<SampleSnapshot> {
        let path = self.path_for(content_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("snapshot {content_id} not found"))?;
        serde_json::from_str(&content).context("failed to parse stored snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot() -> SampleSnapshot {
        SampleSnapshot {
            timestamp: 1_700_000_000,
            block_number: 18_000_000,
            pool_id: "curve-pool".to_string(),
            chain_id: 1,
            reserve_base: 1_000_000.0,
            reserve_quote: 980_000.0,
            total_supply: 1_975_000.0,
            price: 0.995,
            r_bps: 5_050,
            loss_quote_bps: 120,
            twap_bps: 9_960,
        }
    }

    #[test]
    fn test_roundtrip_is_exact() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let original = snapshot();
        let cid = store.put(&original).unwrap();
        assert!(cid.starts_with("bafy"));
        assert_eq!(store.get(&cid).unwrap(), original);
    }

    #[test]
    fn test_identifier_is_deterministic() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let a = store.put(&snapshot()).unwrap();
        let b = store.put(&snapshot()).unwrap();
        assert_eq!(a, b);

        let mut changed = snapshot();
        changed.r_bps = 5_051;
        assert_ne!(store.put(&changed).unwrap(), a);
    }

    #[test]
    fn test_missing_id_is_an_error() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        assert!(store.get("bafydeadbeef").is_err());
    }
}
