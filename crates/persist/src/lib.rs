//! Keel persistence: per-release inventory records with bounded change history.
//! Every store is optimistic: `load` hands out a version token and `write`
//! only succeeds against the token it was given.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use keel_core::{InventoryEntry, ReleaseIdentity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod sqlite;

pub use sqlite::{default_db_path, SqliteStore};

pub const DEFAULT_HISTORY: usize = 10;

/// One change record: what the release owned after a successful apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub digest: String,
    /// Seconds since epoch.
    pub ts: i64,
    pub entries: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    /// Write-once.
    pub release: ReleaseIdentity,
    pub entries: Vec<InventoryEntry>,
    /// Newest first.
    #[serde(default)]
    pub history: VecDeque<ChangeRecord>,
}

impl Inventory {
    pub fn new(release: ReleaseIdentity) -> Self {
        Self { release, entries: Vec::new(), history: VecDeque::new() }
    }

    pub fn key(&self) -> String {
        self.release.key()
    }

    /// Replace the current entry set and push a change record, keeping at
    /// most `limit` records. An unchanged set only refreshes the newest
    /// record's timestamp.
    pub fn record(&mut self, mut entries: Vec<InventoryEntry>, ts: i64, limit: usize) {
        entries.sort();
        entries.dedup();
        let digest = digest(&entries);
        match self.history.front_mut() {
            Some(head) if head.digest == digest => head.ts = ts,
            _ => self.history.push_front(ChangeRecord { digest, ts, entries: entries.clone() }),
        }
        self.history.truncate(limit.max(1));
        self.entries = entries;
    }

    pub fn digest(&self) -> String {
        digest(&self.entries)
    }
}

/// sha256 over the canonical (sorted) entry list.
pub fn digest(entries: &[InventoryEntry]) -> String {
    let mut sorted: Vec<&InventoryEntry> = entries.iter().collect();
    sorted.sort();
    let mut h = Sha256::new();
    for e in sorted {
        h.update(e.group.as_bytes());
        h.update([0u8]);
        h.update(e.kind.as_bytes());
        h.update([0u8]);
        h.update(e.namespace.as_bytes());
        h.update([0u8]);
        h.update(e.name.as_bytes());
        h.update([0u8]);
        h.update(e.component.as_bytes());
        h.update([b'\n']);
    }
    format!("sha256:{}", hex::encode(h.finalize()))
}

/// A loaded inventory together with the version token to write against.
#[derive(Debug, Clone)]
pub struct Stored {
    pub inventory: Inventory,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Someone else wrote this release since we loaded it. Retryable.
    #[error("inventory for {key} was modified concurrently (expected version {expected:?}, found {found:?}); retry")]
    Conflict { key: String, expected: Option<String>, found: Option<String> },
    #[error("inventory for {key} belongs to release {stored}, refusing to overwrite with {given}")]
    IdentityChanged { key: String, stored: String, given: String },
    #[error("decoding inventory for {key}: {source}")]
    Codec { key: String, source: serde_json::Error },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Stored>, StoreError>;

    /// Write `inv`. `expected` is the token from `load`, or `None` to create.
    /// Returns the new version token.
    async fn write(&self, inv: &Inventory, expected: Option<&str>) -> Result<String, StoreError>;

    async fn remove(&self, key: &str, expected: Option<&str>) -> Result<(), StoreError>;
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn encode(inv: &Inventory) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(inv).map_err(|source| StoreError::Codec { key: inv.key(), source })?;
    Ok(maybe_compress(&json))
}

pub fn decode(key: &str, blob: &[u8]) -> Result<Inventory, StoreError> {
    let raw = maybe_decompress(blob);
    serde_json::from_slice(&raw).map_err(|source| StoreError::Codec { key: key.to_string(), source })
}

pub fn maybe_compress(raw: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(z) = zstd::encode_all(raw, 3) {
            return z;
        }
    }
    raw.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

/// Write-once identity check shared by every store.
pub fn check_identity(stored: &Inventory, given: &Inventory) -> Result<(), StoreError> {
    if stored.release != given.release {
        return Err(StoreError::IdentityChanged {
            key: given.key(),
            stored: stored.release.uuid.to_string(),
            given: given.release.uuid.to_string(),
        });
    }
    Ok(())
}

/// In-process store. Versions are a per-key counter.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, (u64, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, Vec<u8>)>> {
        // A poisoned map is still consistent: every mutation is a single insert/remove.
        self.rows.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        let rows = self.rows();
        match rows.get(key) {
            None => Ok(None),
            Some((v, blob)) => Ok(Some(Stored { inventory: decode(key, blob)?, version: v.to_string() })),
        }
    }

    async fn write(&self, inv: &Inventory, expected: Option<&str>) -> Result<String, StoreError> {
        let key = inv.key();
        let blob = encode(inv)?;
        let mut rows = self.rows();
        let current = rows.get(&key).map(|(v, _)| v.to_string());
        if current.as_deref() != expected {
            return Err(StoreError::Conflict { key, expected: expected.map(str::to_string), found: current });
        }
        if let Some((_, old)) = rows.get(&key) {
            check_identity(&decode(&key, old)?, inv)?;
        }
        let next = rows.get(&key).map(|(v, _)| v + 1).unwrap_or(1);
        rows.insert(key, (next, blob));
        Ok(next.to_string())
    }

    async fn remove(&self, key: &str, expected: Option<&str>) -> Result<(), StoreError> {
        let mut rows = self.rows();
        let current = rows.get(key).map(|(v, _)| v.to_string());
        if expected.is_some() && current.as_deref() != expected {
            return Err(StoreError::Conflict { key: key.to_string(), expected: expected.map(str::to_string), found: current });
        }
        rows.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, component: &str) -> InventoryEntry {
        InventoryEntry {
            group: "".into(),
            kind: "ConfigMap".into(),
            namespace: "prod".into(),
            name: name.into(),
            component: component.into(),
            version: "v1".into(),
        }
    }

    fn inv() -> Inventory {
        Inventory::new(ReleaseIdentity::derive("shop", "prod", "m"))
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let mut i = inv();
        for n in 0..5 {
            i.record(vec![entry(&format!("c{}", n), "web")], n, 3);
        }
        assert_eq!(i.history.len(), 3);
        assert_eq!(i.history[0].ts, 4);
        assert_eq!(i.history[2].ts, 2);
        assert_eq!(i.entries, vec![entry("c4", "web")]);
    }

    #[test]
    fn unchanged_set_refreshes_timestamp_only() {
        let mut i = inv();
        i.record(vec![entry("a", "web"), entry("b", "web")], 1, 10);
        i.record(vec![entry("b", "web"), entry("a", "web")], 2, 10);
        assert_eq!(i.history.len(), 1);
        assert_eq!(i.history[0].ts, 2);
    }

    #[test]
    fn digest_depends_on_component_not_order() {
        let a = digest(&[entry("a", "web"), entry("b", "web")]);
        let b = digest(&[entry("b", "web"), entry("a", "web")]);
        let c = digest(&[entry("a", "frontend"), entry("b", "web")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn memory_store_detects_conflicts() {
        let s = MemoryStore::new();
        let mut i = inv();
        let v1 = s.write(&i, None).await.unwrap();
        assert!(matches!(s.write(&i, None).await, Err(StoreError::Conflict { .. })));
        i.record(vec![entry("a", "web")], 1, 10);
        let v2 = s.write(&i, Some(&v1)).await.unwrap();
        let err = s.write(&i, Some(&v1)).await.unwrap_err();
        assert!(err.is_retryable());
        let loaded = s.load(&i.key()).await.unwrap().unwrap();
        assert_eq!(loaded.version, v2);
        assert_eq!(loaded.inventory, i);
    }

    #[tokio::test]
    async fn release_identity_is_write_once() {
        let s = MemoryStore::new();
        let i = inv();
        let v = s.write(&i, None).await.unwrap();
        let mut other = inv();
        other.release.module_name = "different".into();
        assert!(matches!(s.write(&other, Some(&v)).await, Err(StoreError::IdentityChanged { .. })));
    }
}
