//! SQLite-backed inventory store. Simple, synchronous under a mutex; the CLI
//! isn't latency sensitive here.

use anyhow::Context;
use async_trait::async_trait;
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::debug;

use crate::{check_identity, decode, encode, Inventory, InventoryStore, StoreError, Stored};

pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS inventory (
                key     TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                ts      INTEGER NOT NULL,
                body    BLOB NOT NULL
            )",
            [],
        )
        .context("creating inventory table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// `~/.keel/inventory.db`, or the current directory when HOME is unset.
pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("inventory.db");
        return p.to_string_lossy().to_string();
    }
    "inventory.db".to_string()
}

fn current_version(db: &rusqlite::Connection, key: &str) -> Result<Option<i64>, StoreError> {
    let v = db
        .query_row("SELECT version FROM inventory WHERE key = ?1", [key], |r| r.get::<_, i64>(0))
        .optional()
        .context("reading inventory version")?;
    Ok(v)
}

fn parse_version(key: &str, v: &str) -> Result<i64, StoreError> {
    v.parse::<i64>().map_err(|_| StoreError::Conflict {
        key: key.to_string(),
        expected: Some(v.to_string()),
        found: None,
    })
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let row = db
            .query_row("SELECT version, body FROM inventory WHERE key = ?1", [key], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
            })
            .optional()
            .context("reading inventory row")?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        match row {
            None => Ok(None),
            Some((v, body)) => Ok(Some(Stored { inventory: decode(key, &body)?, version: v.to_string() })),
        }
    }

    async fn write(&self, inv: &Inventory, expected: Option<&str>) -> Result<String, StoreError> {
        let started = std::time::Instant::now();
        let key = inv.key();
        let body = encode(inv)?;
        let mut db = self.conn();
        let tx = db.transaction().context("opening transaction")?;
        let found = current_version(&tx, &key)?;
        let next = match (expected, found) {
            (None, None) => {
                tx.execute(
                    "INSERT INTO inventory(key, version, ts, body) VALUES (?1, 1, ?2, ?3)",
                    (&key, crate::now_ts(), &body),
                )
                .context("inserting inventory")?;
                1
            }
            (Some(exp), Some(cur)) if parse_version(&key, exp)? == cur => {
                let old: Vec<u8> = tx
                    .query_row("SELECT body FROM inventory WHERE key = ?1", [&key], |r| r.get(0))
                    .context("reading stored inventory")?;
                check_identity(&decode(&key, &old)?, inv)?;
                let n = tx
                    .execute(
                        "UPDATE inventory SET version = version + 1, ts = ?2, body = ?3 WHERE key = ?1 AND version = ?4",
                        (&key, crate::now_ts(), &body, cur),
                    )
                    .context("updating inventory")?;
                if n == 0 {
                    return Err(StoreError::Conflict { key, expected: Some(exp.to_string()), found: Some(cur.to_string()) });
                }
                cur + 1
            }
            (exp, cur) => {
                counter!("persist_conflict_total", 1u64);
                return Err(StoreError::Conflict {
                    key,
                    expected: exp.map(str::to_string),
                    found: cur.map(|v| v.to_string()),
                });
            }
        };
        tx.commit().context("committing inventory")?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(key = %key, version = next, entries = inv.entries.len(), "inventory written");
        Ok(next.to_string())
    }

    async fn remove(&self, key: &str, expected: Option<&str>) -> Result<(), StoreError> {
        let db = self.conn();
        match expected {
            None => {
                db.execute("DELETE FROM inventory WHERE key = ?1", [key]).context("deleting inventory")?;
            }
            Some(exp) => {
                let v = parse_version(key, exp)?;
                let n = db
                    .execute("DELETE FROM inventory WHERE key = ?1 AND version = ?2", (key, v))
                    .context("deleting inventory")?;
                if n == 0 {
                    let found = current_version(&db, key)?;
                    return Err(StoreError::Conflict {
                        key: key.to_string(),
                        expected: Some(exp.to_string()),
                        found: found.map(|v| v.to_string()),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{InventoryEntry, ReleaseIdentity};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn entry(name: &str) -> InventoryEntry {
        InventoryEntry {
            group: "apps".into(),
            kind: "Deployment".into(),
            namespace: "prod".into(),
            name: name.into(),
            component: "web".into(),
            version: "v1".into(),
        }
    }

    #[tokio::test]
    async fn create_update_conflict_remove() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        let mut inv = Inventory::new(ReleaseIdentity::derive("shop", "prod", "m"));
        inv.record(vec![entry("a")], 1, 10);
        assert!(s.load(&inv.key()).await.unwrap().is_none());

        let v1 = s.write(&inv, None).await.unwrap();
        assert_eq!(v1, "1");
        inv.record(vec![entry("a"), entry("b")], 2, 10);
        let v2 = s.write(&inv, Some(&v1)).await.unwrap();
        assert_eq!(v2, "2");

        // A writer still holding v1 loses.
        match s.write(&inv, Some(&v1)).await {
            Err(StoreError::Conflict { expected, found, .. }) => {
                assert_eq!(expected.as_deref(), Some("1"));
                assert_eq!(found.as_deref(), Some("2"));
            }
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }

        let loaded = s.load(&inv.key()).await.unwrap().unwrap();
        assert_eq!(loaded.inventory.history.len(), 2);
        assert_eq!(loaded.inventory.entries.len(), 2);

        assert!(s.remove(&inv.key(), Some("1")).await.is_err());
        s.remove(&inv.key(), Some(&v2)).await.unwrap();
        assert!(s.load(&inv.key()).await.unwrap().is_none());
    }
}
