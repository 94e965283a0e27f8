//! SQLite implementation of [`CacheStore`].
//!
//! A single `cache_entries` table holds records for every cache sharing the
//! database; keys are namespaced by cache name. An index on `expires_at`
//! keeps expiry sweeps cheap.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::store::{CacheRecord, CacheStore};
use crate::{Error, Result};

/// Current schema version. Increment when making breaking changes.
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed cache store.
///
/// Thread-safe: the connection is protected by a mutex.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("cannot create {}: {e}", parent.display())))?;
        }

        tracing::info!("Opening cache store at {}", path.display());
        let conn = Connection::open(path)?;

        // WAL keeps readers from blocking the background writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT key, value, expires_at, stored_at, access_at
                 FROM cache_entries WHERE key = ?1",
                [key],
                |row| {
                    Ok(CacheRecord {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        expires_at: row.get(2)?,
                        stored_at: row.get(3)?,
                        access_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &CacheRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cache_entries (key, value, expires_at, stored_at, access_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                stored_at = excluded.stored_at,
                access_at = excluded.access_at",
            params![
                record.key,
                record.value,
                record.expires_at,
                record.stored_at,
                record.access_at
            ],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cache_entries WHERE key = ?1", [key])?;
        Ok(())
    }

    fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0usize;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM cache_entries WHERE key = ?1")?;
            for key in keys {
                deleted += stmt.execute([key])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn touch(&self, updates: &[(String, i64)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("UPDATE cache_entries SET access_at = ?2 WHERE key = ?1")?;
            for (key, access_at) in updates {
                stmt.execute(params![key, access_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_expired(&self, before: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", [before])?;
        Ok(deleted)
    }
}

/// Initialize the database schema.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    if version.is_none() {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                stored_at INTEGER NOT NULL,
                access_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
                ON cache_entries (expires_at);
            "#,
        )?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(key: &str, expires_at: i64) -> CacheRecord {
        CacheRecord {
            key: key.to_string(),
            value: "\"v\"".to_string(),
            expires_at,
            stored_at: 1,
            access_at: 1,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.put(&record("p:a", 100)).unwrap();

        let got = store.get("p:a").unwrap().unwrap();
        assert_eq!(got.expires_at, 100);

        store.delete("p:a").unwrap();
        assert!(store.get("p:a").unwrap().is_none());
        // Deleting again is fine
        store.delete("p:a").unwrap();
    }

    #[test]
    fn test_put_replaces() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.put(&record("p:a", 100)).unwrap();
        store.put(&record("p:a", 200)).unwrap();
        assert_eq!(store.get("p:a").unwrap().unwrap().expires_at, 200);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_touch_updates_access_only() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        store.put(&record("p:a", 100)).unwrap();
        store
            .touch(&[("p:a".to_string(), 42), ("p:missing".to_string(), 7)])
            .unwrap();

        let got = store.get("p:a").unwrap().unwrap();
        assert_eq!(got.access_at, 42);
        assert_eq!(got.stored_at, 1);
        assert!(store.get("p:missing").unwrap().is_none());
    }

    #[test]
    fn test_delete_many_and_expired() {
        let store = SqliteCacheStore::open_in_memory().unwrap();
        for (i, key) in ["p:a", "p:b", "p:c", "p:d"].iter().enumerate() {
            store.put(&record(key, (i as i64 + 1) * 10)).unwrap();
        }

        let deleted = store
            .delete_many(&["p:a".to_string(), "p:zzz".to_string()])
            .unwrap();
        assert_eq!(deleted, 1);

        // p:b expires at 20, p:c at 30
        assert_eq!(store.delete_expired(30).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.get("p:d").unwrap().is_some());
    }

    #[test]
    fn test_reopen_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.db");
        {
            let store = SqliteCacheStore::open(&path).unwrap();
            store.put(&record("p:a", 100)).unwrap();
        }
        let store = SqliteCacheStore::open(&path).unwrap();
        assert!(store.get("p:a").unwrap().is_some());
    }
}
