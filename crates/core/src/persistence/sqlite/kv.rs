//! Versioned key-value primitives over the `kv` table.
//!
//! Every row carries a version and a physical expiry. Rows past their expiry
//! are invisible to reads and treated as absent by version checks. Writes go
//! through [`AtomicWrite`]: a set of version checks plus mutations committed
//! in one immediate transaction, and only if every check still holds.

use super::connection::KvDb;
use crate::Error;
use tokio_rusqlite::rusqlite::{self, TransactionBehavior};
use tokio_rusqlite::params;

/// A live row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub version: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
enum Mutation {
    Set { key: String, value: Vec<u8>, expires_at: i64 },
    Delete { key: String },
}

/// Checks and mutations applied all-or-nothing by [`KvDb::commit`].
#[derive(Debug, Clone, Default)]
pub struct AtomicWrite {
    checks: Vec<(String, Option<i64>)>,
    mutations: Vec<Mutation>,
}

impl AtomicWrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to be at `version` (`None`: absent or expired).
    pub fn check(mut self, key: &str, version: Option<i64>) -> Self {
        self.checks.push((key.to_string(), version));
        self
    }

    pub fn set(mut self, key: &str, value: Vec<u8>, expires_at: i64) -> Self {
        self.mutations.push(Mutation::Set { key: key.to_string(), value, expires_at });
        self
    }

    pub fn delete(mut self, key: &str) -> Self {
        self.mutations.push(Mutation::Delete { key: key.to_string() });
        self
    }
}

impl KvDb {
    /// Read a live row.
    pub async fn get(&self, key: &str, now: i64) -> Result<Option<KvEntry>, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<KvEntry>, Error> {
                let mut stmt = conn.prepare("SELECT value, version, expires_at FROM kv WHERE key = ?1 AND expires_at > ?2")?;

                let result = stmt.query_row(params![key, now], |row| {
                    Ok(KvEntry { value: row.get(0)?, version: row.get(1)?, expires_at: row.get(2)? })
                });

                match result {
                    Ok(entry) => Ok(Some(entry)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Commit `write` if all its checks pass.
    ///
    /// Returns the new version stamped on every written row, or `None` when a
    /// check failed and nothing was written.
    pub async fn commit(&self, write: AtomicWrite, now: i64) -> Result<Option<i64>, Error> {
        self.conn
            .call(move |conn| -> Result<Option<i64>, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                for (key, expected) in &write.checks {
                    let current = match tx.query_row(
                        "SELECT version FROM kv WHERE key = ?1 AND expires_at > ?2",
                        params![key, now],
                        |row| row.get::<_, i64>(0),
                    ) {
                        Ok(version) => Some(version),
                        Err(rusqlite::Error::QueryReturnedNoRows) => None,
                        Err(e) => return Err(e.into()),
                    };
                    if current != *expected {
                        return Ok(None);
                    }
                }

                tx.execute("UPDATE kv_versionstamp SET seq = seq + 1 WHERE id = 1", [])?;
                let version: i64 = tx.query_row("SELECT seq FROM kv_versionstamp WHERE id = 1", [], |row| row.get(0))?;

                for mutation in &write.mutations {
                    match mutation {
                        Mutation::Set { key, value, expires_at } => {
                            tx.execute(
                                "INSERT INTO kv (key, value, version, expires_at) VALUES (?1, ?2, ?3, ?4)
                                ON CONFLICT(key) DO UPDATE SET
                                    value = excluded.value,
                                    version = excluded.version,
                                    expires_at = excluded.expires_at",
                                params![key, value, version, expires_at],
                            )?;
                        }
                        Mutation::Delete { key } => {
                            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                        }
                    }
                }

                tx.commit()?;
                Ok(Some(version))
            })
            .await
            .map_err(Error::from)
    }

    /// Keys of live rows starting with `prefix`, in key order.
    pub async fn scan_keys(&self, prefix: &str, now: i64) -> Result<Vec<String>, Error> {
        let prefix = prefix.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT key FROM kv
                    WHERE substr(key, 1, length(?1)) = ?1 AND expires_at > ?2
                    ORDER BY key",
                )?;
                let keys = stmt
                    .query_map(params![prefix, now], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
            .map_err(Error::from)
    }

    /// Physically delete rows expired at `now`.
    ///
    /// Returns the number of deleted rows.
    pub async fn purge_expired(&self, now: i64) -> Result<u64, Error> {
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_set_and_get() {
        let db = KvDb::open_in_memory().await.unwrap();
        let version = db
            .commit(AtomicWrite::new().set("a", b"1".to_vec(), NOW + 1000), NOW)
            .await
            .unwrap()
            .unwrap();

        let entry = db.get("a", NOW).await.unwrap().unwrap();
        assert_eq!(entry.value, b"1");
        assert_eq!(entry.version, version);
        assert!(db.get("missing", NOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_rows_invisible() {
        let db = KvDb::open_in_memory().await.unwrap();
        db.commit(AtomicWrite::new().set("a", b"1".to_vec(), NOW + 10), NOW).await.unwrap();
        assert!(db.get("a", NOW + 10).await.unwrap().is_none());
        assert!(db.scan_keys("a", NOW + 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_failure_writes_nothing() {
        let db = KvDb::open_in_memory().await.unwrap();
        let v1 = db
            .commit(AtomicWrite::new().set("idx", b"[]".to_vec(), NOW + 1000), NOW)
            .await
            .unwrap()
            .unwrap();
        db.commit(AtomicWrite::new().check("idx", Some(v1)).set("idx", b"[1]".to_vec(), NOW + 1000), NOW)
            .await
            .unwrap()
            .unwrap();

        let stale = AtomicWrite::new()
            .check("idx", Some(v1))
            .set("idx", b"[2]".to_vec(), NOW + 1000)
            .set("rec", b"r".to_vec(), NOW + 1000);
        assert_eq!(db.commit(stale, NOW).await.unwrap(), None);
        assert_eq!(db.get("idx", NOW).await.unwrap().unwrap().value, b"[1]");
        assert!(db.get("rec", NOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_absent_check() {
        let db = KvDb::open_in_memory().await.unwrap();
        let create = || AtomicWrite::new().check("k", None).set("k", b"x".to_vec(), NOW + 1000);
        assert!(db.commit(create(), NOW).await.unwrap().is_some());
        assert!(db.commit(create(), NOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_prefix_and_purge() {
        let db = KvDb::open_in_memory().await.unwrap();
        let write = AtomicWrite::new()
            .set("ns:a:1", vec![], NOW + 1000)
            .set("ns:a:2", vec![], NOW + 5)
            .set("ns:b:1", vec![], NOW + 1000)
            .set("ns%:a", vec![], NOW + 1000);
        db.commit(write, NOW).await.unwrap();

        assert_eq!(db.scan_keys("ns:a:", NOW).await.unwrap(), vec!["ns:a:1", "ns:a:2"]);
        assert_eq!(db.purge_expired(NOW + 10).await.unwrap(), 1);
        assert_eq!(db.scan_keys("ns:", NOW).await.unwrap(), vec!["ns:a:1", "ns:b:1"]);

        let deleted = db.commit(AtomicWrite::new().delete("ns:a:1"), NOW).await.unwrap();
        assert!(deleted.is_some());
        assert_eq!(db.scan_keys("ns:a", NOW).await.unwrap(), Vec::<String>::new());
    }
}
