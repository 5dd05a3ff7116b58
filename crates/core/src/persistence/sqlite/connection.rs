//! Opening the key-value database.

use std::path::Path;
use std::time::Duration;

use tokio_rusqlite::Connection;

use super::migrations;
use crate::Error;

/// How long a writer waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings applied to every connection, as `(pragma, value)`.
const SETTINGS: &[(&str, &str)] = &[("journal_mode", "WAL"), ("synchronous", "NORMAL"), ("temp_store", "MEMORY")];

/// Handle on the `kv` database. Clones share one background connection thread.
#[derive(Clone, Debug)]
pub struct KvDb {
    pub(crate) conn: Connection,
}

impl KvDb {
    /// Open or create the database file at `path` and bring its schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).await.map_err(|e| Error::Database(e.into()))?;
        let db = Self::configure(conn).await?;
        tracing::debug!(path = %path.display(), "opened kv database");
        Ok(db)
    }

    /// Private database that disappears with its last handle.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(|e| Error::Database(e.into()))?;
        Self::configure(conn).await
    }

    async fn configure(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            let batch: String = SETTINGS.iter().map(|(name, value)| format!("PRAGMA {name}={value};")).collect();
            conn.execute_batch(&batch)
        })
        .await?;

        let version = migrations::run(&conn).await?;
        tracing::trace!(version, "kv schema ready");
        Ok(Self { conn })
    }

    /// Version of the newest applied schema migration.
    pub async fn schema_version(&self) -> Result<i64, Error> {
        migrations::schema_version(&self.conn).await
    }
}
