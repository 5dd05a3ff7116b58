//! Schema versioning for the key-value database.
//!
//! Each [`Migration`] is applied at most once, inside its own transaction
//! together with the row recording it in `kv_schema`, so a failing batch
//! leaves the schema at the previous version.

use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::{Connection, params};

use crate::Error;

/// One schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Schema steps in ascending version order.
pub const MIGRATIONS: &[Migration] =
    &[Migration { version: 1, name: "kv", sql: include_str!("../../../migrations/001_kv.sql") }];

const BOOKKEEPING: &str = "CREATE TABLE IF NOT EXISTS kv_schema (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

fn current_version(conn: &rusqlite::Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT MAX(version) FROM kv_schema", [], |row| row.get::<_, Option<i64>>(0))
        .optional()
        .map(|v| v.flatten().unwrap_or(0))
}

fn apply(conn: &mut rusqlite::Connection, migrations: &[Migration]) -> Result<i64, Error> {
    conn.execute_batch(BOOKKEEPING)?;
    let mut version = current_version(conn)?;

    for step in migrations.iter().filter(move |m| m.version > version) {
        let tx = conn.transaction()?;
        tx.execute_batch(step.sql)
            .map_err(|e| Error::MigrationFailed(format!("{} (v{}): {e}", step.name, step.version)))?;
        tx.execute(
            "INSERT INTO kv_schema (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![step.version, step.name, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::debug!(version = step.version, name = step.name, "applied migration");
        version = step.version;
    }
    Ok(version)
}

/// Bring the schema up to the newest [`Migration`]. Returns the resulting version.
pub async fn run(conn: &Connection) -> Result<i64, Error> {
    Ok(conn.call(|conn| apply(conn, MIGRATIONS)).await?)
}

/// Version of the newest applied migration, 0 for a fresh database.
pub async fn schema_version(conn: &Connection) -> Result<i64, Error> {
    conn.call(|conn| {
        conn.execute_batch(BOOKKEEPING)?;
        current_version(conn)
    })
    .await
    .map_err(Error::from)
}
