//! Index rows: the ordered member list of one request's records.
//!
//! An index row holds a JSON list of [`IndexMember`]s. Every change to it is a
//! compare-and-swap on the row version, committed together with the record
//! rows it affects, and retried when another writer got there first.

use serde::{Deserialize, Serialize};

use super::connection::KvDb;
use super::kv::AtomicWrite;
use crate::Error;
use crate::record::Created;

/// Attempts before a contended index write gives up with [`Error::Conflict`].
pub const MAX_CAS_ATTEMPTS: usize = 32;

/// One record listed in an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMember {
    pub key: String,
    pub created: Created,
    pub expires: i64,
}

/// Snapshot of an index row.
#[derive(Debug, Clone, Default)]
pub struct Index {
    pub members: Vec<IndexMember>,
    /// Row version, `None` when the row is absent.
    pub version: Option<i64>,
    pub expires_at: i64,
}

impl Index {
    /// Members still alive at `now`, oldest first.
    pub fn live(&self, now: i64) -> Vec<IndexMember> {
        let mut members: Vec<IndexMember> = self.members.iter().filter(|m| m.expires > now).cloned().collect();
        members.sort_by_key(|m| m.created);
        members
    }
}

/// Read an index row. A row that fails to parse reads as empty but keeps its
/// version so the next write replaces it.
pub async fn load(db: &KvDb, index_key: &str, now: i64) -> Result<Index, Error> {
    let Some(entry) = db.get(index_key, now).await? else {
        return Ok(Index::default());
    };
    let members = serde_json::from_slice(&entry.value).unwrap_or_else(|e| {
        tracing::warn!(key = index_key, error = %e, "discarding unreadable index");
        Vec::new()
    });
    Ok(Index { members, version: Some(entry.version), expires_at: entry.expires_at })
}

/// Write a record row and list it in its index, atomically.
///
/// Expired members are pruned from the index on the way, and the index expiry
/// is raised so it never ends before its longest-lived member.
pub async fn insert(db: &KvDb, index_key: &str, member: IndexMember, blob: Vec<u8>, now: i64) -> Result<(), Error> {
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let index = load(db, index_key, now).await?;
        let mut members = index.live(now);
        members.push(member.clone());
        members.sort_by_key(|m| m.created);
        let expires_at = index.expires_at.max(member.expires);

        let write = AtomicWrite::new()
            .check(index_key, index.version)
            .set(&member.key, blob.clone(), member.expires)
            .set(index_key, serde_json::to_vec(&members)?, expires_at);

        if db.commit(write, now).await?.is_some() {
            return Ok(());
        }
        tracing::debug!(key = index_key, attempt, "index changed concurrently, retrying");
        tokio::task::yield_now().await;
    }
    Err(Error::Conflict(index_key.to_string()))
}

/// Remove the members selected by `select` together with their record rows.
/// The index row is deleted once no live member remains.
///
/// Returns the number of removed members that were still alive.
pub async fn remove<F>(db: &KvDb, index_key: &str, select: F, now: i64) -> Result<usize, Error>
where
    F: Fn(&IndexMember) -> bool + Sync,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let index = load(db, index_key, now).await?;
        let (removed, kept): (Vec<IndexMember>, Vec<IndexMember>) = index.members.iter().cloned().partition(|m| select(m));
        if removed.is_empty() {
            return Ok(0);
        }

        let kept: Vec<IndexMember> = kept.into_iter().filter(|m| m.expires > now).collect();
        let mut write = AtomicWrite::new().check(index_key, index.version);
        for member in &removed {
            write = write.delete(&member.key);
        }
        write = if kept.is_empty() {
            write.delete(index_key)
        } else {
            write.set(index_key, serde_json::to_vec(&kept)?, index.expires_at)
        };

        if db.commit(write, now).await?.is_some() {
            return Ok(removed.iter().filter(|m| m.expires > now).count());
        }
        tracing::debug!(key = index_key, attempt, "index changed concurrently, retrying");
        tokio::task::yield_now().await;
    }
    Err(Error::Conflict(index_key.to_string()))
}
