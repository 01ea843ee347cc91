//! The shared backlog: the durable collection of work items that every worker
//! claims from and writes outcomes back to.
//!
//! Two implementations exist: [`Storage`](crate::storage::Storage) (an
//! embedded SQLite file shared by worker processes on one host) and
//! [`Db`](crate::db::Db) (PostgreSQL, for workers spread over several hosts).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::config::Tables;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::Storage;

#[async_trait]
pub trait Backlog: Send + Sync {
    /// Record a new artifact-observed event (the sensor's side of the contract).
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItem>;

    /// Atomically claim the oldest eligible item for `worker`.
    ///
    /// Eligible: artifact-observed, and either pending (with any retry backoff
    /// elapsed) or claimed under a lease that expired before `now`. Returns
    /// `None` when nothing is eligible. Concurrent callers never receive the
    /// same item.
    async fn claim_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<WorkItem>>;

    /// Store `hash` as the item's content hash and report whether that content
    /// was already forwarded, is in flight under another live claim, or has an
    /// analysis record, restricted to activity at or after `since`.
    ///
    /// Registration and check happen in one transaction, serialized per hash,
    /// so two items with the same content can't both come out unique.
    async fn register_hash(
        &self,
        id: WorkId,
        hash: &str,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Write an outcome for an item `worker` still holds.
    ///
    /// Fails with [`Error::LeaseLost`] when the claim is no longer ours.
    async fn record(
        &self,
        id: WorkId,
        worker: &str,
        outcome: &Outcome,
        retry_after: Option<DateTime<Utc>>,
    ) -> Result<WorkItem>;

    /// Get a work item by ID.
    async fn get(&self, id: WorkId) -> Result<WorkItem>;

    /// List items, newest first, optionally filtered by status.
    async fn list(&self, status: Option<Status>, limit: i64) -> Result<Vec<WorkItem>>;

    /// Cheap round trip to prove the backlog is reachable.
    async fn health_check(&self) -> Result<()>;
}

/// Open the backlog named by `url`, creating its tables if needed.
pub async fn open(url: &SecretString, tables: &Tables) -> Result<Arc<dyn Backlog>> {
    tables.validate()?;
    let raw = url.expose_secret();

    if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
        let db = Db::connect(raw, tables.clone()).await?;
        db.migrate().await?;
        return Ok(Arc::new(db));
    }

    let path = raw
        .strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(raw);
    if path.is_empty() {
        return Err(Error::Config("empty backlog path".to_string()));
    }
    let storage = if path == ":memory:" {
        Storage::in_memory_with(tables.clone())?
    } else {
        Storage::open(path, tables.clone())?
    };
    Ok(Arc::new(storage))
}

/// End of a lease taken at `now`.
pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: chrono::Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(lease)
        .ok_or_else(|| Error::Config(format!("lease of {lease} is out of range")))
}

/// Error for an outcome write whose claim guard matched no row. `current` is
/// the item as it is now: a terminal item can't move again, anything else
/// means the claim passed to another worker.
pub(crate) fn rejected_write(current: &WorkItem, worker: &str, to: Status) -> Error {
    if current.status.is_terminal() {
        Error::InvalidTransition {
            from: current.status.to_string(),
            to: to.to_string(),
        }
    } else {
        Error::LeaseLost {
            id: current.id.to_string(),
            worker: worker.to_string(),
        }
    }
}
