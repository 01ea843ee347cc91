//! SQLite backlog.
//!
//! One database file shared by every worker process on the host. WAL mode
//! keeps readers off the writer's back; a busy timeout lets concurrent
//! writers queue instead of failing. Each claim is a single conditional
//! UPDATE, which SQLite serializes under its writer lock.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::backlog::{Backlog, lease_expiry, rejected_write};
use crate::config::Tables;
use crate::error::{Error, Result};
use crate::model::*;

const COLUMNS: &str = "id, event_type, source_ip, filename_hint, stored_name_hint, logged_hash, \
     status, lease_until, claimed_by, attempts, retry_after, content_hash, task_ref, \
     engine_response, duplicate_of, last_error, created_at, updated_at";

/// Eligibility predicate shared by the claim's selection and its guard.
/// `?3` is the claim instant, `?4` the artifact-observed event type.
const CLAIMABLE: &str = "event_type = ?4 AND (
        (status = 'pending' AND (retry_after IS NULL OR retry_after <= ?3))
        OR (status = 'claimed' AND lease_until < ?3))";

/// Storage backend. Owns the SQLite connection; clones share it.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    tables: Arc<Tables>,
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, tables: Tables) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, tables)
    }

    /// Create an in-memory database with the default table names (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(Tables::default())
    }

    pub fn in_memory_with(tables: Tables) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, tables)
    }

    fn init(conn: Connection, tables: Tables) -> Result<Self> {
        tables.validate()?;

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let Tables { backlog, results } = &tables;
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {backlog} (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type        TEXT NOT NULL,
                source_ip         TEXT NOT NULL DEFAULT 'unknown',
                filename_hint     TEXT,
                stored_name_hint  TEXT,
                logged_hash       TEXT,
                status            TEXT NOT NULL DEFAULT 'pending'
                                  CHECK (status IN ('pending', 'claimed', 'forwarded', 'dead')),
                lease_until       TEXT,
                claimed_by        TEXT,
                attempts          INTEGER NOT NULL DEFAULT 0,
                retry_after       TEXT,
                content_hash      TEXT,
                task_ref          INTEGER,
                engine_response   TEXT,
                duplicate_of      TEXT,
                last_error        TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{backlog}_claimable
                ON {backlog}(event_type, status, id);
            CREATE INDEX IF NOT EXISTS idx_{backlog}_hash
                ON {backlog}(content_hash) WHERE content_hash IS NOT NULL;

            CREATE TABLE IF NOT EXISTS {results} (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash  TEXT NOT NULL,
                task_ref      INTEGER,
                reported_at   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{results}_hash
                ON {results}(content_hash, reported_at);
            ",
        ))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Arc::new(tables),
        })
    }

    /// Insert a results-store record, as the analysis side would after a report.
    pub async fn record_analysis(&self, record: AnalysisRecord) -> Result<()> {
        self.blocking(move |conn, tables| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (content_hash, task_ref, reported_at) VALUES (?1, ?2, ?3)",
                    tables.results
                ),
                params![
                    record.content_hash,
                    record.task_ref.map(|t| t.0),
                    ts(record.reported_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &Tables) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let tables = Arc::clone(&self.tables);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Other("storage connection mutex poisoned".to_string()))?;
            f(&mut guard, &tables)
        })
        .await
        .map_err(|e| Error::Other(format!("storage task failed: {e}")))?
    }
}

#[async_trait]
impl Backlog for Storage {
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItem> {
        self.blocking(move |conn, tables| {
            let now = ts(Utc::now());
            conn.execute(
                &format!(
                    "INSERT INTO {} (event_type, source_ip, filename_hint, stored_name_hint,
                                     logged_hash, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                    tables.backlog
                ),
                params![
                    new.event_type,
                    new.source_ip,
                    new.filename_hint,
                    new.stored_name_hint,
                    new.logged_hash,
                    now,
                ],
            )?;
            get_work_item_on(conn, tables, WorkId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn claim_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<WorkItem>> {
        let lease_until = ts(lease_expiry(now, lease)?);
        let worker = worker.to_string();
        self.blocking(move |conn, tables| {
            let t = &tables.backlog;
            let claimed = conn
                .query_row(
                    &format!(
                        "UPDATE {t}
                         SET status = 'claimed', lease_until = ?1, claimed_by = ?2,
                             attempts = attempts + 1, retry_after = NULL, updated_at = ?3
                         WHERE id = (SELECT id FROM {t} WHERE {CLAIMABLE} ORDER BY id LIMIT 1)
                           AND {CLAIMABLE}
                         RETURNING {COLUMNS}"
                    ),
                    params![lease_until, worker, ts(now), ARTIFACT_OBSERVED],
                    row_to_work_item,
                )
                .optional()?;
            Ok(claimed)
        })
        .await
    }

    async fn register_hash(
        &self,
        id: WorkId,
        hash: &str,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let hash = hash.to_string();
        self.blocking(move |conn, tables| {
            // IMMEDIATE takes the writer lock up front, so concurrent
            // registrations of the same content are strictly ordered.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let since = since.map(ts);

            tx.execute(
                &format!(
                    "UPDATE {} SET content_hash = COALESCE(content_hash, ?1), updated_at = ?2
                     WHERE id = ?3",
                    tables.backlog
                ),
                params![hash, ts(now), id.0],
            )?;

            let in_backlog: bool = tx.query_row(
                &format!(
                    "SELECT EXISTS (
                        SELECT 1 FROM {} WHERE content_hash = ?1 AND id <> ?2
                        AND (status = 'forwarded' OR (status = 'claimed' AND lease_until >= ?3))
                        AND (?4 IS NULL OR updated_at >= ?4))",
                    tables.backlog
                ),
                params![hash, id.0, ts(now), since],
                |row| row.get(0),
            )?;

            let duplicate = in_backlog
                || tx.query_row(
                    &format!(
                        "SELECT EXISTS (
                            SELECT 1 FROM {} WHERE content_hash = ?1
                            AND (?2 IS NULL OR reported_at >= ?2))",
                        tables.results
                    ),
                    params![hash, since],
                    |row| row.get(0),
                )?;

            tx.commit()?;
            Ok(duplicate)
        })
        .await
    }

    async fn record(
        &self,
        id: WorkId,
        worker: &str,
        outcome: &Outcome,
        retry_after: Option<DateTime<Utc>>,
    ) -> Result<WorkItem> {
        let worker = worker.to_string();
        let outcome = outcome.clone();
        self.blocking(move |conn, tables| {
            let t = &tables.backlog;
            let now = ts(Utc::now());
            let guard = "WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2";

            let rows_affected = match &outcome {
                Outcome::Forwarded {
                    task_ref,
                    raw_response,
                    content_hash,
                } => conn.execute(
                    &format!(
                        "UPDATE {t} SET status = 'forwarded', lease_until = NULL, claimed_by = NULL,
                             retry_after = NULL, task_ref = ?3, engine_response = ?4,
                             content_hash = COALESCE(content_hash, ?5), last_error = NULL,
                             updated_at = ?6
                         {guard}"
                    ),
                    params![
                        id.0,
                        worker,
                        task_ref.map(|t| t.0),
                        raw_response,
                        content_hash,
                        now
                    ],
                )?,
                Outcome::Dead {
                    reason,
                    duplicate_of,
                } => conn.execute(
                    &format!(
                        "UPDATE {t} SET status = 'dead', lease_until = NULL, claimed_by = NULL,
                             retry_after = NULL, last_error = ?3, duplicate_of = ?4, updated_at = ?5
                         {guard}"
                    ),
                    params![id.0, worker, reason, duplicate_of, now],
                )?,
                Outcome::Retry { reason } => conn.execute(
                    &format!(
                        "UPDATE {t} SET status = 'pending', lease_until = NULL, claimed_by = NULL,
                             retry_after = ?3, last_error = ?4, updated_at = ?5
                         {guard}"
                    ),
                    params![id.0, worker, retry_after.map(ts), reason, now],
                )?,
            };

            if rows_affected == 0 {
                let current = get_work_item_on(conn, tables, id)?;
                return Err(rejected_write(&current, &worker, outcome.target_status()));
            }

            get_work_item_on(conn, tables, id)
        })
        .await
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        self.blocking(move |conn, tables| get_work_item_on(conn, tables, id))
            .await
    }

    async fn list(&self, status: Option<Status>, limit: i64) -> Result<Vec<WorkItem>> {
        self.blocking(move |conn, tables| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM {}
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY id DESC LIMIT ?2",
                tables.backlog
            ))?;
            let items = stmt
                .query_map(params![status.map(Status::as_str), limit], row_to_work_item)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(items)
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        self.blocking(|conn, _| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Inner functions: accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn get_work_item_on(conn: &Connection, tables: &Tables, id: WorkId) -> Result<WorkItem> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM {} WHERE id = ?1", tables.backlog),
        params![id.0],
        row_to_work_item,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("work item {id}")))
}

/// Fixed-width UTC timestamps, so lexical order in SQL is chronological.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_work_item(row: &rusqlite::Row) -> rusqlite::Result<WorkItem> {
    let status: String = row.get(6)?;
    Ok(WorkItem {
        id: WorkId(row.get(0)?),
        event_type: row.get(1)?,
        source_ip: row.get(2)?,
        filename_hint: row.get(3)?,
        stored_name_hint: row.get(4)?,
        logged_hash: row.get(5)?,
        status: status.parse().map_err(|e| conversion_error(6, e))?,
        lease_until: parse_optional_ts(row, 7)?,
        claimed_by: row.get(8)?,
        attempts: row.get(9)?,
        retry_after: parse_optional_ts(row, 10)?,
        content_hash: row.get(11)?,
        task_ref: row.get::<_, Option<i64>>(12)?.map(TaskRef),
        engine_response: row.get(13)?,
        duplicate_of: row.get(14)?,
        last_error: row.get(15)?,
        created_at: parse_ts(row, 16)?,
        updated_at: parse_ts(row, 17)?,
    })
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_optional_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
