//! Backlog operations on Postgres: claim with lease, hash registration,
//! guarded outcome writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backlog::{Backlog, lease_expiry, rejected_write};
use crate::error::{Error, Result};
use crate::model::*;

const COLUMNS: &str = "id, event_type, source_ip, filename_hint, stored_name_hint, logged_hash, \
     status, lease_until, claimed_by, attempts, retry_after, content_hash, task_ref, \
     engine_response, duplicate_of, last_error, created_at, updated_at";

/// `$3` is the claim instant, `$4` the artifact-observed event type.
const CLAIMABLE: &str = "event_type = $4 AND (
        (status = 'pending' AND (retry_after IS NULL OR retry_after <= $3))
        OR (status = 'claimed' AND lease_until < $3))";

#[async_trait]
impl Backlog for super::Db {
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItem> {
        let sql = format!(
            "INSERT INTO {} (event_type, source_ip, filename_hint, stored_name_hint, logged_hash,
                             status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, $6)
             RETURNING {COLUMNS}",
            self.tables().backlog
        );
        let row: WorkItemRow = sqlx::query_as(&sql)
            .bind(&new.event_type)
            .bind(&new.source_ip)
            .bind(&new.filename_hint)
            .bind(&new.stored_name_hint)
            .bind(&new.logged_hash)
            .bind(Utc::now())
            .fetch_one(self.pool())
            .await?;
        row.try_into_work_item()
    }

    async fn claim_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<WorkItem>> {
        let lease_until = lease_expiry(now, lease)?;
        let t = &self.tables().backlog;
        let sql = format!(
            "UPDATE {t}
             SET status = 'claimed', lease_until = $1, claimed_by = $2,
                 attempts = attempts + 1, retry_after = NULL, updated_at = $3
             WHERE id = (
                 SELECT id FROM {t} WHERE {CLAIMABLE}
                 ORDER BY id LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             AND {CLAIMABLE}
             RETURNING {COLUMNS}"
        );
        let row: Option<WorkItemRow> = sqlx::query_as(&sql)
            .bind(lease_until)
            .bind(worker)
            .bind(now)
            .bind(ARTIFACT_OBSERVED)
            .fetch_optional(self.pool())
            .await?;
        row.map(WorkItemRow::try_into_work_item).transpose()
    }

    async fn register_hash(
        &self,
        id: WorkId,
        hash: &str,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let tables = self.tables();
        let mut tx = self.pool().begin().await?;

        // Serialize registrations of the same content across all workers.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(hash)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "UPDATE {} SET content_hash = COALESCE(content_hash, $1), updated_at = $2
             WHERE id = $3",
            tables.backlog
        );
        sqlx::query(&sql)
            .bind(hash)
            .bind(now)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT EXISTS (
                SELECT 1 FROM {} WHERE content_hash = $1 AND id <> $2
                AND (status = 'forwarded' OR (status = 'claimed' AND lease_until >= $3))
                AND ($4::timestamptz IS NULL OR updated_at >= $4))
             OR EXISTS (
                SELECT 1 FROM {} WHERE content_hash = $1
                AND ($4::timestamptz IS NULL OR reported_at >= $4))",
            tables.backlog, tables.results
        );
        let duplicate: bool = sqlx::query_scalar(&sql)
            .bind(hash)
            .bind(id.0)
            .bind(now)
            .bind(since)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(duplicate)
    }

    async fn record(
        &self,
        id: WorkId,
        worker: &str,
        outcome: &Outcome,
        retry_after: Option<DateTime<Utc>>,
    ) -> Result<WorkItem> {
        let t = &self.tables().backlog;
        let now = Utc::now();
        let guard = "WHERE id = $1 AND status = 'claimed' AND claimed_by = $2";

        let rows_affected = match outcome {
            Outcome::Forwarded {
                task_ref,
                raw_response,
                content_hash,
            } => {
                let sql = format!(
                    "UPDATE {t} SET status = 'forwarded', lease_until = NULL, claimed_by = NULL,
                         retry_after = NULL, task_ref = $3, engine_response = $4,
                         content_hash = COALESCE(content_hash, $5), last_error = NULL,
                         updated_at = $6
                     {guard}"
                );
                sqlx::query(&sql)
                    .bind(id.0)
                    .bind(worker)
                    .bind(task_ref.map(|t| t.0))
                    .bind(raw_response)
                    .bind(content_hash)
                    .bind(now)
                    .execute(self.pool())
                    .await?
                    .rows_affected()
            }
            Outcome::Dead {
                reason,
                duplicate_of,
            } => {
                let sql = format!(
                    "UPDATE {t} SET status = 'dead', lease_until = NULL, claimed_by = NULL,
                         retry_after = NULL, last_error = $3, duplicate_of = $4, updated_at = $5
                     {guard}"
                );
                sqlx::query(&sql)
                    .bind(id.0)
                    .bind(worker)
                    .bind(reason)
                    .bind(duplicate_of)
                    .bind(now)
                    .execute(self.pool())
                    .await?
                    .rows_affected()
            }
            Outcome::Retry { reason } => {
                let sql = format!(
                    "UPDATE {t} SET status = 'pending', lease_until = NULL, claimed_by = NULL,
                         retry_after = $3, last_error = $4, updated_at = $5
                     {guard}"
                );
                sqlx::query(&sql)
                    .bind(id.0)
                    .bind(worker)
                    .bind(retry_after)
                    .bind(reason)
                    .bind(now)
                    .execute(self.pool())
                    .await?
                    .rows_affected()
            }
        };

        if rows_affected == 0 {
            let current = self.get(id).await?;
            return Err(rejected_write(&current, worker, outcome.target_status()));
        }

        self.get(id).await
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1",
            self.tables().backlog
        );
        let row: Option<WorkItemRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
            .try_into_work_item()
    }

    async fn list(&self, status: Option<Status>, limit: i64) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {}
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY id DESC LIMIT $2",
            self.tables().backlog
        );
        let rows: Vec<WorkItemRow> = sqlx::query_as(&sql)
            .bind(status.map(Status::as_str))
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    /// Simple health check: run a SELECT 1.
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool()).await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: i64,
    event_type: String,
    source_ip: String,
    filename_hint: Option<String>,
    stored_name_hint: Option<String>,
    logged_hash: Option<String>,
    status: String,
    lease_until: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    attempts: i32,
    retry_after: Option<DateTime<Utc>>,
    content_hash: Option<String>,
    task_ref: Option<i64>,
    engine_response: Option<String>,
    duplicate_of: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId(self.id),
            event_type: self.event_type,
            source_ip: self.source_ip,
            filename_hint: self.filename_hint,
            stored_name_hint: self.stored_name_hint,
            logged_hash: self.logged_hash,
            status: self.status.parse()?,
            lease_until: self.lease_until,
            claimed_by: self.claimed_by,
            attempts: self.attempts.max(0) as u32,
            retry_after: self.retry_after,
            content_hash: self.content_hash,
            task_ref: self.task_ref.map(TaskRef),
            engine_response: self.engine_response,
            duplicate_of: self.duplicate_of,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
