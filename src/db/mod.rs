//! PostgreSQL backlog: connection pool, schema setup, and health check.
//!
//! Used when workers on several hosts share one backlog. The claim relies on
//! `FOR UPDATE SKIP LOCKED`, so concurrent claimers never block on, or
//! receive, the same row.

pub mod backlog;

use crate::config::Tables;
use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared by every worker task.
pub struct Db {
    pool: PgPool,
    tables: Tables,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, tables: Tables) -> Result<Self> {
        tables.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool, tables })
    }

    /// Create the backlog and results tables if they don't exist yet.
    pub async fn migrate(&self) -> Result<()> {
        let Tables { backlog, results } = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {backlog} (
                    id                BIGSERIAL PRIMARY KEY,
                    event_type        TEXT NOT NULL,
                    source_ip         TEXT NOT NULL DEFAULT 'unknown',
                    filename_hint     TEXT,
                    stored_name_hint  TEXT,
                    logged_hash       TEXT,
                    status            TEXT NOT NULL DEFAULT 'pending'
                                      CHECK (status IN ('pending', 'claimed', 'forwarded', 'dead')),
                    lease_until       TIMESTAMPTZ,
                    claimed_by        TEXT,
                    attempts          INTEGER NOT NULL DEFAULT 0,
                    retry_after       TIMESTAMPTZ,
                    content_hash      TEXT,
                    task_ref          BIGINT,
                    engine_response   TEXT,
                    duplicate_of      TEXT,
                    last_error        TEXT,
                    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at        TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{backlog}_claimable
                 ON {backlog} (id) WHERE status IN ('pending', 'claimed')"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{backlog}_hash
                 ON {backlog} (content_hash) WHERE content_hash IS NOT NULL"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {results} (
                    id            BIGSERIAL PRIMARY KEY,
                    content_hash  TEXT NOT NULL,
                    task_ref      BIGINT,
                    reported_at   TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{results}_hash
                 ON {results} (content_hash, reported_at)"
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Get a reference to the connection pool (for submodules).
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }
}
