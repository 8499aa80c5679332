//! Postgres-backed `Storage`. All SQL is runtime-checked (`sqlx::query*`,
//! not the `query!` macros) to avoid a compile-time database connection.
//!
//! Expected schema:
//! ```sql
//! CREATE TABLE jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     url TEXT NOT NULL,
//!     status TEXT NOT NULL,
//!     priority INT NOT NULL,
//!     last_activity TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     tags JSONB NOT NULL DEFAULT '[]',
//!     error_code SMALLINT NOT NULL DEFAULT 0,
//!     error_reason TEXT NOT NULL DEFAULT ''
//! );
//! ```

use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgtag_core::{ErrorCode, Info, Status, Tag};
use sqlx::PgPool;

use crate::Storage;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    url: String,
    status: String,
    priority: i32,
    last_activity: DateTime<Utc>,
    tags: serde_json::Value,
    error_code: i16,
    error_reason: String,
}

/// Approximates a wall-clock timestamp as an `Instant` by anchoring on how
/// long ago it was relative to now. `Info.last_activity` is `Instant`
/// in-process; Postgres only knows wall time, so this is the boundary
/// conversion.
fn instant_from_db(ts: DateTime<Utc>) -> Instant {
    let elapsed = Utc::now().signed_duration_since(ts);
    let elapsed = elapsed.to_std().unwrap_or(Duration::ZERO);
    Instant::now()
        .checked_sub(elapsed)
        .unwrap_or_else(Instant::now)
}

fn status_to_db(status: Status) -> &'static str {
    match status {
        Status::Pending => "pending",
        Status::Processing => "processing",
        Status::Done => "done",
        Status::Failed => "failed",
    }
}

fn status_from_db(status: &str) -> anyhow::Result<Status> {
    match status {
        "pending" => Ok(Status::Pending),
        "processing" => Ok(Status::Processing),
        "done" => Ok(Status::Done),
        "failed" => Ok(Status::Failed),
        other => Err(anyhow!("unknown job status {other:?}")),
    }
}

fn error_code_to_db(code: ErrorCode) -> i16 {
    code as i16
}

fn error_code_from_db(code: i16) -> ErrorCode {
    match code {
        1 => ErrorCode::Canceled,
        2 => ErrorCode::NotFound,
        3 => ErrorCode::Invalid,
        4 => ErrorCode::Terminated,
        5 => ErrorCode::Timeout,
        6 => ErrorCode::InternalError,
        _ => ErrorCode::Ok,
    }
}

impl TryFrom<JobRow> for Info {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let tags: Vec<Tag> = serde_json::from_value(row.tags)?;
        Ok(Info {
            id: row.id,
            url: row.url,
            status: status_from_db(&row.status)?,
            priority: row.priority,
            last_activity: instant_from_db(row.last_activity),
            tags,
            error_code: error_code_from_db(row.error_code),
            error_reason: row.error_reason,
        })
    }
}

/// A `Storage` backed by a Postgres table, using `SELECT ... FOR UPDATE
/// SKIP LOCKED` so concurrent Managers never double-pop the same job.
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn push(&self, url: String, priority: i32) -> anyhow::Result<Info> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (url, status, priority, tags)
            VALUES ($1, $2, $3, '[]')
            RETURNING id, url, status, priority, last_activity, tags, error_code, error_reason
            "#,
        )
        .bind(&url)
        .bind(status_to_db(Status::Pending))
        .bind(priority)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        row.try_into()
    }

    async fn pop(&self, n: usize) -> anyhow::Result<Vec<Info>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $1, last_activity = now()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = $2
                ORDER BY priority DESC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, url, status, priority, last_activity, tags, error_code, error_reason
            "#,
        )
        .bind(status_to_db(Status::Processing))
        .bind(status_to_db(Status::Pending))
        .bind(n as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow!(e))?;

        rows.into_iter().map(Info::try_from).collect()
    }

    async fn reset(&self, ids: &[i64]) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET status = $1 WHERE id = ANY($2)")
            .bind(status_to_db(Status::Pending))
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn abort_stalled(&self, threshold: Duration) -> anyhow::Result<Vec<Info>> {
        let threshold = sqlx::postgres::types::PgInterval::try_from(
            chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero()),
        )
        .map_err(|e| anyhow!(e))?;

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = $2 AND last_activity < now() - $3::interval
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, url, status, priority, last_activity, tags, error_code, error_reason
            "#,
        )
        .bind(status_to_db(Status::Pending))
        .bind(status_to_db(Status::Processing))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        rows.into_iter().map(Info::try_from).collect()
    }

    async fn beat(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET last_activity = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn done(&self, id: i64, tags: Vec<Tag>) -> anyhow::Result<()> {
        let tags = serde_json::to_value(tags)?;
        sqlx::query(
            "UPDATE jobs SET status = $2, tags = $3, last_activity = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status_to_db(Status::Done))
        .bind(tags)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn error(&self, id: i64, code: ErrorCode, reason: String) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, error_code = $3, error_reason = $4, last_activity = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status_to_db(Status::Failed))
        .bind(error_code_to_db(code))
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Info>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, url, status, priority, last_activity, tags, error_code, error_reason FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        row.map(Info::try_from).transpose()
    }

    async fn position(&self, id: i64) -> anyhow::Result<Option<usize>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT rank FROM (
                SELECT id, (ROW_NUMBER() OVER (ORDER BY priority DESC, id ASC) - 1) AS rank
                FROM jobs
                WHERE status = $1
            ) ranked
            WHERE id = $2
            "#,
        )
        .bind(status_to_db(Status::Pending))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        Ok(row.map(|(rank,)| rank as usize))
    }

    async fn queue_size(&self) -> anyhow::Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM jobs WHERE status = $1")
            .bind(status_to_db(Status::Pending))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(count as usize)
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Info>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, url, status, priority, last_activity, tags, error_code, error_reason FROM jobs WHERE status = $1",
        )
        .bind(status_to_db(Status::Processing))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        rows.into_iter().map(Info::try_from).collect()
    }
}
