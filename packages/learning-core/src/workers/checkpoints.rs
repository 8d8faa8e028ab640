use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::time::to_ms;
use crate::error::CoreResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub job: String,
    pub partition: u32,
    pub run_id: Uuid,
    /// JSON-encoded keyset position
    pub last_key: Option<String>,
    pub processed: i64,
    pub done: bool,
}

impl Checkpoint {
    pub fn start(job: &str, partition: u32, run_id: Uuid) -> Self {
        Self {
            job: job.to_string(),
            partition,
            run_id,
            last_key: None,
            processed: 0,
            done: false,
        }
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> CoreResult<Checkpoint> {
    let run_id: String = row.try_get("run_id")?;
    let partition: i64 = row.try_get("partition")?;
    Ok(Checkpoint {
        job: row.try_get("job")?,
        partition: partition.max(0) as u32,
        run_id: Uuid::parse_str(&run_id).unwrap_or_else(|_| Uuid::nil()),
        last_key: row.try_get("last_key")?,
        processed: row.try_get("processed")?,
        done: row.try_get("done")?,
    })
}

pub async fn load_all(pool: &SqlitePool, job: &str) -> CoreResult<Vec<Checkpoint>> {
    let rows = sqlx::query(r#"SELECT * FROM "job_checkpoints" WHERE "job" = ? ORDER BY "partition""#)
        .bind(job)
        .fetch_all(pool)
        .await?;
    rows.iter().map(checkpoint_from_row).collect()
}

pub async fn save(pool: &SqlitePool, checkpoint: &Checkpoint, now: DateTime<Utc>) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO "job_checkpoints" ("job", "partition", "run_id", "last_key", "processed", "done", "updated_at")
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("job", "partition") DO UPDATE SET
            "run_id" = excluded."run_id",
            "last_key" = excluded."last_key",
            "processed" = excluded."processed",
            "done" = excluded."done",
            "updated_at" = excluded."updated_at"
        "#,
    )
    .bind(&checkpoint.job)
    .bind(i64::from(checkpoint.partition))
    .bind(checkpoint.run_id.to_string())
    .bind(&checkpoint.last_key)
    .bind(checkpoint.processed)
    .bind(checkpoint.done)
    .bind(to_ms(now))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear(pool: &SqlitePool, job: &str) -> CoreResult<u64> {
    let result = sqlx::query(r#"DELETE FROM "job_checkpoints" WHERE "job" = ?"#)
        .bind(job)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn clear_all(pool: &SqlitePool) -> CoreResult<u64> {
    let result = sqlx::query(r#"DELETE FROM "job_checkpoints""#).execute(pool).await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Incomplete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Failed => "failed",
        }
    }
}

pub async fn begin_run(pool: &SqlitePool, job: &str, run_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
    sqlx::query(
        r#"INSERT OR IGNORE INTO "job_runs" ("run_id", "job", "started_at", "status") VALUES (?, ?, ?, ?)"#,
    )
    .bind(run_id.to_string())
    .bind(job)
    .bind(to_ms(now))
    .bind(RunStatus::Running.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finish_run(pool: &SqlitePool, run_id: Uuid, status: RunStatus, now: DateTime<Utc>) -> CoreResult<()> {
    sqlx::query(r#"UPDATE "job_runs" SET "status" = ?, "finished_at" = ? WHERE "run_id" = ?"#)
        .bind(status.as_str())
        .bind(to_ms(now))
        .bind(run_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Status of the most recent run of a job
pub async fn last_status(pool: &SqlitePool, job: &str) -> CoreResult<Option<String>> {
    let status = sqlx::query_scalar(
        r#"SELECT "status" FROM "job_runs" WHERE "job" = ? ORDER BY "started_at" DESC, rowid DESC LIMIT 1"#,
    )
    .bind(job)
    .fetch_optional(pool)
    .await?;
    Ok(status)
}
