use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use lumen_algo::sanitize::round_to;
use lumen_algo::{retention, review, DecayParams, Sm2Params, Sm2State};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::config::{CoreConfig, MemoryConfig};
use crate::db::time::{days_between_ms, opt_from_ms, to_ms};
use crate::error::{CoreError, CoreResult};
use crate::events::{ItemRef, ItemType};

const WRITE_DECIMALS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStat {
    pub user_id: i64,
    pub item: ItemRef,
    pub interval_days: i64,
    pub easiness_factor: f64,
    pub repetitions: i64,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub next_review_at: Option<DateTime<Utc>>,
    pub current_retention_estimate: f64,
    pub last_quality_of_recall: Option<u8>,
    pub last_time_spent_ms: Option<i64>,
    #[serde(skip)]
    pub version: i64,
}

impl MemoryStat {
    /// Unreviewed state: no evidence, so retention is 0
    pub fn fresh(user_id: i64, item: ItemRef, params: &Sm2Params) -> Self {
        let state = Sm2State::new(params);
        Self {
            user_id,
            item,
            interval_days: state.interval_days,
            easiness_factor: state.easiness_factor,
            repetitions: state.repetitions,
            last_reviewed_at: None,
            next_review_at: None,
            current_retention_estimate: 0.0,
            last_quality_of_recall: None,
            last_time_spent_ms: None,
            version: 0,
        }
    }

    pub fn sm2_state(&self) -> Sm2State {
        Sm2State {
            interval_days: self.interval_days,
            easiness_factor: self.easiness_factor,
            repetitions: self.repetitions,
        }
    }

    /// Retention at `now`, rounded as it would be stored
    pub fn retention_at(&self, now: DateTime<Utc>, params: &DecayParams) -> f64 {
        match self.last_reviewed_at {
            None => 0.0,
            Some(reviewed) => {
                let elapsed = days_between_ms(to_ms(reviewed), to_ms(now));
                round_to(retention(elapsed, self.interval_days, self.easiness_factor, params), WRITE_DECIMALS)
            }
        }
    }

    pub fn is_mastered(&self, config: &MemoryConfig) -> bool {
        self.current_retention_estimate >= config.mastery_retention
            && self.interval_days >= config.mastery_interval_days
    }
}

/// One SM-2 review, keyed by the event that caused it
#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub user_id: i64,
    pub item: ItemRef,
    pub quality: u8,
    pub time_spent_ms: Option<i64>,
    pub event_id: i64,
    pub reviewed_at: DateTime<Utc>,
}

const STAT_COLUMNS: &str = r#""user_id", "item_type", "item_id", "interval_days", "easiness_factor", "repetitions",
    "last_reviewed_at", "next_review_at", "current_retention_estimate", "last_quality_of_recall",
    "last_time_spent_ms", "version""#;

pub(crate) fn stat_from_row(row: &SqliteRow) -> CoreResult<MemoryStat> {
    let item_type: String = row.try_get("item_type")?;
    let item_type = ItemType::parse(&item_type)
        .ok_or_else(|| CoreError::InvalidMetadata(format!("unknown item type {item_type}")))?;
    let quality: Option<i64> = row.try_get("last_quality_of_recall")?;
    Ok(MemoryStat {
        user_id: row.try_get("user_id")?,
        item: ItemRef {
            item_type,
            item_id: row.try_get("item_id")?,
        },
        interval_days: row.try_get("interval_days")?,
        easiness_factor: row.try_get("easiness_factor")?,
        repetitions: row.try_get("repetitions")?,
        last_reviewed_at: opt_from_ms(row.try_get("last_reviewed_at")?),
        next_review_at: opt_from_ms(row.try_get("next_review_at")?),
        current_retention_estimate: row.try_get("current_retention_estimate")?,
        last_quality_of_recall: quality.map(|q| q.clamp(0, 5) as u8),
        last_time_spent_ms: row.try_get("last_time_spent_ms")?,
        version: row.try_get("version")?,
    })
}

pub async fn get(conn: &mut SqliteConnection, user_id: i64, item: ItemRef) -> CoreResult<Option<MemoryStat>> {
    let sql = format!(
        r#"SELECT {STAT_COLUMNS} FROM "memory_stats" WHERE "user_id" = ? AND "item_type" = ? AND "item_id" = ?"#
    );
    let row = sqlx::query(&sql)
        .bind(user_id)
        .bind(item.item_type.as_str())
        .bind(item.item_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(stat_from_row).transpose()
}

async fn already_applied(conn: &mut SqliteConnection, input: &ReviewInput) -> CoreResult<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        r#"SELECT 1 FROM "memory_review_log" WHERE "event_id" = ? AND "item_type" = ? AND "item_id" = ?"#,
    )
    .bind(input.event_id)
    .bind(input.item.item_type.as_str())
    .bind(input.item.item_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

fn apply_review(current: &MemoryStat, input: &ReviewInput, params: &Sm2Params) -> MemoryStat {
    let next = review(&current.sm2_state(), input.quality, params);
    MemoryStat {
        user_id: current.user_id,
        item: current.item,
        interval_days: next.interval_days,
        easiness_factor: round_to(next.easiness_factor, WRITE_DECIMALS),
        repetitions: next.repetitions,
        last_reviewed_at: Some(input.reviewed_at),
        next_review_at: Some(input.reviewed_at + Duration::days(next.interval_days)),
        current_retention_estimate: 1.0,
        last_quality_of_recall: Some(input.quality.min(5)),
        last_time_spent_ms: input.time_spent_ms,
        version: current.version + 1,
    }
}

async fn write_stat(conn: &mut SqliteConnection, stat: &MemoryStat, expected_version: Option<i64>) -> CoreResult<bool> {
    let result = match expected_version {
        None => {
            sqlx::query(
                r#"
                INSERT INTO "memory_stats" (
                    "user_id", "item_type", "item_id", "interval_days", "easiness_factor", "repetitions",
                    "last_reviewed_at", "next_review_at", "current_retention_estimate",
                    "last_quality_of_recall", "last_time_spent_ms", "version"
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT ("user_id", "item_type", "item_id") DO NOTHING
                "#,
            )
            .bind(stat.user_id)
            .bind(stat.item.item_type.as_str())
            .bind(stat.item.item_id)
            .bind(stat.interval_days)
            .bind(stat.easiness_factor)
            .bind(stat.repetitions)
            .bind(stat.last_reviewed_at.map(to_ms))
            .bind(stat.next_review_at.map(to_ms))
            .bind(stat.current_retention_estimate)
            .bind(stat.last_quality_of_recall.map(i64::from))
            .bind(stat.last_time_spent_ms)
            .bind(stat.version)
            .execute(&mut *conn)
            .await?
        }
        Some(version) => {
            sqlx::query(
                r#"
                UPDATE "memory_stats" SET
                    "interval_days" = ?, "easiness_factor" = ?, "repetitions" = ?,
                    "last_reviewed_at" = ?, "next_review_at" = ?, "current_retention_estimate" = ?,
                    "last_quality_of_recall" = ?, "last_time_spent_ms" = ?, "version" = ?
                WHERE "user_id" = ? AND "item_type" = ? AND "item_id" = ? AND "version" = ?
                "#,
            )
            .bind(stat.interval_days)
            .bind(stat.easiness_factor)
            .bind(stat.repetitions)
            .bind(stat.last_reviewed_at.map(to_ms))
            .bind(stat.next_review_at.map(to_ms))
            .bind(stat.current_retention_estimate)
            .bind(stat.last_quality_of_recall.map(i64::from))
            .bind(stat.last_time_spent_ms)
            .bind(stat.version)
            .bind(stat.user_id)
            .bind(stat.item.item_type.as_str())
            .bind(stat.item.item_id)
            .bind(version)
            .execute(&mut *conn)
            .await?
        }
    };
    Ok(result.rows_affected() > 0)
}

/// Apply an SM-2 review.
///
/// Idempotent per (event_id, item): a review already in the log returns the current
/// state unchanged. Writes are guarded by the row version and retried up to
/// `conflict_retries` times before surfacing [`CoreError::Conflict`].
pub async fn record_review(conn: &mut SqliteConnection, config: &CoreConfig, input: &ReviewInput) -> CoreResult<MemoryStat> {
    if already_applied(conn, input).await? {
        tracing::debug!(event_id = input.event_id, item_id = input.item.item_id, "review already applied");
        let current = get(conn, input.user_id, input.item).await?;
        return Ok(current.unwrap_or_else(|| MemoryStat::fresh(input.user_id, input.item, &config.sm2)));
    }

    let attempts = config.memory.conflict_retries.max(1);
    for attempt in 1..=attempts {
        let existing = get(conn, input.user_id, input.item).await?;
        let expected_version = existing.as_ref().map(|s| s.version);
        let current = existing.unwrap_or_else(|| MemoryStat::fresh(input.user_id, input.item, &config.sm2));
        let next = apply_review(&current, input, &config.sm2);

        if write_stat(conn, &next, expected_version).await? {
            sqlx::query(
                r#"
                INSERT INTO "memory_review_log" (
                    "event_id", "item_type", "item_id", "user_id", "quality",
                    "interval_days", "easiness_factor", "repetitions", "reviewed_at"
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(input.event_id)
            .bind(input.item.item_type.as_str())
            .bind(input.item.item_id)
            .bind(input.user_id)
            .bind(i64::from(input.quality))
            .bind(next.interval_days)
            .bind(next.easiness_factor)
            .bind(next.repetitions)
            .bind(to_ms(input.reviewed_at))
            .execute(&mut *conn)
            .await?;
            return Ok(next);
        }

        tracing::debug!(
            user_id = input.user_id,
            item_id = input.item.item_id,
            attempt,
            "memory stat version moved, retrying"
        );
    }

    Err(CoreError::Conflict(format!(
        "memory_stats ({}, {}, {})",
        input.user_id,
        input.item.item_type.as_str(),
        input.item.item_id
    )))
}

/// Store a decayed retention value; skipped when the rounded value is unchanged
pub async fn write_retention(conn: &mut SqliteConnection, stat: &MemoryStat, value: f64) -> CoreResult<bool> {
    let rounded = round_to(value, WRITE_DECIMALS);
    if (rounded - stat.current_retention_estimate).abs() < f64::EPSILON {
        return Ok(false);
    }
    let result = sqlx::query(
        r#"
        UPDATE "memory_stats" SET "current_retention_estimate" = ?, "version" = "version" + 1
        WHERE "user_id" = ? AND "item_type" = ? AND "item_id" = ? AND "version" = ?
        "#,
    )
    .bind(rounded)
    .bind(stat.user_id)
    .bind(stat.item.item_type.as_str())
    .bind(stat.item.item_id)
    .bind(stat.version)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Reviewed stats after `after` in (user_id, item_type, item_id) order, restricted to one partition
pub async fn page_for_partition(
    pool: &SqlitePool,
    partition: u32,
    partitions: u32,
    after: Option<&(i64, String, i64)>,
    limit: i64,
) -> CoreResult<Vec<MemoryStat>> {
    let (user_id, item_type, item_id) = match after {
        Some((u, t, i)) => (Some(*u), Some(t.clone()), Some(*i)),
        None => (None, None, None),
    };
    let sql = format!(
        r#"SELECT {STAT_COLUMNS} FROM "memory_stats"
           WHERE "last_reviewed_at" IS NOT NULL
             AND ("user_id" % ?) = ?
             AND (? IS NULL OR ("user_id", "item_type", "item_id") > (?, ?, ?))
           ORDER BY "user_id", "item_type", "item_id"
           LIMIT ?"#
    );
    let rows = sqlx::query(&sql)
        .bind(i64::from(partitions.max(1)))
        .bind(i64::from(partition))
        .bind(user_id)
        .bind(user_id)
        .bind(item_type)
        .bind(item_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(stat_from_row).collect()
}

/// Items with `next_review_at <= now`, soonest first
pub async fn due(pool: &SqlitePool, user_id: i64, now: DateTime<Utc>, limit: Option<i64>) -> CoreResult<Vec<MemoryStat>> {
    let sql = format!(
        r#"SELECT {STAT_COLUMNS} FROM "memory_stats"
           WHERE "user_id" = ? AND "next_review_at" IS NOT NULL AND "next_review_at" <= ?
           ORDER BY "next_review_at", "item_type", "item_id"
           LIMIT ?"#
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(to_ms(now))
        .bind(limit.unwrap_or(-1))
        .fetch_all(pool)
        .await?;
    rows.iter().map(stat_from_row).collect()
}

/// Items coming due in (now, now + window_days]
pub async fn upcoming(
    pool: &SqlitePool,
    user_id: i64,
    now: DateTime<Utc>,
    window_days: i64,
    limit: Option<i64>,
) -> CoreResult<Vec<MemoryStat>> {
    let sql = format!(
        r#"SELECT {STAT_COLUMNS} FROM "memory_stats"
           WHERE "user_id" = ? AND "next_review_at" > ? AND "next_review_at" <= ?
           ORDER BY "next_review_at", "item_type", "item_id"
           LIMIT ?"#
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(to_ms(now))
        .bind(to_ms(now + Duration::days(window_days.max(0))))
        .bind(limit.unwrap_or(-1))
        .fetch_all(pool)
        .await?;
    rows.iter().map(stat_from_row).collect()
}

/// Long-interval items the user still retains well, strongest first
pub async fn strong(
    pool: &SqlitePool,
    user_id: i64,
    threshold: f64,
    min_interval_days: i64,
    limit: Option<i64>,
) -> CoreResult<Vec<MemoryStat>> {
    let sql = format!(
        r#"SELECT {STAT_COLUMNS} FROM "memory_stats"
           WHERE "user_id" = ? AND "last_reviewed_at" IS NOT NULL
             AND "current_retention_estimate" >= ? AND "interval_days" >= ?
           ORDER BY "current_retention_estimate" DESC, "interval_days" DESC, "item_type", "item_id"
           LIMIT ?"#
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(threshold)
        .bind(min_interval_days)
        .bind(limit.unwrap_or(-1))
        .fetch_all(pool)
        .await?;
    rows.iter().map(stat_from_row).collect()
}

pub async fn mastered_items(pool: &SqlitePool, user_id: i64, config: &MemoryConfig) -> CoreResult<HashSet<ItemRef>> {
    let rows = sqlx::query(
        r#"SELECT "item_type", "item_id" FROM "memory_stats"
           WHERE "user_id" = ? AND "current_retention_estimate" >= ? AND "interval_days" >= ?"#,
    )
    .bind(user_id)
    .bind(config.mastery_retention)
    .bind(config.mastery_interval_days)
    .fetch_all(pool)
    .await?;

    let mut items = HashSet::with_capacity(rows.len());
    for row in &rows {
        let raw: String = row.try_get("item_type")?;
        if let Some(item_type) = ItemType::parse(&raw) {
            items.insert(ItemRef {
                item_type,
                item_id: row.try_get("item_id")?,
            });
        }
    }
    Ok(items)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub total_items: i64,
    pub reviewed_items: i64,
    pub due_count: i64,
    /// Mean over reviewed items; 0 when none
    pub mean_retention: f64,
    pub mastered_count: i64,
}

pub async fn summary(pool: &SqlitePool, user_id: i64, now: DateTime<Utc>, config: &MemoryConfig) -> CoreResult<MemorySummary> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS "total",
            COALESCE(SUM(CASE WHEN "last_reviewed_at" IS NOT NULL THEN 1 ELSE 0 END), 0) AS "reviewed",
            COALESCE(SUM(CASE WHEN "next_review_at" IS NOT NULL AND "next_review_at" <= ? THEN 1 ELSE 0 END), 0) AS "due",
            AVG(CASE WHEN "last_reviewed_at" IS NOT NULL THEN "current_retention_estimate" END) AS "mean_retention",
            COALESCE(SUM(CASE WHEN "current_retention_estimate" >= ? AND "interval_days" >= ? THEN 1 ELSE 0 END), 0) AS "mastered"
        FROM "memory_stats"
        WHERE "user_id" = ?
        "#,
    )
    .bind(to_ms(now))
    .bind(config.mastery_retention)
    .bind(config.mastery_interval_days)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    let mean: Option<f64> = row.try_get("mean_retention")?;
    Ok(MemorySummary {
        total_items: row.try_get("total")?,
        reviewed_items: row.try_get("reviewed")?,
        due_count: row.try_get("due")?,
        mean_retention: round_to(mean.unwrap_or(0.0), WRITE_DECIMALS),
        mastered_count: row.try_get("mastered")?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryProfile {
    pub due: Vec<MemoryStat>,
    pub upcoming: Vec<MemoryStat>,
    pub strong: Vec<MemoryStat>,
    pub summary: MemorySummary,
}

pub async fn profile(
    pool: &SqlitePool,
    config: &CoreConfig,
    user_id: i64,
    upcoming_days: i64,
    now: DateTime<Utc>,
) -> CoreResult<MemoryProfile> {
    let limit = Some(config.feed.max_items as i64);
    Ok(MemoryProfile {
        due: due(pool, user_id, now, limit).await?,
        upcoming: upcoming(pool, user_id, now, upcoming_days, limit).await?,
        strong: strong(
            pool,
            user_id,
            config.memory.strong_threshold,
            config.memory.strong_min_interval_days,
            limit,
        )
        .await?,
        summary: summary(pool, user_id, now, &config.memory).await?,
    })
}
