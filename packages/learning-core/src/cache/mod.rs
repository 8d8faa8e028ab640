//! Advisory per-(user, feed kind) cache stored in `recommendation_cache`.
//! Reads past `expires_at` are misses; stale reads within the TTL are tolerated.

pub mod keys;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db::time::{from_ms, to_ms};
use crate::error::CoreResult;

pub use keys::FeedKind;

#[derive(Debug, Clone)]
pub struct CachedFeed<T> {
    pub item_ids: Vec<i64>,
    pub entries: Vec<T>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: i64,
}

/// Fetch a live entry and count the hit in the same statement
pub async fn get<T>(pool: &SqlitePool, user_id: i64, kind: FeedKind, now: DateTime<Utc>) -> CoreResult<Option<CachedFeed<T>>>
where
    T: DeserializeOwned,
{
    let row = sqlx::query(
        r#"
        UPDATE "recommendation_cache" SET "hit_count" = "hit_count" + 1
        WHERE "user_id" = ? AND "feed_kind" = ? AND "expires_at" > ?
        RETURNING "item_ids", "metadata", "cached_at", "expires_at", "hit_count"
        "#,
    )
    .bind(user_id)
    .bind(kind.as_str())
    .bind(to_ms(now))
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let item_ids: String = row.try_get("item_ids")?;
    let metadata: String = row.try_get("metadata")?;
    let entries = match serde_json::from_str(&metadata) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(user_id, feed = kind.as_str(), error = %e, "unreadable cached feed, treating as miss");
            return Ok(None);
        }
    };

    Ok(Some(CachedFeed {
        item_ids: serde_json::from_str(&item_ids)?,
        entries,
        cached_at: from_ms(row.try_get("cached_at")?),
        expires_at: from_ms(row.try_get("expires_at")?),
        hit_count: row.try_get("hit_count")?,
    }))
}

/// Replace the entry and reset its hit counter
pub async fn put<T>(
    pool: &SqlitePool,
    user_id: i64,
    kind: FeedKind,
    item_ids: &[i64],
    entries: &[T],
    now: DateTime<Utc>,
    ttl: Duration,
) -> CoreResult<()>
where
    T: Serialize,
{
    let expires_at = to_ms(now) + ttl.as_millis() as i64;
    sqlx::query(
        r#"
        INSERT INTO "recommendation_cache" ("user_id", "feed_kind", "item_ids", "metadata", "cached_at", "expires_at", "hit_count")
        VALUES (?, ?, ?, ?, ?, ?, 0)
        ON CONFLICT ("user_id", "feed_kind") DO UPDATE SET
            "item_ids" = excluded."item_ids",
            "metadata" = excluded."metadata",
            "cached_at" = excluded."cached_at",
            "expires_at" = excluded."expires_at",
            "hit_count" = 0
        "#,
    )
    .bind(user_id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(item_ids)?)
    .bind(serde_json::to_string(entries)?)
    .bind(to_ms(now))
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn invalidate_user(pool: &SqlitePool, user_id: i64) -> CoreResult<u64> {
    let result = sqlx::query(r#"DELETE FROM "recommendation_cache" WHERE "user_id" = ?"#)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn invalidate_kind(pool: &SqlitePool, user_id: i64, kind: FeedKind) -> CoreResult<u64> {
    let result = sqlx::query(r#"DELETE FROM "recommendation_cache" WHERE "user_id" = ? AND "feed_kind" = ?"#)
        .bind(user_id)
        .bind(kind.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Drop every entry cached strictly before `watermark`
pub async fn invalidate_before(pool: &SqlitePool, watermark: DateTime<Utc>) -> CoreResult<u64> {
    let result = sqlx::query(r#"DELETE FROM "recommendation_cache" WHERE "cached_at" < ?"#)
        .bind(to_ms(watermark))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn invalidate_all(pool: &SqlitePool) -> CoreResult<u64> {
    let result = sqlx::query(r#"DELETE FROM "recommendation_cache""#).execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_hit_counter_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("cache.db")).await.unwrap();
        let pool = db.pool();
        let now = Utc::now();

        put(pool, 1, FeedKind::Review, &[3, 4], &["a", "b"], now, Duration::from_secs(600))
            .await
            .unwrap();

        let first: CachedFeed<String> = get(pool, 1, FeedKind::Review, now).await.unwrap().unwrap();
        assert_eq!(first.item_ids, vec![3, 4]);
        assert_eq!(first.hit_count, 1);
        let second: CachedFeed<String> = get(pool, 1, FeedKind::Review, now).await.unwrap().unwrap();
        assert_eq!(second.hit_count, 2);

        let later = now + ChronoDuration::minutes(11);
        assert!(get::<String>(pool, 1, FeedKind::Review, later).await.unwrap().is_none());
        assert!(get::<String>(pool, 1, FeedKind::Explore, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_before_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("cache.db")).await.unwrap();
        let pool = db.pool();
        let now = Utc::now();
        let ttl = Duration::from_secs(3600);

        put::<i64>(pool, 1, FeedKind::Personalized, &[], &[], now - ChronoDuration::minutes(5), ttl)
            .await
            .unwrap();
        put::<i64>(pool, 2, FeedKind::Personalized, &[], &[], now, ttl).await.unwrap();

        assert_eq!(invalidate_before(pool, now).await.unwrap(), 1);
        assert!(get::<i64>(pool, 1, FeedKind::Personalized, now).await.unwrap().is_none());
        assert!(get::<i64>(pool, 2, FeedKind::Personalized, now).await.unwrap().is_some());
        assert_eq!(invalidate_user(pool, 2).await.unwrap(), 1);
    }
}
