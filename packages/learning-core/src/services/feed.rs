//! Feeds served through the recommendation cache.
//!
//! | kind | source | order |
//! |------|--------|-------|
//! | personalized | stored match scores (live when none) | score desc |
//! | review | memory stats due now | next_review_at asc |
//! | explore | quizzes outside attempted subjects | preference + popularity desc |
//! | challenge | match scores with gap in (min, max] | score desc |

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lumen_algo::preference_alignment;
use lumen_algo::sanitize::round_to;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::cache::{self, FeedKind};
use crate::config::CoreConfig;
use crate::content::ContentReadModel;
use crate::error::CoreResult;
use crate::events::ItemRef;
use crate::services::matching::{self, MatchScore};
use crate::services::memory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub item: ItemRef,
    pub score: f64,
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<DateTime<Utc>>,
}

impl FeedItem {
    fn from_match(score: &MatchScore) -> Self {
        Self {
            item: score.item,
            score: score.score,
            reasons: score.why.iter().map(|w| w.text().to_string()).collect(),
            next_review_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedPage {
    pub kind: FeedKind,
    pub items: Vec<FeedItem>,
    pub from_cache: bool,
    pub cached_at: DateTime<Utc>,
}

pub fn clamp_limit(limit: Option<usize>, config: &CoreConfig) -> usize {
    limit
        .unwrap_or(config.feed.default_limit)
        .clamp(1, config.feed.max_items.max(1))
}

/// Read a feed through the cache. A miss computes the full feed, stores it and
/// returns the first `limit` entries.
pub async fn feed(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    kind: FeedKind,
    limit: Option<usize>,
    now: DateTime<Utc>,
) -> CoreResult<FeedPage> {
    let limit = clamp_limit(limit, config);

    if let Some(mut cached) = cache::get::<FeedItem>(pool, user_id, kind, now).await? {
        tracing::debug!(user_id, feed = kind.as_str(), hits = cached.hit_count, "feed cache hit");
        cached.entries.truncate(limit);
        return Ok(FeedPage {
            kind,
            items: cached.entries,
            from_cache: true,
            cached_at: cached.cached_at,
        });
    }

    let mut items = compute(pool, content, config, user_id, kind, now).await?;
    items.truncate(config.feed.max_items);
    let ids: Vec<i64> = items.iter().map(|i| i.item.item_id).collect();
    cache::put(pool, user_id, kind, &ids, &items, now, kind.ttl(&config.feed)).await?;
    tracing::debug!(user_id, feed = kind.as_str(), items = items.len(), "feed computed");

    items.truncate(limit);
    Ok(FeedPage {
        kind,
        items,
        from_cache: false,
        cached_at: now,
    })
}

/// Build a feed without touching the cache
pub async fn compute(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    kind: FeedKind,
    now: DateTime<Utc>,
) -> CoreResult<Vec<FeedItem>> {
    let max = config.feed.max_items as i64;
    match kind {
        FeedKind::Personalized => {
            let scores = matching::scores_or_live(pool, content, config, user_id, max, now).await?;
            Ok(scores.iter().map(FeedItem::from_match).collect())
        }
        FeedKind::Challenge => {
            let scores = matching::scores_or_live(pool, content, config, user_id, i64::MAX, now).await?;
            Ok(challenge_items(&scores, config))
        }
        FeedKind::Review => review_items(pool, user_id, now, max).await,
        FeedKind::Explore => explore_items(pool, content, config, user_id).await,
    }
}

/// Keep scores whose gap lies in (min, max], best first
pub fn challenge_items(scores: &[MatchScore], config: &CoreConfig) -> Vec<FeedItem> {
    let mut picked: Vec<MatchScore> = scores
        .iter()
        .filter(|s| s.difficulty_gap > config.feed.challenge_gap_min && s.difficulty_gap <= config.feed.challenge_gap_max)
        .cloned()
        .collect();
    matching::sort_best_first(&mut picked);
    picked.iter().map(FeedItem::from_match).collect()
}

async fn review_items(pool: &SqlitePool, user_id: i64, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<FeedItem>> {
    let due = memory::due(pool, user_id, now, Some(limit)).await?;
    Ok(due
        .into_iter()
        .map(|stat| FeedItem {
            item: stat.item,
            score: stat.current_retention_estimate,
            reasons: vec!["due for review".to_string()],
            next_review_at: stat.next_review_at,
        })
        .collect())
}

/// Distinct answering users per quiz
async fn popularity(pool: &SqlitePool) -> CoreResult<HashMap<i64, i64>> {
    let rows = sqlx::query(
        r#"
        SELECT "quiz_id", COUNT(DISTINCT "user_id") AS "users" FROM "events"
        WHERE "kind" = 'quiz_answer_submitted' AND "quiz_id" IS NOT NULL
        GROUP BY "quiz_id"
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> CoreResult<(i64, i64)> { Ok((row.try_get("quiz_id")?, row.try_get("users")?)) })
        .collect()
}

async fn explore_items(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
) -> CoreResult<Vec<FeedItem>> {
    let interests = content.preferences(user_id).await?.interests();
    let (_, attempted) = matching::answered_quizzes(pool, content, user_id).await?;
    let mastered = memory::mastered_items(pool, user_id, &config.memory).await?;
    let popularity = popularity(pool).await?;
    let max_users = popularity.values().copied().max().unwrap_or(0);

    let mut items: Vec<FeedItem> = content
        .published_quizzes()
        .await?
        .into_iter()
        .filter(|q| q.subject_id.map_or(true, |s| !attempted.contains(&s)))
        .filter(|q| !mastered.contains(&ItemRef::quiz(q.id)))
        .map(|q| {
            let pref = preference_alignment(&q.facets(), &interests);
            let popular = match max_users {
                0 => 0.0,
                max => popularity.get(&q.id).copied().unwrap_or(0) as f64 / max as f64,
            };
            let mut reasons = vec!["new subject".to_string()];
            if pref >= 0.5 {
                reasons.push("matches your interests".to_string());
            }
            if popular >= 0.5 {
                reasons.push("popular with learners".to_string());
            }
            FeedItem {
                item: ItemRef::quiz(q.id),
                score: round_to(pref + popular, 4),
                reasons,
                next_review_at: None,
            }
        })
        .collect();

    items.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.item.cmp(&b.item)));
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_algo::WhyToken;

    fn scored(id: i64, score: f64, gap: f64) -> MatchScore {
        MatchScore {
            user_id: 1,
            item: ItemRef::quiz(id),
            score,
            difficulty_gap: gap,
            zpd_score: None,
            preference_alignment: None,
            topic_similarity: None,
            recency_penalty: 0.0,
            why: vec![WhyToken::GoodChallenge],
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_limit_is_clamped() {
        let config = CoreConfig::default();
        assert_eq!(clamp_limit(None, &config), 20);
        assert_eq!(clamp_limit(Some(0), &config), 1);
        assert_eq!(clamp_limit(Some(500), &config), 50);
    }

    #[test]
    fn test_challenge_band_is_half_open() {
        let config = CoreConfig::default();
        let scores = vec![
            scored(1, 40.0, 100.0),
            scored(2, 30.0, 150.0),
            scored(3, 50.0, 250.0),
            scored(4, 90.0, 251.0),
            scored(5, 80.0, 20.0),
        ];
        let items = challenge_items(&scores, &config);
        let ids: Vec<i64> = items.iter().map(|i| i.item.item_id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(items[0].reasons, vec!["a good challenge".to_string()]);
    }
}
