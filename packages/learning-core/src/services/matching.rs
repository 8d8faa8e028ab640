use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use lumen_algo::matching::score;
use lumen_algo::sanitize::round_to;
use lumen_algo::{cosine_similarity, mean_vector, preference_alignment, recency_penalty, Interests, MatchInputs, WhyToken};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::CoreConfig;
use crate::content::{ContentReadModel, QuizInfo};
use crate::db::time::{from_ms, to_ms};
use crate::error::{CoreError, CoreResult};
use crate::events::{ItemRef, ItemType};
use crate::services::{ability, difficulty, memory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub user_id: i64,
    pub item: ItemRef,
    /// 0..100
    pub score: f64,
    /// difficulty − ability
    pub difficulty_gap: f64,
    pub zpd_score: Option<f64>,
    pub preference_alignment: Option<f64>,
    pub topic_similarity: Option<f64>,
    pub recency_penalty: f64,
    pub why: Vec<WhyToken>,
    pub computed_at: DateTime<Utc>,
}

/// Everything about one user that scoring a candidate needs
#[derive(Debug, Clone)]
pub struct UserMatchContext {
    pub user_id: i64,
    pub ability: ability::UserAbilityProfile,
    pub interests: Interests,
    pub attempted_subjects: HashSet<i64>,
    pub mastered: HashSet<ItemRef>,
    /// Last answer time per quiz, in ms
    pub last_answered: HashMap<i64, i64>,
    pub topic_vector: Option<Vec<f64>>,
}

impl UserMatchContext {
    /// Published quizzes in a subject the user attempted or declared interest in, minus mastered ones
    pub fn is_candidate(&self, quiz: &QuizInfo) -> bool {
        if !quiz.published || self.mastered.contains(&ItemRef::quiz(quiz.id)) {
            return false;
        }
        match quiz.subject_id {
            Some(subject) => self.attempted_subjects.contains(&subject) || self.interests.subjects.contains(&subject),
            None => false,
        }
    }
}

/// Quiz ids and subjects the user has answered, with the last answer time per quiz
pub async fn answered_quizzes(pool: &SqlitePool, content: &dyn ContentReadModel, user_id: i64) -> CoreResult<(HashMap<i64, i64>, HashSet<i64>)> {
    let rows = sqlx::query(
        r#"
        SELECT "quiz_id", MAX("occurred_at") AS "last_at" FROM "events"
        WHERE "user_id" = ? AND "kind" = 'quiz_answer_submitted'
        GROUP BY "quiz_id"
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut last_answered = HashMap::with_capacity(rows.len());
    let mut subjects = HashSet::new();
    for row in &rows {
        let quiz_id: i64 = row.try_get("quiz_id")?;
        last_answered.insert(quiz_id, row.try_get::<i64, _>("last_at")?);
        if let Some(subject) = content.quiz(quiz_id).await?.and_then(|q| q.subject_id) {
            subjects.insert(subject);
        }
    }
    Ok((last_answered, subjects))
}

pub async fn load_context(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<UserMatchContext> {
    let ability = ability::get_or_initial(pool, config, user_id, now).await?;
    let interests = content.preferences(user_id).await?.interests();
    let (last_answered, attempted_subjects) = answered_quizzes(pool, content, user_id).await?;
    let mastered = memory::mastered_items(pool, user_id, &config.memory).await?;

    let strong = memory::strong(
        pool,
        user_id,
        config.memory.strong_threshold,
        config.memory.strong_min_interval_days,
        Some(config.feed.max_items as i64),
    )
    .await?;
    let mut vectors = Vec::new();
    for stat in &strong {
        if let Some(vector) = content.embedding(stat.item).await? {
            vectors.push(vector);
        }
    }

    Ok(UserMatchContext {
        user_id,
        ability,
        interests,
        attempted_subjects,
        mastered,
        last_answered,
        topic_vector: mean_vector(&vectors),
    })
}

/// Score one candidate. `difficulty` is the quiz profile's, or the default when unprofiled.
pub fn score_quiz(
    ctx: &UserMatchContext,
    quiz: &QuizInfo,
    difficulty: f64,
    embedding: Option<&[f64]>,
    config: &CoreConfig,
    now: DateTime<Utc>,
) -> MatchScore {
    let elapsed = ctx.last_answered.get(&quiz.id).map(|&at| to_ms(now) - at);
    let topic = match (ctx.topic_vector.as_deref(), embedding) {
        (Some(profile), Some(item)) => cosine_similarity(profile, item),
        _ => 0.0,
    };
    let inputs = MatchInputs {
        ability: ctx.ability.for_subject(quiz.subject_id),
        difficulty,
        preference_alignment: preference_alignment(&quiz.facets(), &ctx.interests),
        topic_similarity: topic,
        recency_penalty: recency_penalty(elapsed, &config.matching),
    };
    let breakdown = score(&inputs, &config.matching);

    MatchScore {
        user_id: ctx.user_id,
        item: ItemRef::quiz(quiz.id),
        score: round_to(breakdown.score, 4),
        difficulty_gap: round_to(breakdown.difficulty_gap, 4),
        zpd_score: Some(round_to(breakdown.zpd, 4)),
        preference_alignment: Some(round_to(breakdown.preference_alignment, 4)),
        topic_similarity: Some(round_to(breakdown.topic_similarity, 4)),
        recency_penalty: round_to(breakdown.recency_penalty, 4),
        why: breakdown.why,
        computed_at: now,
    }
}

/// Score every candidate for the user, best first. Nothing is stored.
pub async fn compute_for_user(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<Vec<MatchScore>> {
    let ctx = load_context(pool, content, config, user_id, now).await?;
    let quizzes = content.published_quizzes().await?;
    let difficulties = difficulty::all_of_type(pool, ItemType::Quiz).await?;

    let mut scores = Vec::new();
    for quiz in quizzes.iter().filter(|q| ctx.is_candidate(q)) {
        let difficulty = difficulties
            .get(&quiz.id)
            .map(|p| p.difficulty)
            .unwrap_or(config.difficulty.default_difficulty);
        let embedding = content.embedding(ItemRef::quiz(quiz.id)).await?;
        scores.push(score_quiz(&ctx, quiz, difficulty, embedding.as_deref(), config, now));
    }
    sort_best_first(&mut scores);
    Ok(scores)
}

pub fn sort_best_first(scores: &mut [MatchScore]) {
    scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.item.cmp(&b.item)));
}

/// Replace all stored scores of the user
pub async fn replace_for_user(pool: &SqlitePool, user_id: i64, scores: &[MatchScore]) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(r#"DELETE FROM "match_scores" WHERE "user_id" = ?"#)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    for s in scores {
        sqlx::query(
            r#"
            INSERT INTO "match_scores" (
                "user_id", "item_type", "item_id", "score", "difficulty_gap", "zpd_score",
                "preference_alignment", "topic_similarity", "recency_penalty", "why", "computed_at"
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.user_id)
        .bind(s.item.item_type.as_str())
        .bind(s.item.item_id)
        .bind(s.score)
        .bind(s.difficulty_gap)
        .bind(s.zpd_score)
        .bind(s.preference_alignment)
        .bind(s.topic_similarity)
        .bind(s.recency_penalty)
        .bind(serde_json::to_string(&s.why)?)
        .bind(to_ms(s.computed_at))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn score_from_row(row: &SqliteRow) -> CoreResult<MatchScore> {
    let item_type: String = row.try_get("item_type")?;
    let why: String = row.try_get("why")?;
    Ok(MatchScore {
        user_id: row.try_get("user_id")?,
        item: ItemRef {
            item_type: ItemType::parse(&item_type)
                .ok_or_else(|| CoreError::InvalidMetadata(format!("unknown item type {item_type}")))?,
            item_id: row.try_get("item_id")?,
        },
        score: row.try_get("score")?,
        difficulty_gap: row.try_get("difficulty_gap")?,
        zpd_score: row.try_get("zpd_score")?,
        preference_alignment: row.try_get("preference_alignment")?,
        topic_similarity: row.try_get("topic_similarity")?,
        recency_penalty: row.try_get("recency_penalty")?,
        why: serde_json::from_str(&why)?,
        computed_at: from_ms(row.try_get("computed_at")?),
    })
}

/// Stored scores, best first
pub async fn top_for_user(pool: &SqlitePool, user_id: i64, limit: i64) -> CoreResult<Vec<MatchScore>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM "match_scores" WHERE "user_id" = ?
        ORDER BY "score" DESC, "item_type", "item_id"
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(score_from_row).collect()
}

/// Stored scores, or a live computation when the user has none yet
pub async fn scores_or_live(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    limit: i64,
    now: DateTime<Utc>,
) -> CoreResult<Vec<MatchScore>> {
    let stored = top_for_user(pool, user_id, limit).await?;
    if !stored.is_empty() {
        return Ok(stored);
    }
    let mut live = compute_for_user(pool, content, config, user_id, now).await?;
    live.truncate(limit.max(0) as usize);
    Ok(live)
}

/// Recompute and store the user's scores; returns how many were written
pub async fn refresh_user(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<usize> {
    let scores = compute_for_user(pool, content, config, user_id, now).await?;
    replace_for_user(pool, user_id, &scores).await?;
    Ok(scores.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn quiz(id: i64, subject: i64) -> QuizInfo {
        QuizInfo {
            id,
            creator_id: 99,
            subject_id: Some(subject),
            language: Some("en".to_string()),
            tags: vec!["algebra".to_string()],
            course_id: None,
            published: true,
            question_count: 3,
            first_question_id: None,
        }
    }

    fn context(ability: f64) -> UserMatchContext {
        let config = CoreConfig::default();
        let mut profile = ability::UserAbilityProfile::initial(1, &config, Utc::now());
        profile.overall = ability;
        UserMatchContext {
            user_id: 1,
            ability: profile,
            interests: Interests::default(),
            attempted_subjects: HashSet::from([3]),
            mastered: HashSet::new(),
            last_answered: HashMap::new(),
            topic_vector: None,
        }
    }

    #[test]
    fn test_zpd_peak_ordering() {
        let config = CoreConfig::default();
        let ctx = context(500.0);
        let now = Utc::now();
        let zpd = |d: f64| score_quiz(&ctx, &quiz(1, 3), d, None, &config, now).zpd_score.unwrap();

        assert!(zpd(500.0) > zpd(580.0));
        assert!(zpd(580.0) > zpd(300.0));
        assert!(zpd(580.0) > zpd(800.0));
    }

    #[test]
    fn test_recent_answer_costs_freshness_weight() {
        let config = CoreConfig::default();
        let now = Utc::now();
        let mut ctx = context(500.0);
        let before = score_quiz(&ctx, &quiz(1, 3), 580.0, None, &config, now);

        ctx.last_answered.insert(1, to_ms(now - Duration::hours(2)));
        let after = score_quiz(&ctx, &quiz(1, 3), 580.0, None, &config, now);

        assert!((before.score - after.score - 15.0).abs() < 1e-3);
        assert_eq!(after.recency_penalty, 1.0);
    }

    #[test]
    fn test_candidates_need_subject_and_exclude_mastered() {
        let mut ctx = context(400.0);
        assert!(ctx.is_candidate(&quiz(1, 3)));
        assert!(!ctx.is_candidate(&quiz(2, 4)));

        ctx.interests.subjects.insert(4);
        assert!(ctx.is_candidate(&quiz(2, 4)));

        ctx.mastered.insert(ItemRef::quiz(1));
        assert!(!ctx.is_candidate(&quiz(1, 3)));

        let mut unpublished = quiz(5, 3);
        unpublished.published = false;
        assert!(!ctx.is_candidate(&unpublished));
    }
}
