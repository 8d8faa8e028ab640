use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lumen_algo::sanitize::round_to;
use lumen_algo::{profile_many, DifficultyFit, LevelBand, Observation};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::CoreConfig;
use crate::db::time::{from_ms, to_ms};
use crate::error::{CoreError, CoreResult};
use crate::events::{ItemRef, ItemType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDifficultyProfile {
    pub item: ItemRef,
    pub difficulty: f64,
    /// 0..100
    pub success_rate: f64,
    pub avg_time_seconds: Option<f64>,
    pub attempts_count: i64,
    pub confidence_weight: f64,
    pub by_segment: BTreeMap<LevelBand, f64>,
    pub level: LevelBand,
    pub last_computed_at: DateTime<Utc>,
}

impl ContentDifficultyProfile {
    fn from_fit(item: ItemRef, fit: &DifficultyFit, now: DateTime<Utc>) -> Self {
        let difficulty = round_to(fit.difficulty, 4);
        Self {
            item,
            difficulty,
            success_rate: round_to(fit.success_rate, 4),
            avg_time_seconds: fit.avg_time_seconds.map(|t| round_to(t, 4)),
            attempts_count: fit.attempts as i64,
            confidence_weight: round_to(fit.confidence_weight, 4),
            by_segment: fit.by_segment.iter().map(|(k, v)| (*k, round_to(*v, 4))).collect(),
            level: LevelBand::from_score(difficulty),
            last_computed_at: now,
        }
    }
}

fn profile_from_row(row: &SqliteRow) -> CoreResult<ContentDifficultyProfile> {
    let item_type: String = row.try_get("item_type")?;
    let item_type = ItemType::parse(&item_type)
        .ok_or_else(|| CoreError::InvalidMetadata(format!("unknown item type {item_type}")))?;
    let by_segment: String = row.try_get("by_segment")?;
    let difficulty: f64 = row.try_get("difficulty")?;
    Ok(ContentDifficultyProfile {
        item: ItemRef {
            item_type,
            item_id: row.try_get("item_id")?,
        },
        difficulty,
        success_rate: row.try_get("success_rate")?,
        avg_time_seconds: row.try_get("avg_time_seconds")?,
        attempts_count: row.try_get("attempts_count")?,
        confidence_weight: row.try_get("confidence_weight")?,
        by_segment: serde_json::from_str(&by_segment)?,
        level: LevelBand::from_score(difficulty),
        last_computed_at: from_ms(row.try_get("last_computed_at")?),
    })
}

pub async fn get(pool: &SqlitePool, item: ItemRef) -> CoreResult<Option<ContentDifficultyProfile>> {
    let row = sqlx::query(r#"SELECT * FROM "content_difficulty_profiles" WHERE "item_type" = ? AND "item_id" = ?"#)
        .bind(item.item_type.as_str())
        .bind(item.item_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(profile_from_row).transpose()
}

/// Profiles of one item type keyed by item id
pub async fn all_of_type(pool: &SqlitePool, item_type: ItemType) -> CoreResult<HashMap<i64, ContentDifficultyProfile>> {
    let rows = sqlx::query(r#"SELECT * FROM "content_difficulty_profiles" WHERE "item_type" = ?"#)
        .bind(item_type.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| profile_from_row(row).map(|p| (p.item.item_id, p)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DifficultyRebuildStats {
    pub answers: usize,
    pub questions: usize,
    pub quizzes: usize,
    pub defaulted: usize,
}

/// Refit every question and quiz from all answers in the log.
///
/// Each observation carries the answering user's current overall ability. Fitting
/// runs on a blocking thread.
pub async fn rebuild_all(pool: &SqlitePool, config: &CoreConfig, now: DateTime<Utc>) -> CoreResult<DifficultyRebuildStats> {
    let mut by_question: BTreeMap<i64, Vec<Observation>> = BTreeMap::new();
    let mut by_quiz: BTreeMap<i64, Vec<Observation>> = BTreeMap::new();
    let default_ability = config.elo.default_rating;
    let mut answers = 0usize;

    {
        let mut rows = sqlx::query(
            r#"
            SELECT e."quiz_id", e."question_id", e."is_correct",
                   json_extract(e."metadata", '$.time_spent_ms') AS "time_spent_ms",
                   a."overall"
            FROM "events" e
            LEFT JOIN "user_ability_profiles" a ON a."user_id" = e."user_id"
            WHERE e."kind" = 'quiz_answer_submitted'
            ORDER BY e."id"
            "#,
        )
        .fetch(pool);

        while let Some(row) = rows.try_next().await? {
            let quiz_id: i64 = row.try_get("quiz_id")?;
            let question_id: i64 = row.try_get("question_id")?;
            let ability: Option<f64> = row.try_get("overall")?;
            let observation = Observation {
                ability: ability.unwrap_or(default_ability),
                correct: row.try_get("is_correct")?,
                time_spent_ms: row.try_get("time_spent_ms")?,
            };
            by_question.entry(question_id).or_default().push(observation.clone());
            by_quiz.entry(quiz_id).or_default().push(observation);
            answers += 1;
        }
    }

    let items: Vec<(ItemRef, Vec<Observation>)> = by_question
        .into_iter()
        .map(|(id, obs)| (ItemRef::question(id), obs))
        .chain(by_quiz.into_iter().map(|(id, obs)| (ItemRef::quiz(id), obs)))
        .collect();

    let params = config.difficulty.clone();
    let fits = tokio::task::spawn_blocking(move || profile_many(items, &params)).await?;

    let mut stats = DifficultyRebuildStats {
        answers,
        ..Default::default()
    };
    let mut tx = pool.begin().await?;
    for (item, fit) in &fits {
        let profile = ContentDifficultyProfile::from_fit(*item, fit, now);
        sqlx::query(
            r#"
            INSERT INTO "content_difficulty_profiles" (
                "item_type", "item_id", "difficulty", "success_rate", "avg_time_seconds",
                "attempts_count", "confidence_weight", "by_segment", "last_computed_at"
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT ("item_type", "item_id") DO UPDATE SET
                "difficulty" = excluded."difficulty",
                "success_rate" = excluded."success_rate",
                "avg_time_seconds" = excluded."avg_time_seconds",
                "attempts_count" = excluded."attempts_count",
                "confidence_weight" = excluded."confidence_weight",
                "by_segment" = excluded."by_segment",
                "last_computed_at" = excluded."last_computed_at"
            "#,
        )
        .bind(profile.item.item_type.as_str())
        .bind(profile.item.item_id)
        .bind(profile.difficulty)
        .bind(profile.success_rate)
        .bind(profile.avg_time_seconds)
        .bind(profile.attempts_count)
        .bind(profile.confidence_weight)
        .bind(serde_json::to_string(&profile.by_segment)?)
        .bind(to_ms(profile.last_computed_at))
        .execute(&mut *tx)
        .await?;

        match item.item_type {
            ItemType::Question => stats.questions += 1,
            ItemType::Quiz => stats.quizzes += 1,
        }
        if fit.defaulted {
            stats.defaulted += 1;
        }
    }
    tx.commit().await?;

    tracing::info!(
        answers = stats.answers,
        questions = stats.questions,
        quizzes = stats.quizzes,
        defaulted = stats.defaulted,
        "difficulty profiles rebuilt"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::{append, AnswerSubmittedPayload, EventKind, NewEvent, TargetRef};
    use chrono::{Duration, TimeZone};

    async fn answer(pool: &SqlitePool, user_id: i64, question_id: i64, correct: bool, at: DateTime<Utc>) {
        let payload = AnswerSubmittedPayload {
            quiz_id: 1,
            question_id,
            is_correct: correct,
            attempt_index: 1,
            time_spent_ms: Some(4_000),
            quality_of_recall_used: None,
            total_questions: None,
        };
        let event = NewEvent::new(Some(user_id), EventKind::QuizAnswerSubmitted, TargetRef::question(question_id), at, &payload).unwrap();
        append(pool, event).await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_fits_questions_and_quizzes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("d.db")).await.unwrap();
        let config = CoreConfig::default();
        let t0 = Utc.with_ymd_and_hms(2026, 4, 6, 10, 0, 0).unwrap();

        // Question 10 is missed by everyone, question 11 has too few attempts to fit
        for user in 1..=4 {
            answer(db.pool(), user, 10, false, t0 + Duration::minutes(user)).await;
        }
        answer(db.pool(), 1, 11, true, t0 + Duration::hours(1)).await;

        let stats = rebuild_all(db.pool(), &config, t0 + Duration::days(1)).await.unwrap();
        assert_eq!(stats.answers, 5);
        assert_eq!(stats.questions, 2);
        assert_eq!(stats.quizzes, 1);
        assert_eq!(stats.defaulted, 1);

        let hard = get(db.pool(), ItemRef::question(10)).await.unwrap().unwrap();
        assert_eq!(hard.attempts_count, 4);
        assert_eq!(hard.success_rate, 0.0);
        assert!(hard.difficulty > config.elo.default_rating);
        assert_eq!(hard.avg_time_seconds, Some(4.0));

        let sparse = get(db.pool(), ItemRef::question(11)).await.unwrap().unwrap();
        assert_eq!(sparse.difficulty, 400.0);

        let quizzes = all_of_type(db.pool(), ItemType::Quiz).await.unwrap();
        assert_eq!(quizzes[&1].attempts_count, 5);
    }
}
