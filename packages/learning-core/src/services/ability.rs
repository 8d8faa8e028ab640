use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use lumen_algo::sanitize::round_to;
use lumen_algo::{confidence, recent_trend, LevelBand, RatingTrack, TrendSample};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::config::CoreConfig;
use crate::content::{ContentReadModel, QuizInfo};
use crate::db::time::{from_ms, to_ms};
use crate::error::CoreResult;

/// How a profile was derived; stored alongside it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbilityDerivation {
    /// Answers whose question had no difficulty profile and were scored against the default
    pub defaulted_difficulty: i64,
    /// Answers on quizzes that no longer exist (overall only)
    pub missing_content: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAbilityProfile {
    pub user_id: i64,
    pub overall: f64,
    pub by_subject: BTreeMap<i64, f64>,
    pub by_tag: BTreeMap<String, f64>,
    pub total_attempts: i64,
    pub total_correct: i64,
    pub recent_trend: f64,
    pub confidence: f64,
    pub global_rank: Option<i64>,
    pub percentile: Option<f64>,
    pub level: LevelBand,
    pub derivation: AbilityDerivation,
    pub last_computed_at: DateTime<Utc>,
}

impl UserAbilityProfile {
    /// Profile of a user with no answers yet
    pub fn initial(user_id: i64, config: &CoreConfig, now: DateTime<Utc>) -> Self {
        let overall = config.elo.default_rating;
        Self {
            user_id,
            overall,
            by_subject: BTreeMap::new(),
            by_tag: BTreeMap::new(),
            total_attempts: 0,
            total_correct: 0,
            recent_trend: 0.0,
            confidence: 0.0,
            global_rank: None,
            percentile: None,
            level: LevelBand::from_score(overall),
            derivation: AbilityDerivation::default(),
            last_computed_at: now,
        }
    }

    /// Subject ability when tracked, overall otherwise
    pub fn for_subject(&self, subject_id: Option<i64>) -> f64 {
        subject_id
            .and_then(|s| self.by_subject.get(&s).copied())
            .unwrap_or(self.overall)
    }
}

fn profile_from_row(row: &SqliteRow) -> CoreResult<UserAbilityProfile> {
    let by_subject: String = row.try_get("by_subject")?;
    let by_tag: String = row.try_get("by_tag")?;
    let derivation: String = row.try_get("derivation")?;
    let overall: f64 = row.try_get("overall")?;
    Ok(UserAbilityProfile {
        user_id: row.try_get("user_id")?,
        overall,
        by_subject: serde_json::from_str(&by_subject)?,
        by_tag: serde_json::from_str(&by_tag)?,
        total_attempts: row.try_get("total_attempts")?,
        total_correct: row.try_get("total_correct")?,
        recent_trend: row.try_get("recent_trend")?,
        confidence: row.try_get("confidence")?,
        global_rank: row.try_get("global_rank")?,
        percentile: row.try_get("percentile")?,
        level: LevelBand::from_score(overall),
        derivation: serde_json::from_str(&derivation).unwrap_or_default(),
        last_computed_at: from_ms(row.try_get("last_computed_at")?),
    })
}

pub async fn get(pool: &SqlitePool, user_id: i64) -> CoreResult<Option<UserAbilityProfile>> {
    let row = sqlx::query(r#"SELECT * FROM "user_ability_profiles" WHERE "user_id" = ?"#)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(profile_from_row).transpose()
}

/// Stored profile, or the initial one for users never computed
pub async fn get_or_initial(pool: &SqlitePool, config: &CoreConfig, user_id: i64, now: DateTime<Utc>) -> CoreResult<UserAbilityProfile> {
    Ok(get(pool, user_id)
        .await?
        .unwrap_or_else(|| UserAbilityProfile::initial(user_id, config, now)))
}

struct AnswerRow {
    quiz_id: i64,
    is_correct: bool,
    occurred_at_ms: i64,
    difficulty: Option<f64>,
}

/// Replay a user's answers in log order against the current question difficulties
pub async fn compute_user(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<UserAbilityProfile> {
    let rows = sqlx::query(
        r#"
        SELECT e."quiz_id", e."is_correct", e."occurred_at", p."difficulty"
        FROM "events" e
        LEFT JOIN "content_difficulty_profiles" p
            ON p."item_type" = 'question' AND p."item_id" = e."question_id"
        WHERE e."user_id" = ? AND e."kind" = 'quiz_answer_submitted'
        ORDER BY e."occurred_at", e."id"
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let answers = rows
        .iter()
        .map(|row| {
            Ok(AnswerRow {
                quiz_id: row.try_get("quiz_id")?,
                is_correct: row.try_get("is_correct")?,
                occurred_at_ms: row.try_get("occurred_at")?,
                difficulty: row.try_get("difficulty")?,
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;

    let mut quizzes: HashMap<i64, Option<QuizInfo>> = HashMap::new();
    for answer in &answers {
        if !quizzes.contains_key(&answer.quiz_id) {
            quizzes.insert(answer.quiz_id, content.quiz(answer.quiz_id).await?);
        }
    }

    let params = &config.elo;
    let default_difficulty = config.difficulty.default_difficulty;
    let mut overall = RatingTrack::new(params);
    let mut subjects: BTreeMap<i64, RatingTrack> = BTreeMap::new();
    let mut tags: BTreeMap<String, RatingTrack> = BTreeMap::new();
    let mut derivation = AbilityDerivation::default();
    let mut samples = Vec::with_capacity(answers.len());

    for answer in &answers {
        let difficulty = match answer.difficulty {
            Some(d) => d,
            None => {
                derivation.defaulted_difficulty += 1;
                default_difficulty
            }
        };
        overall.observe(difficulty, answer.is_correct, params);

        match quizzes.get(&answer.quiz_id).and_then(Option::as_ref) {
            Some(quiz) => {
                if let Some(subject_id) = quiz.subject_id {
                    subjects
                        .entry(subject_id)
                        .or_insert_with(|| RatingTrack::new(params))
                        .observe(difficulty, answer.is_correct, params);
                }
                for tag in &quiz.tags {
                    tags.entry(tag.clone())
                        .or_insert_with(|| RatingTrack::new(params))
                        .observe(difficulty, answer.is_correct, params);
                }
            }
            None => derivation.missing_content += 1,
        }

        samples.push(TrendSample {
            occurred_at_ms: answer.occurred_at_ms,
            difficulty,
            correct: answer.is_correct,
        });
    }

    if derivation.defaulted_difficulty > 0 {
        tracing::debug!(
            user_id,
            defaulted = derivation.defaulted_difficulty,
            "ability computed with default difficulty for unprofiled questions"
        );
    }

    let overall_rating = round_to(overall.rating, 4);
    Ok(UserAbilityProfile {
        user_id,
        overall: overall_rating,
        by_subject: subjects.into_iter().map(|(k, t)| (k, round_to(t.rating, 4))).collect(),
        by_tag: tags.into_iter().map(|(k, t)| (k, round_to(t.rating, 4))).collect(),
        total_attempts: overall.attempts,
        total_correct: overall.correct,
        recent_trend: round_to(recent_trend(&samples, to_ms(now), config.batch.trend_window_days), 4),
        confidence: round_to(confidence(overall.attempts), 4),
        global_rank: None,
        percentile: None,
        level: LevelBand::from_score(overall_rating),
        derivation,
        last_computed_at: now,
    })
}

/// Upsert the profile; rank and percentile are kept until the next ranking pass
pub async fn save(conn: &mut SqliteConnection, profile: &UserAbilityProfile) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO "user_ability_profiles" (
            "user_id", "overall", "by_subject", "by_tag", "total_attempts", "total_correct",
            "recent_trend", "confidence", "derivation", "last_computed_at"
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("user_id") DO UPDATE SET
            "overall" = excluded."overall",
            "by_subject" = excluded."by_subject",
            "by_tag" = excluded."by_tag",
            "total_attempts" = excluded."total_attempts",
            "total_correct" = excluded."total_correct",
            "recent_trend" = excluded."recent_trend",
            "confidence" = excluded."confidence",
            "derivation" = excluded."derivation",
            "last_computed_at" = excluded."last_computed_at"
        "#,
    )
    .bind(profile.user_id)
    .bind(profile.overall)
    .bind(serde_json::to_string(&profile.by_subject)?)
    .bind(serde_json::to_string(&profile.by_tag)?)
    .bind(profile.total_attempts)
    .bind(profile.total_correct)
    .bind(profile.recent_trend)
    .bind(profile.confidence)
    .bind(serde_json::to_string(&profile.derivation)?)
    .bind(to_ms(profile.last_computed_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Percentile for 1-based `rank` among `n` users
pub fn percentile(rank: i64, n: i64) -> f64 {
    if n <= 1 {
        return 100.0;
    }
    round_to((n - rank) as f64 / (n - 1) as f64 * 100.0, 4)
}

/// Rank every profile by overall desc, then more attempts, then earlier computation
pub async fn assign_ranks(pool: &SqlitePool) -> CoreResult<usize> {
    let user_ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT "user_id" FROM "user_ability_profiles"
        ORDER BY "overall" DESC, "total_attempts" DESC, "last_computed_at" ASC, "user_id" ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let n = user_ids.len() as i64;
    let mut tx = pool.begin().await?;
    for (index, user_id) in user_ids.iter().enumerate() {
        let rank = index as i64 + 1;
        sqlx::query(r#"UPDATE "user_ability_profiles" SET "global_rank" = ?, "percentile" = ? WHERE "user_id" = ?"#)
            .bind(rank)
            .bind(percentile(rank, n))
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    tracing::info!(users = n, "ability ranks assigned");
    Ok(user_ids.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbilityChange {
    pub previous: f64,
    pub current: f64,
}

impl AbilityChange {
    pub fn delta(&self) -> f64 {
        self.current - self.previous
    }
}

/// Recompute and store one user's profile outside the weekly rebuild
pub async fn refresh_user(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<AbilityChange> {
    let previous = get(pool, user_id)
        .await?
        .map(|p| p.overall)
        .unwrap_or(config.elo.default_rating);
    let profile = compute_user(pool, content, config, user_id, now).await?;

    let mut conn = pool.acquire().await?;
    save(&mut conn, &profile).await?;

    Ok(AbilityChange {
        previous,
        current: profile.overall,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_bounds() {
        assert_eq!(percentile(1, 1), 100.0);
        assert_eq!(percentile(1, 5), 100.0);
        assert_eq!(percentile(5, 5), 0.0);
        assert_eq!(percentile(3, 5), 50.0);
    }

    #[test]
    fn test_subject_fallback() {
        let config = CoreConfig::default();
        let mut profile = UserAbilityProfile::initial(1, &config, Utc::now());
        profile.overall = 420.0;
        profile.by_subject.insert(3, 610.0);
        assert_eq!(profile.for_subject(Some(3)), 610.0);
        assert_eq!(profile.for_subject(Some(4)), 420.0);
        assert_eq!(profile.for_subject(None), 420.0);
    }
}
