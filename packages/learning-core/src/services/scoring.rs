use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::db::time::{from_ms, to_ms};
use crate::error::{CoreError, CoreResult};
use crate::events::{TargetKind, TargetRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoringKind {
    CorrectAnswer,
    LessonCompleted,
    CourseCompleted,
    EnrollmentFree,
    EnrollmentPremium,
    QuizFirstAttempt,
    StandaloneLesson,
}

impl ScoringKind {
    pub const ALL: [ScoringKind; 7] = [
        ScoringKind::CorrectAnswer,
        ScoringKind::LessonCompleted,
        ScoringKind::CourseCompleted,
        ScoringKind::EnrollmentFree,
        ScoringKind::EnrollmentPremium,
        ScoringKind::QuizFirstAttempt,
        ScoringKind::StandaloneLesson,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringKind::CorrectAnswer => "CORRECT_ANSWER",
            ScoringKind::LessonCompleted => "LESSON_COMPLETED",
            ScoringKind::CourseCompleted => "COURSE_COMPLETED",
            ScoringKind::EnrollmentFree => "ENROLLMENT_FREE",
            ScoringKind::EnrollmentPremium => "ENROLLMENT_PREMIUM",
            ScoringKind::QuizFirstAttempt => "QUIZ_FIRST_ATTEMPT",
            ScoringKind::StandaloneLesson => "STANDALONE_LESSON",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ScoringKind::ALL.into_iter().find(|k| k.as_str() == value)
    }

    pub fn role(&self) -> Role {
        match self {
            ScoringKind::CorrectAnswer | ScoringKind::LessonCompleted | ScoringKind::CourseCompleted => Role::Student,
            _ => Role::Teacher,
        }
    }

    pub fn points(&self) -> i64 {
        match self {
            ScoringKind::CourseCompleted | ScoringKind::EnrollmentPremium => 3,
            ScoringKind::EnrollmentFree => 2,
            _ => 1,
        }
    }
}

/// A ledger award before insertion. Constructors fix the dedupe key per rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Award {
    pub user_id: i64,
    pub kind: ScoringKind,
    pub target: TargetRef,
    pub event_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub dedupe_key: String,
}

impl Award {
    fn new(user_id: i64, kind: ScoringKind, target: TargetRef, natural_key: String, event_id: i64, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            kind,
            target,
            event_id,
            occurred_at: at,
            dedupe_key: format!("{}:{}:{}", kind.role().as_str(), kind.as_str(), natural_key),
        }
    }

    pub fn correct_answer(student_id: i64, question_id: i64, event_id: i64, at: DateTime<Utc>) -> Self {
        Self::new(
            student_id,
            ScoringKind::CorrectAnswer,
            TargetRef::question(question_id),
            question_id.to_string(),
            event_id,
            at,
        )
    }

    pub fn lesson_completed(student_id: i64, lesson_id: i64, event_id: i64, at: DateTime<Utc>) -> Self {
        Self::new(
            student_id,
            ScoringKind::LessonCompleted,
            TargetRef::lesson(lesson_id),
            lesson_id.to_string(),
            event_id,
            at,
        )
    }

    pub fn course_completed(student_id: i64, course_id: i64, event_id: i64, at: DateTime<Utc>) -> Self {
        Self::new(
            student_id,
            ScoringKind::CourseCompleted,
            TargetRef::course(course_id),
            course_id.to_string(),
            event_id,
            at,
        )
    }

    pub fn enrollment(creator_id: i64, enrollment_id: i64, premium: bool, event_id: i64, at: DateTime<Utc>) -> Self {
        let kind = if premium {
            ScoringKind::EnrollmentPremium
        } else {
            ScoringKind::EnrollmentFree
        };
        Self::new(
            creator_id,
            kind,
            TargetRef::enrollment(enrollment_id),
            enrollment_id.to_string(),
            event_id,
            at,
        )
    }

    pub fn quiz_first_attempt(creator_id: i64, quiz_id: i64, student_id: i64, event_id: i64, at: DateTime<Utc>) -> Self {
        Self::new(
            creator_id,
            ScoringKind::QuizFirstAttempt,
            TargetRef::quiz(quiz_id),
            format!("{quiz_id}:{student_id}"),
            event_id,
            at,
        )
    }

    pub fn standalone_lesson(creator_id: i64, lesson_id: i64, event_id: i64, at: DateTime<Utc>) -> Self {
        Self::new(
            creator_id,
            ScoringKind::StandaloneLesson,
            TargetRef::lesson(lesson_id),
            lesson_id.to_string(),
            event_id,
            at,
        )
    }
}

/// Insert unless the dedupe key was already awarded. True when a row was added.
pub async fn award(conn: &mut SqliteConnection, award: &Award) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO "scoring_entries"
            ("user_id", "role", "kind", "points", "target_kind", "target_id", "event_id", "occurred_at", "dedupe_key")
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(award.user_id)
    .bind(award.kind.role().as_str())
    .bind(award.kind.as_str())
    .bind(award.kind.points())
    .bind(award.target.kind.as_str())
    .bind(award.target.id)
    .bind(award.event_id)
    .bind(to_ms(award.occurred_at))
    .bind(&award.dedupe_key)
    .execute(&mut *conn)
    .await?;

    let inserted = result.rows_affected() > 0;
    if inserted {
        tracing::debug!(
            user_id = award.user_id,
            kind = award.kind.as_str(),
            points = award.kind.points(),
            "scoring entry awarded"
        );
    }
    Ok(inserted)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringEntry {
    pub id: i64,
    pub user_id: i64,
    pub role: Role,
    pub kind: ScoringKind,
    pub points: i64,
    pub target: TargetRef,
    pub event_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub dedupe_key: String,
}

pub async fn entries_for_user(pool: &SqlitePool, user_id: i64) -> CoreResult<Vec<ScoringEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT "id", "user_id", "role", "kind", "points", "target_kind", "target_id", "event_id", "occurred_at", "dedupe_key"
        FROM "scoring_entries" WHERE "user_id" = ? ORDER BY "id"
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let role: String = row.try_get("role")?;
            let kind: String = row.try_get("kind")?;
            let target_kind: String = row.try_get("target_kind")?;
            Ok(ScoringEntry {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                role: Role::parse(&role).ok_or_else(|| CoreError::InvalidMetadata(format!("role {role}")))?,
                kind: ScoringKind::parse(&kind).ok_or_else(|| CoreError::InvalidMetadata(format!("scoring kind {kind}")))?,
                points: row.try_get("points")?,
                target: TargetRef {
                    kind: TargetKind::parse(&target_kind)
                        .ok_or_else(|| CoreError::InvalidMetadata(format!("target kind {target_kind}")))?,
                    id: row.try_get("target_id")?,
                },
                event_id: row.try_get("event_id")?,
                occurred_at: from_ms(row.try_get("occurred_at")?),
                dedupe_key: row.try_get("dedupe_key")?,
            })
        })
        .collect()
}

pub async fn total_points(pool: &SqlitePool, user_id: i64, role: Role) -> CoreResult<i64> {
    let total: i64 = sqlx::query_scalar(
        r#"SELECT COALESCE(SUM("points"), 0) FROM "scoring_entries" WHERE "user_id" = ? AND "role" = ?"#,
    )
    .bind(user_id)
    .bind(role.as_str())
    .fetch_one(pool)
    .await?;
    Ok(total)
}

/// Consecutive days ending at `today` that contain at least one entry
pub fn streak(days: &BTreeSet<NaiveDate>, today: NaiveDate) -> i64 {
    let mut count = 0;
    let mut cursor = today;
    while days.contains(&cursor) {
        count += 1;
        match cursor.pred_opt() {
            Some(prev) => cursor = prev,
            None => break,
        }
    }
    count
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoints {
    pub date: NaiveDate,
    pub learning: i64,
    pub impact: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressOverview {
    pub learning_score: i64,
    pub impact_score: i64,
    pub learning_30d: i64,
    pub impact_30d: i64,
    /// Points per ledger kind over the last 30 days
    pub breakdown_30d: BTreeMap<ScoringKind, i64>,
    /// One entry per day of the window, oldest first
    pub daily: Vec<DailyPoints>,
    pub student_streak: i64,
    pub teacher_streak: i64,
}

const OVERVIEW_WINDOW_DAYS: i64 = 30;

pub async fn overview(pool: &SqlitePool, user_id: i64, now: DateTime<Utc>) -> CoreResult<ProgressOverview> {
    let learning_score = total_points(pool, user_id, Role::Student).await?;
    let impact_score = total_points(pool, user_id, Role::Teacher).await?;

    let today = now.date_naive();
    let window_start_day = today - Duration::days(OVERVIEW_WINDOW_DAYS - 1);
    let window_start = crate::db::time::day_start(window_start_day);

    let rows = sqlx::query(
        r#"SELECT "role", "kind", "points", "occurred_at" FROM "scoring_entries"
           WHERE "user_id" = ? AND "occurred_at" >= ? AND "occurred_at" <= ?"#,
    )
    .bind(user_id)
    .bind(to_ms(window_start))
    .bind(to_ms(now))
    .fetch_all(pool)
    .await?;

    let mut breakdown: BTreeMap<ScoringKind, i64> = BTreeMap::new();
    let mut per_day: BTreeMap<NaiveDate, (i64, i64)> = BTreeMap::new();
    let (mut learning_30d, mut impact_30d) = (0, 0);
    for row in &rows {
        let kind: String = row.try_get("kind")?;
        let Some(kind) = ScoringKind::parse(&kind) else {
            continue;
        };
        let points: i64 = row.try_get("points")?;
        let day = from_ms(row.try_get("occurred_at")?).date_naive();
        *breakdown.entry(kind).or_default() += points;
        let slot = per_day.entry(day).or_default();
        match kind.role() {
            Role::Student => {
                learning_30d += points;
                slot.0 += points;
            }
            Role::Teacher => {
                impact_30d += points;
                slot.1 += points;
            }
        }
    }

    let daily = (0..OVERVIEW_WINDOW_DAYS)
        .map(|offset| {
            let date = window_start_day + Duration::days(offset);
            let (learning, impact) = per_day.get(&date).copied().unwrap_or_default();
            DailyPoints { date, learning, impact }
        })
        .collect();

    Ok(ProgressOverview {
        learning_score,
        impact_score,
        learning_30d,
        impact_30d,
        breakdown_30d: breakdown,
        daily,
        student_streak: role_streak(pool, user_id, Role::Student, today).await?,
        teacher_streak: role_streak(pool, user_id, Role::Teacher, today).await?,
    })
}

async fn role_streak(pool: &SqlitePool, user_id: i64, role: Role, today: NaiveDate) -> CoreResult<i64> {
    let times: Vec<i64> = sqlx::query_scalar(
        r#"SELECT "occurred_at" FROM "scoring_entries" WHERE "user_id" = ? AND "role" = ? ORDER BY "occurred_at" DESC"#,
    )
    .bind(user_id)
    .bind(role.as_str())
    .fetch_all(pool)
    .await?;
    let days: BTreeSet<NaiveDate> = times.into_iter().map(|ms| from_ms(ms).date_naive()).collect();
    Ok(streak(&days, today))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::TimeZone;

    #[test]
    fn test_dedupe_keys() {
        let at = Utc::now();
        assert_eq!(Award::correct_answer(1, 42, 9, at).dedupe_key, "student:CORRECT_ANSWER:42");
        assert_eq!(
            Award::quiz_first_attempt(5, 7, 1, 9, at).dedupe_key,
            "teacher:QUIZ_FIRST_ATTEMPT:7:1"
        );
        assert_eq!(Award::enrollment(5, 3, true, 9, at).dedupe_key, "teacher:ENROLLMENT_PREMIUM:3");
        assert_eq!(Award::enrollment(5, 3, false, 9, at).kind.points(), 2);
        assert_eq!(ScoringKind::CourseCompleted.points(), 3);
    }

    #[test]
    fn test_streak_requires_today() {
        let today = NaiveDate::from_ymd_opt(2026, 4, 10).unwrap();
        let mut days = BTreeSet::new();
        assert_eq!(streak(&days, today), 0);
        days.insert(today.pred_opt().unwrap());
        assert_eq!(streak(&days, today), 0);
        days.insert(today);
        days.insert(today - Duration::days(3));
        assert_eq!(streak(&days, today), 2);
    }

    #[tokio::test]
    async fn test_award_is_idempotent_and_summed() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("l.db")).await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        assert!(award(&mut conn, &Award::correct_answer(1, 42, 1, now)).await.unwrap());
        assert!(!award(&mut conn, &Award::correct_answer(1, 42, 2, now)).await.unwrap());
        assert!(award(&mut conn, &Award::correct_answer(2, 42, 3, now)).await.unwrap());
        assert!(award(&mut conn, &Award::enrollment(1, 8, true, 4, now)).await.unwrap());
        drop(conn);

        let overview = overview(db.pool(), 1, now).await.unwrap();
        assert_eq!(overview.learning_score, 1);
        assert_eq!(overview.impact_score, 3);
        assert_eq!(overview.breakdown_30d.get(&ScoringKind::EnrollmentPremium), Some(&3));
        assert_eq!(overview.daily.len(), 30);
        assert_eq!(overview.daily.last().map(|d| d.learning), Some(1));
        assert_eq!(overview.student_streak, 1);
        assert_eq!(overview.teacher_streak, 1);
    }
}
