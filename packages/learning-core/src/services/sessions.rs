use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::content::QuizInfo;
use crate::db::time::{from_ms, opt_from_ms, to_ms};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSessionProgress {
    pub session_id: Uuid,
    pub user_id: i64,
    pub quiz_id: i64,
    pub total_questions: i64,
    pub answered_count: i64,
    pub correct_count: i64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const SESSION_COLUMNS: &str = r#""session_id", "user_id", "quiz_id", "total_questions", "answered_count",
    "correct_count", "status", "started_at", "completed_at""#;

fn session_from_row(row: &SqliteRow) -> CoreResult<QuizSessionProgress> {
    let session_id: String = row.try_get("session_id")?;
    let status: String = row.try_get("status")?;
    Ok(QuizSessionProgress {
        session_id: Uuid::parse_str(&session_id)
            .map_err(|e| CoreError::InvalidMetadata(format!("stored session id {session_id}: {e}")))?,
        user_id: row.try_get("user_id")?,
        quiz_id: row.try_get("quiz_id")?,
        total_questions: row.try_get("total_questions")?,
        answered_count: row.try_get("answered_count")?,
        correct_count: row.try_get("correct_count")?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| CoreError::InvalidMetadata(format!("unknown session status {status}")))?,
        started_at: from_ms(row.try_get("started_at")?),
        completed_at: opt_from_ms(row.try_get("completed_at")?),
    })
}

pub async fn get(conn: &mut SqliteConnection, session_id: Uuid) -> CoreResult<Option<QuizSessionProgress>> {
    let sql = format!(r#"SELECT {SESSION_COLUMNS} FROM "quiz_session_progress" WHERE "session_id" = ?"#);
    let row = sqlx::query(&sql)
        .bind(session_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(session_from_row).transpose()
}

pub async fn list_for_user(pool: &SqlitePool, user_id: i64, quiz_id: Option<i64>) -> CoreResult<Vec<QuizSessionProgress>> {
    let sql = format!(
        r#"SELECT {SESSION_COLUMNS} FROM "quiz_session_progress"
           WHERE "user_id" = ? AND (? IS NULL OR "quiz_id" = ?)
           ORDER BY "started_at", "session_id""#
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(quiz_id)
        .bind(quiz_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(session_from_row).collect()
}

/// Create the row if this session has none yet; an existing row is left untouched
pub async fn ensure(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    user_id: i64,
    quiz_id: i64,
    total_questions: i64,
    started_at: DateTime<Utc>,
) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO "quiz_session_progress"
            ("session_id", "user_id", "quiz_id", "total_questions", "answered_count", "correct_count", "status", "started_at")
        VALUES (?, ?, ?, ?, 0, 0, 'in_progress', ?)
        "#,
    )
    .bind(session_id.to_string())
    .bind(user_id)
    .bind(quiz_id)
    .bind(total_questions.max(0))
    .bind(to_ms(started_at))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Count one answer event. False when the event was already counted, or the
/// session is closed or already full.
pub async fn increment(conn: &mut SqliteConnection, session_id: Uuid, event_id: i64, is_correct: bool) -> CoreResult<bool> {
    let logged = sqlx::query(r#"INSERT OR IGNORE INTO "session_answer_log" ("event_id", "session_id") VALUES (?, ?)"#)
        .bind(event_id)
        .bind(session_id.to_string())
        .execute(&mut *conn)
        .await?;
    if logged.rows_affected() == 0 {
        return Ok(false);
    }

    let result = sqlx::query(
        r#"
        UPDATE "quiz_session_progress"
        SET "answered_count" = "answered_count" + 1,
            "correct_count" = "correct_count" + ?
        WHERE "session_id" = ? AND "status" = 'in_progress' AND "answered_count" < "total_questions"
        "#,
    )
    .bind(i64::from(is_correct))
    .bind(session_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Compare-and-set to `completed`. Exactly one caller per session sees `true`.
pub async fn try_complete(conn: &mut SqliteConnection, session_id: Uuid, completed_at: DateTime<Utc>) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE "quiz_session_progress"
        SET "status" = 'completed', "completed_at" = ?
        WHERE "session_id" = ? AND "status" = 'in_progress' AND "answered_count" >= "total_questions"
        "#,
    )
    .bind(to_ms(completed_at))
    .bind(session_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Most recent open session for (user, quiz), with its answered count
async fn latest_open(conn: &mut SqliteConnection, user_id: i64, quiz_id: i64) -> CoreResult<Option<(Uuid, i64)>> {
    let row = sqlx::query(
        r#"
        SELECT "session_id", "answered_count" FROM "quiz_session_progress"
        WHERE "user_id" = ? AND "quiz_id" = ? AND "status" = 'in_progress'
        ORDER BY "started_at" DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(quiz_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let raw: String = row.try_get("session_id")?;
    let answered: i64 = row.try_get("answered_count")?;
    Ok(Uuid::parse_str(&raw).ok().map(|id| (id, answered)))
}

/// Session an incoming answer belongs to.
///
/// The first question of a quiz opens a new attempt unless `start_quiz` already
/// opened one that has no answers yet. Any other question continues the most recent
/// open attempt, or opens one when there is none.
pub async fn resolve_for_answer(
    conn: &mut SqliteConnection,
    user_id: i64,
    quiz: Option<&QuizInfo>,
    quiz_id: i64,
    question_id: i64,
) -> CoreResult<Uuid> {
    let open = latest_open(conn, user_id, quiz_id).await?;
    let is_first = quiz.and_then(|q| q.first_question_id) == Some(question_id);

    let session_id = match open {
        Some((id, 0)) => id,
        Some((id, _)) if !is_first => id,
        _ => Uuid::new_v4(),
    };
    Ok(session_id)
}

/// Session opened today by `start_quiz`, if any
pub async fn started_on_day(
    conn: &mut SqliteConnection,
    user_id: i64,
    quiz_id: i64,
    day: (DateTime<Utc>, DateTime<Utc>),
) -> CoreResult<Option<Uuid>> {
    let raw: Option<String> = sqlx::query_scalar(
        r#"
        SELECT "session_id" FROM "events"
        WHERE "user_id" = ? AND "kind" = 'quiz_started' AND "quiz_id" = ?
          AND "occurred_at" >= ? AND "occurred_at" < ? AND "session_id" IS NOT NULL
        ORDER BY "occurred_at", "id"
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(quiz_id)
    .bind(to_ms(day.0))
    .bind(to_ms(day.1))
    .fetch_optional(&mut *conn)
    .await?;
    Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
}
