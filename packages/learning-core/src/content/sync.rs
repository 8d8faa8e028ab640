//! Host-side upserts into the content read model. Every change appends a
//! `content_changed` system event in the same transaction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::CoreResult;
use crate::events::{self, ContentChange, ContentChangedPayload, EventKind, NewEvent, TargetRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizRecord {
    pub id: i64,
    pub creator_id: i64,
    pub title: String,
    pub subject_id: Option<i64>,
    pub language: Option<String>,
    pub tags: Vec<String>,
    pub course_id: Option<i64>,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub id: i64,
    pub quiz_id: i64,
    pub question_type: String,
    pub correct_answer: Value,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonRecord {
    pub id: i64,
    pub course_id: Option<i64>,
    pub creator_id: i64,
    pub title: String,
    pub published: bool,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseRecord {
    pub id: i64,
    pub creator_id: i64,
    pub title: String,
    pub is_premium: bool,
    pub published: bool,
}

fn publication_change(previous: Option<bool>, published: bool) -> ContentChange {
    match (previous, published) {
        (Some(true), false) => ContentChange::Unpublished,
        (Some(false) | None, true) => ContentChange::Published,
        _ => ContentChange::Updated,
    }
}

async fn record_change(conn: &mut SqliteConnection, target: TargetRef, change: ContentChange) -> CoreResult<()> {
    let event = NewEvent::new(
        None,
        EventKind::ContentChanged,
        target,
        Utc::now(),
        &ContentChangedPayload { change },
    )?;
    events::append_in(conn, event).await?;
    Ok(())
}

async fn previous_published(conn: &mut SqliteConnection, table: &str, id: i64) -> CoreResult<Option<bool>> {
    let sql = format!(r#"SELECT "published" FROM "{table}" WHERE "id" = ?"#);
    let published = sqlx::query_scalar(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(published)
}

/// Returns the publication change recorded for the quiz
pub async fn upsert_quiz(pool: &SqlitePool, quiz: &QuizRecord) -> CoreResult<ContentChange> {
    let mut tx = pool.begin().await?;
    let change = publication_change(previous_published(&mut tx, "quizzes", quiz.id).await?, quiz.published);

    sqlx::query(
        r#"
        INSERT INTO "quizzes" ("id", "creator_id", "title", "subject_id", "language", "tags", "course_id", "published")
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("id") DO UPDATE SET
            "creator_id" = excluded."creator_id",
            "title" = excluded."title",
            "subject_id" = excluded."subject_id",
            "language" = excluded."language",
            "tags" = excluded."tags",
            "course_id" = excluded."course_id",
            "published" = excluded."published"
        "#,
    )
    .bind(quiz.id)
    .bind(quiz.creator_id)
    .bind(&quiz.title)
    .bind(quiz.subject_id)
    .bind(&quiz.language)
    .bind(serde_json::to_string(&quiz.tags)?)
    .bind(quiz.course_id)
    .bind(quiz.published)
    .execute(&mut *tx)
    .await?;

    record_change(&mut tx, TargetRef::quiz(quiz.id), change).await?;
    tx.commit().await?;

    tracing::debug!(quiz_id = quiz.id, change = ?change, "quiz synced");
    Ok(change)
}

/// Removes a quiz and its questions; open sessions on it stay frozen
pub async fn delete_quiz(pool: &SqlitePool, quiz_id: i64) -> CoreResult<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query(r#"DELETE FROM "questions" WHERE "quiz_id" = ?"#)
        .bind(quiz_id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query(r#"DELETE FROM "quizzes" WHERE "id" = ?"#)
        .bind(quiz_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
        > 0;
    if deleted {
        record_change(&mut tx, TargetRef::quiz(quiz_id), ContentChange::Deleted).await?;
    }
    tx.commit().await?;
    Ok(deleted)
}

pub async fn upsert_question(pool: &SqlitePool, question: &QuestionRecord) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    let existed: Option<i64> = sqlx::query_scalar(r#"SELECT "id" FROM "questions" WHERE "id" = ?"#)
        .bind(question.id)
        .fetch_optional(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO "questions" ("id", "quiz_id", "question_type", "correct_answer", "position")
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT ("id") DO UPDATE SET
            "quiz_id" = excluded."quiz_id",
            "question_type" = excluded."question_type",
            "correct_answer" = excluded."correct_answer",
            "position" = excluded."position"
        "#,
    )
    .bind(question.id)
    .bind(question.quiz_id)
    .bind(&question.question_type)
    .bind(serde_json::to_string(&question.correct_answer)?)
    .bind(question.position)
    .execute(&mut *tx)
    .await?;

    let change = if existed.is_some() {
        ContentChange::Updated
    } else {
        ContentChange::Published
    };
    record_change(&mut tx, TargetRef::question(question.id), change).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn upsert_lesson(pool: &SqlitePool, lesson: &LessonRecord) -> CoreResult<ContentChange> {
    let mut tx = pool.begin().await?;
    let change = publication_change(previous_published(&mut tx, "lessons", lesson.id).await?, lesson.published);

    sqlx::query(
        r#"
        INSERT INTO "lessons" ("id", "course_id", "creator_id", "title", "published", "position")
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT ("id") DO UPDATE SET
            "course_id" = excluded."course_id",
            "creator_id" = excluded."creator_id",
            "title" = excluded."title",
            "published" = excluded."published",
            "position" = excluded."position"
        "#,
    )
    .bind(lesson.id)
    .bind(lesson.course_id)
    .bind(lesson.creator_id)
    .bind(&lesson.title)
    .bind(lesson.published)
    .bind(lesson.position)
    .execute(&mut *tx)
    .await?;

    record_change(&mut tx, TargetRef::lesson(lesson.id), change).await?;
    tx.commit().await?;
    Ok(change)
}

pub async fn upsert_course(pool: &SqlitePool, course: &CourseRecord) -> CoreResult<ContentChange> {
    let mut tx = pool.begin().await?;
    let change = publication_change(previous_published(&mut tx, "courses", course.id).await?, course.published);

    sqlx::query(
        r#"
        INSERT INTO "courses" ("id", "creator_id", "title", "is_premium", "published")
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT ("id") DO UPDATE SET
            "creator_id" = excluded."creator_id",
            "title" = excluded."title",
            "is_premium" = excluded."is_premium",
            "published" = excluded."published"
        "#,
    )
    .bind(course.id)
    .bind(course.creator_id)
    .bind(&course.title)
    .bind(course.is_premium)
    .bind(course.published)
    .execute(&mut *tx)
    .await?;

    record_change(&mut tx, TargetRef::course(course.id), change).await?;
    tx.commit().await?;
    Ok(change)
}

/// Preferences are user data, not content; no change event is recorded
pub async fn set_preferences(
    pool: &SqlitePool,
    user_id: i64,
    interested_subjects: &[i64],
    interested_tags: &[String],
    languages: &[String],
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO "user_preferences" ("user_id", "interested_subjects", "interested_tags", "languages")
        VALUES (?, ?, ?, ?)
        ON CONFLICT ("user_id") DO UPDATE SET
            "interested_subjects" = excluded."interested_subjects",
            "interested_tags" = excluded."interested_tags",
            "languages" = excluded."languages"
        "#,
    )
    .bind(user_id)
    .bind(serde_json::to_string(interested_subjects)?)
    .bind(serde_json::to_string(interested_tags)?)
    .bind(serde_json::to_string(languages)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_embedding(pool: &SqlitePool, item: crate::events::ItemRef, vector: &[f64]) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO "item_embeddings" ("item_type", "item_id", "vector") VALUES (?, ?, ?)
        ON CONFLICT ("item_type", "item_id") DO UPDATE SET "vector" = excluded."vector"
        "#,
    )
    .bind(item.item_type.as_str())
    .bind(item.item_id)
    .bind(serde_json::to_string(vector)?)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_change() {
        assert_eq!(publication_change(None, true), ContentChange::Published);
        assert_eq!(publication_change(Some(false), true), ContentChange::Published);
        assert_eq!(publication_change(Some(true), true), ContentChange::Updated);
        assert_eq!(publication_change(Some(true), false), ContentChange::Unpublished);
        assert_eq!(publication_change(None, false), ContentChange::Updated);
    }
}
