//! Lesson and course completions, enrollments.
//!
//! A course counts as completed once the user's completed lessons cover every
//! lesson currently published in it. The check runs after the lesson's transaction
//! commits; lessons added later never revoke or re-award.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::content::{ContentReadModel, CourseInfo, LessonInfo};
use crate::core::{self as bus, CoreEvent};
use crate::db::time::{from_ms, to_ms};
use crate::error::CoreResult;
use crate::events::{
    self, CourseCompletedPayload, EnrollmentCreatedPayload, Event, EventKind, LessonCompletedPayload, NewEvent,
    TargetRef,
};
use crate::services::scoring::{self, Award};
use crate::services::Deps;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonCompletion {
    pub newly_completed: bool,
    pub completed_at: DateTime<Utc>,
}

async fn completed_at(conn: &mut SqliteConnection, user_id: i64, lesson_id: i64) -> CoreResult<Option<DateTime<Utc>>> {
    let at: Option<i64> = sqlx::query_scalar(
        r#"SELECT "completed_at" FROM "lesson_completions" WHERE "user_id" = ? AND "lesson_id" = ?"#,
    )
    .bind(user_id)
    .bind(lesson_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(at.map(from_ms))
}

/// Projection row and ledger awards for a logged lesson completion.
/// Returns false when the user had already completed the lesson.
pub async fn apply_lesson_completed(
    conn: &mut SqliteConnection,
    lesson: Option<&LessonInfo>,
    event: &Event,
    payload: &LessonCompletedPayload,
) -> CoreResult<bool> {
    let Some(user_id) = event.user_id else {
        return Ok(false);
    };
    let at = event.occurred_at;
    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO "lesson_completions" ("user_id", "lesson_id", "course_id", "event_id", "completed_at")
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(payload.lesson_id)
    .bind(payload.course_id)
    .bind(event.event_id)
    .bind(to_ms(at))
    .execute(&mut *conn)
    .await?
    .rows_affected()
        > 0;

    if !inserted {
        return Ok(false);
    }
    let Some(lesson) = lesson else {
        debug!(lesson_id = payload.lesson_id, "unknown lesson, no awards");
        return Ok(true);
    };

    scoring::award(conn, &Award::lesson_completed(user_id, lesson.id, event.event_id, at)).await?;
    if lesson.course_id.is_none() && lesson.creator_id != user_id {
        scoring::award(conn, &Award::standalone_lesson(lesson.creator_id, lesson.id, event.event_id, at)).await?;
    }
    Ok(true)
}

pub async fn mark_lesson_complete(deps: Deps<'_>, user_id: i64, lesson_id: i64, now: DateTime<Utc>) -> CoreResult<LessonCompletion> {
    let lesson = deps.content.lesson(lesson_id).await?;
    let mut tx = deps.pool.begin().await?;

    if let Some(at) = completed_at(&mut tx, user_id, lesson_id).await? {
        return Ok(LessonCompletion {
            newly_completed: false,
            completed_at: at,
        });
    }

    let course_id = lesson.as_ref().and_then(|l| l.course_id);
    let payload = LessonCompletedPayload { lesson_id, course_id };
    let event = NewEvent::new(Some(user_id), EventKind::LessonCompleted, TargetRef::lesson(lesson_id), now, &payload)?;
    let event = events::append_in(&mut tx, event).await?;
    apply_lesson_completed(&mut tx, lesson.as_ref(), &event, &payload).await?;
    tx.commit().await?;

    deps.bus
        .publish(CoreEvent::LessonCompleted(bus::LessonCompletedPayload {
            user_id,
            lesson_id,
            course_id,
        }))
        .await;

    if let Some(course_id) = course_id {
        if let Err(e) = check_course_completion(deps, user_id, course_id, event.occurred_at).await {
            warn!(user_id, course_id, error = %e, "course completion check failed");
        }
    }

    Ok(LessonCompletion {
        newly_completed: true,
        completed_at: event.occurred_at,
    })
}

/// True when `completed` covers a non-empty published set
pub fn covers_course(published: &[i64], completed: &HashSet<i64>) -> bool {
    !published.is_empty() && published.iter().all(|id| completed.contains(id))
}

/// Record the course completion once. Returns the new `course_completed` event, if any.
pub async fn check_course_completion(
    deps: Deps<'_>,
    user_id: i64,
    course_id: i64,
    at: DateTime<Utc>,
) -> CoreResult<Option<Event>> {
    let published = deps.content.published_lesson_ids(course_id).await?;
    let mut tx = deps.pool.begin().await?;

    let done: Vec<i64> = sqlx::query_scalar(r#"SELECT "lesson_id" FROM "lesson_completions" WHERE "user_id" = ?"#)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
    if !covers_course(&published, &done.into_iter().collect()) {
        return Ok(None);
    }

    let already: Option<i64> = sqlx::query_scalar(
        r#"SELECT 1 FROM "course_completions" WHERE "user_id" = ? AND "course_id" = ?"#,
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(&mut *tx)
    .await?;
    if already.is_some() {
        return Ok(None);
    }

    let event = NewEvent::new(
        Some(user_id),
        EventKind::CourseCompleted,
        TargetRef::course(course_id),
        at,
        &CourseCompletedPayload { course_id },
    )?;
    let event = events::append_in(&mut tx, event).await?;
    if !apply_course_completed(&mut tx, &event, course_id).await? {
        // lost the race to a concurrent check; dropping the tx discards our event
        return Ok(None);
    }
    tx.commit().await?;

    info!(user_id, course_id, "course completed");
    deps.bus
        .publish(CoreEvent::CourseCompleted(bus::CourseCompletedPayload { user_id, course_id }))
        .await;
    Ok(Some(event))
}

/// Projection row and +3 award for a logged course completion
pub async fn apply_course_completed(conn: &mut SqliteConnection, event: &Event, course_id: i64) -> CoreResult<bool> {
    let Some(user_id) = event.user_id else {
        return Ok(false);
    };
    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO "course_completions" ("user_id", "course_id", "event_id", "completed_at")
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(course_id)
    .bind(event.event_id)
    .bind(to_ms(event.occurred_at))
    .execute(&mut *conn)
    .await?
    .rows_affected()
        > 0;

    if inserted {
        scoring::award(conn, &Award::course_completed(user_id, course_id, event.event_id, event.occurred_at)).await?;
    }
    Ok(inserted)
}

/// Teacher award for a logged enrollment; creators enrolling in their own course earn nothing
pub async fn apply_enrollment(
    conn: &mut SqliteConnection,
    course: Option<&CourseInfo>,
    event: &Event,
    payload: &EnrollmentCreatedPayload,
) -> CoreResult<bool> {
    let (Some(user_id), Some(course)) = (event.user_id, course) else {
        return Ok(false);
    };
    if course.creator_id == user_id {
        return Ok(false);
    }
    scoring::award(
        conn,
        &Award::enrollment(course.creator_id, payload.enrollment_id, course.is_premium, event.event_id, event.occurred_at),
    )
    .await
}

/// Log an enrollment once per `enrollment_id`. Returns false for a repeat.
pub async fn record_enrollment(
    deps: Deps<'_>,
    enrollment_id: i64,
    user_id: i64,
    course_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<bool> {
    let course = deps.content.course(course_id).await?;
    let mut tx = deps.pool.begin().await?;

    let seen: Option<i64> = sqlx::query_scalar(
        r#"SELECT 1 FROM "events" WHERE "kind" = 'enrollment_created' AND "target_kind" = 'enrollment' AND "target_id" = ?"#,
    )
    .bind(enrollment_id)
    .fetch_optional(&mut *tx)
    .await?;
    if seen.is_some() {
        return Ok(false);
    }

    let payload = EnrollmentCreatedPayload { enrollment_id, course_id };
    let event = NewEvent::new(
        Some(user_id),
        EventKind::EnrollmentCreated,
        TargetRef::enrollment(enrollment_id),
        now,
        &payload,
    )?;
    let event = events::append_in(&mut tx, event).await?;
    apply_enrollment(&mut tx, course.as_ref(), &event, &payload).await?;
    tx.commit().await?;
    Ok(true)
}

/// Replay helpers look content up themselves
pub async fn replay_lesson_completed(
    conn: &mut SqliteConnection,
    content: &dyn ContentReadModel,
    event: &Event,
    payload: &LessonCompletedPayload,
) -> CoreResult<()> {
    let lesson = content.lesson(payload.lesson_id).await?;
    apply_lesson_completed(conn, lesson.as_ref(), event, payload).await?;
    Ok(())
}

pub async fn replay_enrollment(
    conn: &mut SqliteConnection,
    content: &dyn ContentReadModel,
    event: &Event,
    payload: &EnrollmentCreatedPayload,
) -> CoreResult<()> {
    let course = content.course(payload.course_id).await?;
    apply_enrollment(conn, course.as_ref(), event, payload).await?;
    Ok(())
}
