//! Quiz answer pipeline.
//!
//! One transaction per answer: append the event, count it in the session, update
//! the question's memory stat, write ledger awards. Completion is claimed with a
//! compare-and-set inside the same transaction. The whole-quiz review and bus
//! notifications run after commit and never fail the caller.

use chrono::{DateTime, Utc};
use lumen_algo::{derive_quality, mean_quality};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::content::{AnswerCheckers, ContentReadModel, QuizInfo};
use crate::core::{self as bus, CoreEvent};
use crate::error::{CoreError, CoreResult};
use crate::events::{
    self, AnswerSubmittedPayload, Event, EventKind, EventPayload, ItemRef, NewEvent, QuizCompletedPayload,
    QuizStartedPayload, QuizSubmittedPayload, TargetRef,
};
use crate::services::memory::{self, ReviewInput};
use crate::services::scoring::{self, Award};
use crate::services::{sessions, Deps};

/// Whether derived writes may append follow-up events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    /// Rebuilding from the log; follow-up events are already there
    Replay,
}

#[derive(Debug, Clone)]
pub struct AnswerSubmission {
    pub user_id: i64,
    pub quiz_id: i64,
    pub question_id: i64,
    pub submitted: Value,
    pub time_spent_ms: Option<i64>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerOutcome {
    pub is_correct: bool,
    pub next_review_at: Option<DateTime<Utc>>,
    pub session_id: Uuid,
    pub quality: u8,
    pub event_id: i64,
    /// Set when this answer completed the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_event_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSummary {
    pub correct_count: i64,
    pub total_answers: i64,
}

/// Derived writes of one answer
#[derive(Debug)]
struct AnswerEffects {
    next_review_at: Option<DateTime<Utc>>,
    completion: Option<Event>,
}

async fn prior_attempts(conn: &mut SqliteConnection, user_id: i64, question_id: i64) -> CoreResult<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM "events" WHERE "user_id" = ? AND "kind" = 'quiz_answer_submitted' AND "question_id" = ?"#,
    )
    .bind(user_id)
    .bind(question_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Session counters, memory stat and ledger for a stored answer event
async fn apply_answer(
    conn: &mut SqliteConnection,
    config: &CoreConfig,
    quiz: Option<&QuizInfo>,
    event: &Event,
    payload: &AnswerSubmittedPayload,
    quality: u8,
    mode: Mode,
) -> CoreResult<AnswerEffects> {
    let Some(user_id) = event.user_id else {
        return Err(CoreError::InvalidMetadata("quiz_answer_submitted without user".to_string()));
    };
    let at = event.occurred_at;
    let mut completion = None;

    // A replayed answer to a since-deleted quiz restores the frozen counters only
    let total = match (quiz, mode) {
        (Some(quiz), _) => Some(payload.total_questions.unwrap_or(quiz.question_count)),
        (None, Mode::Replay) => payload.total_questions,
        (None, Mode::Live) => None,
    };

    match (total, event.session_id) {
        (Some(total), Some(session_id)) => {
            sessions::ensure(conn, session_id, user_id, payload.quiz_id, total, at).await?;
            if !sessions::increment(conn, session_id, event.event_id, payload.is_correct).await? {
                debug!(%session_id, event_id = event.event_id, "answer already counted or session closed");
            }
            if let (Some(quiz), Mode::Live) = (quiz, mode) {
                if sessions::try_complete(conn, session_id, at).await? {
                    completion = Some(append_completion(conn, user_id, quiz.id, session_id, at).await?);
                }
            }
        }
        (None, _) => debug!(quiz_id = payload.quiz_id, "quiz missing, session frozen"),
        (Some(_), None) => debug!(event_id = event.event_id, "answer without session"),
    }

    let stat = memory::record_review(
        conn,
        config,
        &ReviewInput {
            user_id,
            item: ItemRef::question(payload.question_id),
            quality,
            time_spent_ms: payload.time_spent_ms,
            event_id: event.event_id,
            reviewed_at: at,
        },
    )
    .await?;

    if payload.is_correct {
        scoring::award(conn, &Award::correct_answer(user_id, payload.question_id, event.event_id, at)).await?;
    }
    if let Some(quiz) = quiz.filter(|q| q.creator_id != user_id) {
        scoring::award(
            conn,
            &Award::quiz_first_attempt(quiz.creator_id, quiz.id, user_id, event.event_id, at),
        )
        .await?;
    }

    Ok(AnswerEffects {
        next_review_at: stat.next_review_at,
        completion,
    })
}

async fn append_completion(
    conn: &mut SqliteConnection,
    user_id: i64,
    quiz_id: i64,
    session_id: Uuid,
    at: DateTime<Utc>,
) -> CoreResult<Event> {
    let progress = sessions::get(conn, session_id)
        .await?
        .ok_or_else(|| CoreError::DependencyMissing(format!("session {session_id}")))?;
    let payload = QuizCompletedPayload {
        quiz_id,
        answered_count: progress.answered_count,
        correct_count: progress.correct_count,
        total_questions: progress.total_questions,
    };
    let event = NewEvent::new(Some(user_id), EventKind::QuizCompleted, TargetRef::quiz(quiz_id), at, &payload)?
        .with_session(session_id);
    events::append_in(conn, event).await
}

/// Grade, log and apply one answer.
///
/// Fails with `UnknownQuestion` or `QuestionNotInQuiz` before anything is written;
/// the question's own quiz is authoritative.
pub async fn record_answer(deps: Deps<'_>, checkers: &AnswerCheckers, input: AnswerSubmission) -> CoreResult<AnswerOutcome> {
    let question = deps
        .content
        .question(input.question_id)
        .await?
        .ok_or(CoreError::UnknownQuestion(input.question_id))?;
    if question.quiz_id != input.quiz_id {
        return Err(CoreError::QuestionNotInQuiz {
            question_id: input.question_id,
            quiz_id: input.quiz_id,
        });
    }

    let is_correct = checkers.check(&question.question_type, &question.correct_answer, &input.submitted)?;
    let quality = derive_quality(is_correct, input.time_spent_ms, &deps.config.quality);
    let quiz = deps.content.quiz(question.quiz_id).await?;

    let mut tx = deps.pool.begin().await?;
    let session_id =
        sessions::resolve_for_answer(&mut tx, input.user_id, quiz.as_ref(), question.quiz_id, question.id).await?;
    let payload = AnswerSubmittedPayload {
        quiz_id: question.quiz_id,
        question_id: question.id,
        is_correct,
        attempt_index: prior_attempts(&mut tx, input.user_id, question.id).await? + 1,
        time_spent_ms: input.time_spent_ms,
        quality_of_recall_used: Some(quality),
        total_questions: quiz.as_ref().map(|q| q.question_count),
    };
    let event = NewEvent::new(
        Some(input.user_id),
        EventKind::QuizAnswerSubmitted,
        TargetRef::question(question.id),
        input.now,
        &payload,
    )?
    .with_session(session_id);
    let event = events::append_in(&mut tx, event).await?;
    let effects = apply_answer(&mut tx, deps.config, quiz.as_ref(), &event, &payload, quality, Mode::Live).await?;
    tx.commit().await?;

    debug!(
        user_id = input.user_id,
        question_id = question.id,
        is_correct,
        quality,
        %session_id,
        "answer recorded"
    );

    deps.bus
        .publish(CoreEvent::AnswerRecorded(bus::AnswerRecordedPayload {
            user_id: input.user_id,
            quiz_id: question.quiz_id,
            question_id: question.id,
            is_correct,
            event_id: event.event_id,
        }))
        .await;

    let completed_event_id = effects.completion.as_ref().map(|e| e.event_id);
    if let Some(completion) = effects.completion {
        on_quiz_completed(deps, &completion).await;
    }

    Ok(AnswerOutcome {
        is_correct,
        next_review_at: effects.next_review_at,
        session_id,
        quality,
        event_id: event.event_id,
        completed_event_id,
    })
}

/// On-commit work for a completed session; failures are logged
async fn on_quiz_completed(deps: Deps<'_>, completion: &Event) {
    let result = async {
        let mut conn = deps.pool.acquire().await?;
        review_whole_quiz(&mut conn, deps.config, completion).await
    }
    .await;
    if let Err(e) = result {
        warn!(event_id = completion.event_id, error = %e, "whole-quiz review failed");
    }

    if let (Some(user_id), Some(session_id)) = (completion.user_id, completion.session_id) {
        deps.bus
            .publish(CoreEvent::QuizCompleted(bus::QuizCompletedPayload {
                user_id,
                quiz_id: completion.target.id,
                session_id: session_id.to_string(),
                event_id: completion.event_id,
                occurred_at: completion.occurred_at,
            }))
            .await;
    }
}

/// Review the quiz as a whole with the rounded mean quality of the session's answers
pub async fn review_whole_quiz(conn: &mut SqliteConnection, config: &CoreConfig, completion: &Event) -> CoreResult<bool> {
    let (Some(user_id), Some(session_id)) = (completion.user_id, completion.session_id) else {
        return Ok(false);
    };
    let answers = events::by_session(conn, session_id).await?;
    let qualities: Vec<u8> = answers
        .iter()
        .filter_map(|e| match e.payload() {
            Ok(EventPayload::AnswerSubmitted(p)) => Some(
                p.quality_of_recall_used
                    .unwrap_or_else(|| derive_quality(p.is_correct, p.time_spent_ms, &config.quality)),
            ),
            _ => None,
        })
        .collect();
    let Some(quality) = mean_quality(&qualities) else {
        return Ok(false);
    };

    memory::record_review(
        conn,
        config,
        &ReviewInput {
            user_id,
            item: ItemRef::quiz(completion.target.id),
            quality,
            time_spent_ms: None,
            event_id: completion.event_id,
            reviewed_at: completion.occurred_at,
        },
    )
    .await?;
    Ok(true)
}

/// Open a session, or return the one already opened today for this quiz
pub async fn start_quiz(deps: Deps<'_>, user_id: i64, quiz_id: i64, now: DateTime<Utc>) -> CoreResult<Uuid> {
    let quiz = deps.content.quiz(quiz_id).await?;
    let mut tx = deps.pool.begin().await?;

    let day = crate::db::time::utc_day_bounds(now);
    if let Some(existing) = sessions::started_on_day(&mut tx, user_id, quiz_id, day).await? {
        return Ok(existing);
    }

    let session_id = Uuid::new_v4();
    let event = NewEvent::new(
        Some(user_id),
        EventKind::QuizStarted,
        TargetRef::quiz(quiz_id),
        now,
        &QuizStartedPayload { quiz_id },
    )?
    .with_session(session_id);
    let event = events::append_in(&mut tx, event).await?;
    match &quiz {
        Some(quiz) => {
            sessions::ensure(&mut tx, session_id, user_id, quiz_id, quiz.question_count, event.occurred_at).await?;
        }
        None => warn!(user_id, quiz_id, "quiz_started for unknown quiz, no session row"),
    }
    tx.commit().await?;
    Ok(session_id)
}

/// Summarise the latest attempt and log `quiz_submitted`. Memory is untouched.
pub async fn submit_quiz(deps: Deps<'_>, user_id: i64, quiz_id: i64, now: DateTime<Utc>) -> CoreResult<SubmitSummary> {
    let mut tx = deps.pool.begin().await?;
    let latest: Option<String> = sqlx::query_scalar(
        r#"
        SELECT "session_id" FROM "events"
        WHERE "user_id" = ? AND "kind" = 'quiz_answer_submitted' AND "quiz_id" = ? AND "session_id" IS NOT NULL
        ORDER BY "occurred_at" DESC, "id" DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(quiz_id)
    .fetch_optional(&mut *tx)
    .await?;

    let summary = match latest {
        Some(session_id) => {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS "total", COALESCE(SUM("is_correct"), 0) AS "correct" FROM "events"
                WHERE "session_id" = ? AND "kind" = 'quiz_answer_submitted'
                "#,
            )
            .bind(&session_id)
            .fetch_one(&mut *tx)
            .await?;
            SubmitSummary {
                correct_count: row.try_get("correct")?,
                total_answers: row.try_get("total")?,
            }
        }
        None => SubmitSummary {
            correct_count: 0,
            total_answers: 0,
        },
    };

    let payload = QuizSubmittedPayload {
        quiz_id,
        correct_count: summary.correct_count,
        total_answers: summary.total_answers,
    };
    let event = NewEvent::new(Some(user_id), EventKind::QuizSubmitted, TargetRef::quiz(quiz_id), now, &payload)?;
    events::append_in(&mut tx, event).await?;
    tx.commit().await?;
    Ok(summary)
}

// ========== Replay ==========

/// Re-apply a logged answer. Uses the stored quality so replays match the live run.
pub async fn replay_answer(
    conn: &mut SqliteConnection,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    event: &Event,
    payload: &AnswerSubmittedPayload,
) -> CoreResult<()> {
    let quality = payload
        .quality_of_recall_used
        .unwrap_or_else(|| derive_quality(payload.is_correct, payload.time_spent_ms, &config.quality));
    let quiz = content.quiz(payload.quiz_id).await?;
    apply_answer(conn, config, quiz.as_ref(), event, payload, quality, Mode::Replay).await?;
    Ok(())
}

pub async fn replay_quiz_started(
    conn: &mut SqliteConnection,
    content: &dyn ContentReadModel,
    event: &Event,
    payload: &QuizStartedPayload,
) -> CoreResult<()> {
    let (Some(user_id), Some(session_id)) = (event.user_id, event.session_id) else {
        return Ok(());
    };
    if let Some(quiz) = content.quiz(payload.quiz_id).await? {
        sessions::ensure(conn, session_id, user_id, quiz.id, quiz.question_count, event.occurred_at).await?;
    }
    Ok(())
}

/// Close the session at the logged time and re-run the whole-quiz review
pub async fn replay_quiz_completed(conn: &mut SqliteConnection, config: &CoreConfig, event: &Event) -> CoreResult<()> {
    if let Some(session_id) = event.session_id {
        sessions::try_complete(conn, session_id, event.occurred_at).await?;
    }
    review_whole_quiz(conn, config, event).await?;
    Ok(())
}
