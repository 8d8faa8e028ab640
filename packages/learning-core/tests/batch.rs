mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use common::{count, seed_course, seed_lesson, seed_quiz, t0, test_core, test_core_with};
use lumen_core::cache::FeedKind;
use lumen_core::config::CoreConfig;
use lumen_core::content::sync;
use lumen_core::core::{ContentPublishedPayload, CoreEvent, QuizCompletedPayload};
use lumen_core::events;
use lumen_core::workers::checkpoints;
use lumen_core::workers::rebuild::{self, replay_event};
use lumen_core::workers::InvalidationReactor;
use lumen_core::{CoreError, LearningCore};

const TEACHER: i64 = 100;

type StatRow = (i64, String, i64, i64, f64, i64, Option<i64>, Option<i64>, f64, Option<i64>);
type SessionRow = (String, i64, i64, i64, i64, String, Option<i64>);
type EntryRow = (i64, i64, String, String, i64, String, i64, i64, i64, String);

async fn memory_rows(core: &LearningCore) -> Vec<StatRow> {
    sqlx::query_as(
        r#"
        SELECT "user_id", "item_type", "item_id", "interval_days", "easiness_factor", "repetitions",
               "last_reviewed_at", "next_review_at", "current_retention_estimate", "last_quality_of_recall"
        FROM "memory_stats" ORDER BY "user_id", "item_type", "item_id"
        "#,
    )
    .fetch_all(core.pool())
    .await
    .unwrap()
}

async fn ledger_rows(core: &LearningCore) -> Vec<EntryRow> {
    sqlx::query_as(
        r#"
        SELECT "id", "user_id", "role", "kind", "points", "target_kind", "target_id", "event_id", "occurred_at", "dedupe_key"
        FROM "scoring_entries" ORDER BY "id"
        "#,
    )
    .fetch_all(core.pool())
    .await
    .unwrap()
}

async fn session_rows(core: &LearningCore) -> Vec<SessionRow> {
    sqlx::query_as(
        r#"
        SELECT "session_id", "quiz_id", "total_questions", "answered_count", "correct_count", "status", "completed_at"
        FROM "quiz_session_progress" ORDER BY "session_id"
        "#,
    )
    .fetch_all(core.pool())
    .await
    .unwrap()
}

/// Two students working through a quiz, a course and an enrollment
async fn seed_activity(core: &LearningCore) -> DateTime<Utc> {
    seed_quiz(core, 1, TEACHER, Some(10), &[11, 12, 13]).await;
    seed_quiz(core, 2, TEACHER, Some(10), &[21, 22]).await;
    seed_course(core, 5, TEACHER, true, &[51, 52]).await;

    let mut at = t0();
    for (user, answers) in [(7, [1, 1, 1]), (8, [1, 0, 1])] {
        for (question, answer) in [11, 12, 13].into_iter().zip(answers) {
            core.record_answer(user, 1, question, json!(answer), Some(4000), at).await.unwrap();
            at += Duration::minutes(1);
        }
    }
    core.record_answer(7, 2, 21, json!(1), Some(16000), at).await.unwrap();
    at += Duration::minutes(1);

    core.record_enrollment(900, 7, 5, at).await.unwrap();
    core.mark_lesson_complete(7, 51, at).await.unwrap();
    at += Duration::minutes(1);
    core.mark_lesson_complete(7, 52, at).await.unwrap();
    at
}

#[tokio::test]
async fn test_replaying_an_answer_changes_nothing() {
    let t = test_core().await;
    let core = &t.core;
    seed_quiz(core, 1, TEACHER, Some(10), &[11, 12, 13]).await;
    let outcome = core.record_answer(7, 1, 11, json!(1), Some(3000), t0()).await.unwrap();

    let memory_before = memory_rows(core).await;
    let ledger_before = ledger_rows(core).await;
    let sessions_before = session_rows(core).await;

    let event = events::get(core.pool(), outcome.event_id).await.unwrap().unwrap();
    let mut conn = core.pool().acquire().await.unwrap();
    replay_event(&mut conn, core.content().as_ref(), &core.config(), &event).await.unwrap();
    replay_event(&mut conn, core.content().as_ref(), &core.config(), &event).await.unwrap();
    drop(conn);

    assert_eq!(memory_rows(core).await, memory_before);
    assert_eq!(ledger_rows(core).await, ledger_before);
    assert_eq!(session_rows(core).await, sessions_before);
    assert_eq!(sessions_before[0].3, 1);

    // A second distinct answer leaves the three-question session open
    let second = core
        .record_answer(7, 1, 12, json!(1), Some(3000), t0() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(second.session_id, outcome.session_id);
    assert_eq!(second.completed_event_id, None);
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "events" WHERE "kind" = 'quiz_completed'"#).await, 0);
    assert_eq!(session_rows(core).await[0].3, 2);
}

#[tokio::test]
async fn test_rebuild_from_log_reproduces_derived_rows() {
    let t = test_core().await;
    let core = &t.core;
    let last = seed_activity(core).await;
    let now = last + Duration::days(3);
    core.decay_all(now).await.unwrap().into_result().unwrap();

    let memory_before = memory_rows(core).await;
    let ledger_before = ledger_rows(core).await;
    let sessions_before = session_rows(core).await;
    let completions_before = count(core, r#"SELECT COUNT(*) FROM "course_completions""#).await;
    assert!(!memory_before.is_empty());
    assert_eq!(completions_before, 1);

    let report = core.rebuild_from_log(now).await.unwrap();
    assert_eq!(report.failed, 0);
    assert!(report.decay.is_complete());
    assert_eq!(
        report.events,
        count(core, r#"SELECT COUNT(*) FROM "events""#).await
    );

    assert_eq!(memory_rows(core).await, memory_before);
    assert_eq!(ledger_rows(core).await, ledger_before);
    assert_eq!(session_rows(core).await, sessions_before);
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "course_completions""#).await, completions_before);
    assert_eq!(
        count(core, r#"SELECT COUNT(*) FROM "quiz_session_progress" WHERE "status" = 'completed'"#).await,
        2
    );
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "recommendation_cache""#).await, 0);
}

#[tokio::test]
async fn test_rebuild_from_log_keeps_retention_at_now() {
    let t = test_core().await;
    let core = &t.core;
    seed_quiz(core, 1, TEACHER, Some(10), &[11, 12]).await;
    core.record_answer(7, 1, 11, json!(1), Some(3000), t0()).await.unwrap();

    let later = t0() + Duration::days(20);
    core.decay_all(later).await.unwrap().into_result().unwrap();
    let retention = |rows: Vec<StatRow>| rows.into_iter().map(|r| r.8).collect::<Vec<f64>>();
    let decayed = retention(memory_rows(core).await);
    assert!(decayed.iter().all(|&r| r < 1.0));

    core.rebuild_from_log(later).await.unwrap();
    assert_eq!(retention(memory_rows(core).await), decayed);
}

#[tokio::test]
async fn test_deleted_quiz_freezes_its_session() {
    let t = test_core().await;
    let core = &t.core;
    seed_quiz(core, 1, TEACHER, Some(10), &[11, 12, 13]).await;
    core.record_answer(7, 1, 11, json!(1), Some(3000), t0()).await.unwrap();
    core.record_answer(7, 1, 12, json!(0), Some(3000), t0() + Duration::minutes(1)).await.unwrap();
    let before = session_rows(core).await;
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].3, 2);

    sync::delete_quiz(core.pool(), 1).await.unwrap();
    let report = core.rebuild_from_log(t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(report.failed, 0);

    let after = session_rows(core).await;
    assert_eq!(after, before);
    assert_eq!(after[0].2, 3);
    assert_eq!(after[0].5, "in_progress");
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "events" WHERE "kind" = 'quiz_completed'"#).await, 0);

    // Its questions are gone, so further answers are rejected before anything is written
    let err = core
        .record_answer(7, 1, 13, json!(1), Some(3000), t0() + Duration::hours(2))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownQuestion(13)));
    assert_eq!(session_rows(core).await, before);
}

#[tokio::test]
async fn test_weekly_rebuild_ranks_every_user_once() {
    let t = test_core().await;
    let core = &t.core;
    let last = seed_activity(core).await;
    seed_quiz(core, 3, TEACHER, Some(10), &[31]).await;
    core.record_answer(9, 3, 31, json!(0), None, last).await.unwrap();

    let now = last + Duration::days(1);
    let report = core.weekly_intelligence_rebuild(now).await.unwrap();
    assert_eq!(report.abilities.processed, 3);
    assert_eq!(report.ranked_users, 3);
    assert!(report.difficulty.questions > 0);

    let mut ranks: Vec<i64> = sqlx::query_scalar(r#"SELECT "global_rank" FROM "user_ability_profiles""#)
        .fetch_all(core.pool())
        .await
        .unwrap();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![1, 2, 3]);

    let scores: Vec<f64> = sqlx::query_scalar(r#"SELECT "score" FROM "match_scores""#)
        .fetch_all(core.pool())
        .await
        .unwrap();
    assert!(scores.iter().all(|s| (0.0..=100.0).contains(s)));

    let path = core.learning_path(7, 10, now).await.unwrap();
    for step in &path {
        assert!(step.est_time_minutes >= 1);
        assert!(step.why.iter().all(|w| !w.chars().any(|c| c.is_ascii_digit())));
    }
}

#[tokio::test]
async fn test_decay_resumes_from_checkpoint_after_deadline() {
    let mut config = CoreConfig::default();
    config.batch.partitions = 1;
    config.batch.page_size = 1;
    config.batch.partition_deadline = std::time::Duration::ZERO;
    let t = test_core_with(config).await;
    let core = &t.core;
    seed_quiz(core, 1, TEACHER, Some(10), &[11, 12, 13]).await;
    core.record_answer(7, 1, 11, json!(1), None, t0()).await.unwrap();
    core.record_answer(7, 1, 12, json!(1), None, t0() + Duration::seconds(5)).await.unwrap();
    core.record_answer(8, 1, 11, json!(0), None, t0() + Duration::seconds(9)).await.unwrap();

    let stats = count(core, r#"SELECT COUNT(*) FROM "memory_stats" WHERE "last_reviewed_at" IS NOT NULL"#).await;
    assert_eq!(stats, 3);

    let now = t0() + Duration::days(3);
    let first = core.decay_all(now).await.unwrap();
    assert_eq!(first.processed, 1);
    assert_eq!(first.timed_out_partitions, vec![0]);
    assert!(matches!(
        first.clone().into_result(),
        Err(CoreError::DeadlineExceeded { partition: 0, .. })
    ));

    let mut processed = first.processed;
    let mut runs = 1;
    loop {
        let report = core.decay_all(now).await.unwrap();
        processed += report.processed;
        runs += 1;
        if report.is_complete() {
            break;
        }
        assert!(runs <= 10, "decay never finished");
    }
    assert_eq!(processed, stats);
    assert_eq!(
        checkpoints::last_status(core.pool(), "daily_retention_decay").await.unwrap().as_deref(),
        Some("completed")
    );

    let err = core.weekly_intelligence_rebuild(now).await.unwrap_err();
    assert!(matches!(err, CoreError::DeadlineExceeded { .. }));
}

#[tokio::test]
async fn test_feed_is_served_from_cache_until_invalidated() {
    let t = test_core().await;
    let core = &t.core;
    seed_quiz(core, 1, TEACHER, Some(10), &[11, 12]).await;
    seed_quiz(core, 2, TEACHER, Some(10), &[21]).await;
    seed_quiz(core, 3, TEACHER, Some(30), &[31]).await;
    core.record_answer(7, 1, 11, json!(1), Some(3000), t0()).await.unwrap();

    let now = t0() + Duration::minutes(5);
    let miss = core.feed(7, FeedKind::Personalized, Some(5), now).await.unwrap();
    assert!(!miss.from_cache);
    let hit = core.feed(7, FeedKind::Personalized, Some(5), now).await.unwrap();
    assert!(hit.from_cache);
    assert_eq!(hit.items, miss.items);
    assert_eq!(
        count(core, r#"SELECT "hit_count" FROM "recommendation_cache" WHERE "user_id" = 7"#).await,
        1
    );

    // subject 30 was never attempted
    let explore = core.feed(7, FeedKind::Explore, None, now).await.unwrap();
    assert!(explore.items.iter().all(|i| i.item.item_id == 3));

    let expired = core
        .feed(7, FeedKind::Personalized, Some(5), now + Duration::hours(2))
        .await
        .unwrap();
    assert!(!expired.from_cache);

    let review = core.feed(7, FeedKind::Review, None, t0() + Duration::days(2)).await.unwrap();
    assert_eq!(review.items.len(), 1);
    assert_eq!(review.items[0].item.item_id, 11);
}

#[tokio::test]
async fn test_reactor_invalidates_and_announces_ability_shift() {
    let t = test_core().await;
    let core = &t.core;
    seed_quiz(core, 1, TEACHER, Some(10), &[11]).await;
    let outcome = core.record_answer(7, 1, 11, json!(1), Some(3000), t0()).await.unwrap();
    let completion_id = outcome.completed_event_id.unwrap();

    core.feed(7, FeedKind::Personalized, None, t0()).await.unwrap();
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "recommendation_cache" WHERE "user_id" = 7"#).await, 1);

    let reactor = InvalidationReactor::new(core.pool().clone(), core.content(), core.config(), core.bus());
    let mut rx = core.bus().subscribe_global();
    reactor
        .handle(&CoreEvent::QuizCompleted(QuizCompletedPayload {
            user_id: 7,
            quiz_id: 1,
            session_id: outcome.session_id.to_string(),
            event_id: completion_id,
            occurred_at: t0(),
        }))
        .await
        .unwrap();

    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "recommendation_cache" WHERE "user_id" = 7"#).await, 0);
    let profile = core.my_ability(7, t0()).await.unwrap();
    assert!(profile.overall > 425.0);

    let mut shifted = None;
    while let Ok(envelope) = rx.try_recv() {
        if let CoreEvent::AbilityShifted(p) = envelope.event {
            shifted = Some(p);
        }
    }
    let shifted = shifted.expect("ability shift announced");
    assert_eq!(shifted.user_id, 7);
    assert!(shifted.current - shifted.previous > 25.0);

    core.feed(7, FeedKind::Personalized, None, t0()).await.unwrap();
    reactor.handle(&CoreEvent::AbilityShifted(shifted)).await.unwrap();
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "match_scores" WHERE "user_id" = 7"#).await, 1);
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "recommendation_cache" WHERE "user_id" = 7"#).await, 0);
}

#[tokio::test]
async fn test_reactor_invalidates_followers_of_a_subject() {
    let t = test_core().await;
    let core = &t.core;
    seed_quiz(core, 1, TEACHER, Some(20), &[11]).await;
    core.record_answer(7, 1, 11, json!(1), None, t0()).await.unwrap();
    sync::set_preferences(core.pool(), 8, &[20], &[], &[]).await.unwrap();

    for user in [7, 8, 9] {
        core.feed(user, FeedKind::Explore, None, t0()).await.unwrap();
    }
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "recommendation_cache""#).await, 3);

    seed_quiz(core, 2, TEACHER, Some(20), &[21]).await;
    let reactor = InvalidationReactor::new(core.pool().clone(), core.content(), core.config(), core.bus());
    reactor
        .handle(&CoreEvent::ContentPublished(ContentPublishedPayload {
            quiz_id: 2,
            subject_id: Some(20),
        }))
        .await
        .unwrap();

    let remaining: Vec<i64> = sqlx::query_scalar(r#"SELECT "user_id" FROM "recommendation_cache""#)
        .fetch_all(core.pool())
        .await
        .unwrap();
    assert_eq!(remaining, vec![9]);
}

#[tokio::test]
async fn test_unknown_lesson_is_recorded_without_awards() {
    let t = test_core().await;
    let core = &t.core;
    seed_lesson(core, 60, None, TEACHER, 0).await;

    let done = core.mark_lesson_complete(7, 404, t0()).await.unwrap();
    assert!(done.newly_completed);
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "lesson_completions""#).await, 1);
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "scoring_entries""#).await, 0);

    let report = rebuild::rebuild_from_log(core.pool(), core.content(), core.config(), t0() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(count(core, r#"SELECT COUNT(*) FROM "lesson_completions""#).await, 1);
}
