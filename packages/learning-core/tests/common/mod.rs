#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use lumen_core::config::CoreConfig;
use lumen_core::content::sync::{self, CourseRecord, LessonRecord, QuestionRecord, QuizRecord};
use lumen_core::db::Database;
use lumen_core::LearningCore;

/// Core over a throwaway SQLite file; keep the `TempDir` alive for the test
pub struct TestCore {
    pub dir: TempDir,
    pub core: LearningCore,
}

pub async fn test_core() -> TestCore {
    test_core_with(CoreConfig::default()).await
}

pub async fn test_core_with(config: CoreConfig) -> TestCore {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::connect(&dir.path().join("core.db")).await.expect("open database");
    TestCore {
        dir,
        core: LearningCore::new(db, config),
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Published mcq quiz whose questions all expect option 1
pub async fn seed_quiz(core: &LearningCore, quiz_id: i64, creator_id: i64, subject_id: Option<i64>, question_ids: &[i64]) {
    core.publish_quiz(&QuizRecord {
        id: quiz_id,
        creator_id,
        title: format!("quiz {quiz_id}"),
        subject_id,
        language: Some("en".to_string()),
        tags: vec!["algebra".to_string()],
        course_id: None,
        published: true,
    })
    .await
    .expect("seed quiz");

    for (position, &id) in question_ids.iter().enumerate() {
        sync::upsert_question(
            core.pool(),
            &QuestionRecord {
                id,
                quiz_id,
                question_type: "mcq".to_string(),
                correct_answer: json!(1),
                position: position as i64,
            },
        )
        .await
        .expect("seed question");
    }
}

pub async fn seed_course(core: &LearningCore, course_id: i64, creator_id: i64, is_premium: bool, lesson_ids: &[i64]) {
    sync::upsert_course(
        core.pool(),
        &CourseRecord {
            id: course_id,
            creator_id,
            title: format!("course {course_id}"),
            is_premium,
            published: true,
        },
    )
    .await
    .expect("seed course");

    for (position, &id) in lesson_ids.iter().enumerate() {
        seed_lesson(core, id, Some(course_id), creator_id, position as i64).await;
    }
}

pub async fn seed_lesson(core: &LearningCore, lesson_id: i64, course_id: Option<i64>, creator_id: i64, position: i64) {
    sync::upsert_lesson(
        core.pool(),
        &LessonRecord {
            id: lesson_id,
            course_id,
            creator_id,
            title: format!("lesson {lesson_id}"),
            published: true,
            position,
        },
    )
    .await
    .expect("seed lesson");
}

pub async fn count(core: &LearningCore, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(core.pool()).await.expect("count query")
}
