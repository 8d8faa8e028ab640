use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::cache::FeedKind;
use crate::config::CoreConfig;
use crate::content::sync::{self, QuizRecord};
use crate::content::{AnswerCheckers, ContentReadModel, SqlContentModel};
use crate::core::{ContentPublishedPayload, CoreEvent, EventBus};
use crate::db::Database;
use crate::error::CoreResult;
use crate::events::ContentChange;
use crate::services::ability::{self, UserAbilityProfile};
use crate::services::answers::{self, AnswerOutcome, AnswerSubmission, SubmitSummary};
use crate::services::completions::{self, LessonCompletion};
use crate::services::feed::{self, FeedPage};
use crate::services::insights::{self, LearningStep, ProgressInsights};
use crate::services::memory::{self, MemoryProfile};
use crate::services::scoring::{self, ProgressOverview};
use crate::services::Deps;
use crate::workers::rebuild::{self, LogReplayReport, RebuildReport};
use crate::workers::{decay, JobReport};

/// Entry point for hosts: inbound operations, read-side queries and batch triggers
#[derive(Clone)]
pub struct LearningCore {
    db: Database,
    config: Arc<CoreConfig>,
    content: Arc<dyn ContentReadModel>,
    checkers: Arc<AnswerCheckers>,
    bus: Arc<EventBus>,
}

impl LearningCore {
    /// Core over the SQL content read model stored next to the log
    pub fn new(db: Database, config: CoreConfig) -> Self {
        let content: Arc<dyn ContentReadModel> = Arc::new(SqlContentModel::new(db.pool().clone()));
        Self::with_content(db, config, content)
    }

    pub fn with_content(db: Database, config: CoreConfig, content: Arc<dyn ContentReadModel>) -> Self {
        Self {
            db,
            config: Arc::new(config),
            content,
            checkers: Arc::new(AnswerCheckers::new()),
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub fn config(&self) -> Arc<CoreConfig> {
        Arc::clone(&self.config)
    }

    pub fn content(&self) -> Arc<dyn ContentReadModel> {
        Arc::clone(&self.content)
    }

    pub fn checkers(&self) -> Arc<AnswerCheckers> {
        Arc::clone(&self.checkers)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    fn deps(&self) -> Deps<'_> {
        Deps {
            pool: self.db.pool(),
            content: self.content.as_ref(),
            config: &self.config,
            bus: &self.bus,
        }
    }

    // ========== Inbound ==========

    pub async fn record_answer(
        &self,
        user_id: i64,
        quiz_id: i64,
        question_id: i64,
        submitted_answer: Value,
        time_spent_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> CoreResult<AnswerOutcome> {
        let input = AnswerSubmission {
            user_id,
            quiz_id,
            question_id,
            submitted: submitted_answer,
            time_spent_ms,
            now,
        };
        answers::record_answer(self.deps(), &self.checkers, input).await
    }

    pub async fn start_quiz(&self, user_id: i64, quiz_id: i64, now: DateTime<Utc>) -> CoreResult<Uuid> {
        answers::start_quiz(self.deps(), user_id, quiz_id, now).await
    }

    pub async fn submit_quiz(&self, user_id: i64, quiz_id: i64, now: DateTime<Utc>) -> CoreResult<SubmitSummary> {
        answers::submit_quiz(self.deps(), user_id, quiz_id, now).await
    }

    pub async fn mark_lesson_complete(&self, user_id: i64, lesson_id: i64, now: DateTime<Utc>) -> CoreResult<LessonCompletion> {
        completions::mark_lesson_complete(self.deps(), user_id, lesson_id, now).await
    }

    pub async fn record_enrollment(&self, enrollment_id: i64, user_id: i64, course_id: i64, now: DateTime<Utc>) -> CoreResult<bool> {
        completions::record_enrollment(self.deps(), enrollment_id, user_id, course_id, now).await
    }

    /// Sync a quiz into the read model; a newly published quiz is announced on the bus
    pub async fn publish_quiz(&self, quiz: &QuizRecord) -> CoreResult<ContentChange> {
        let change = sync::upsert_quiz(self.db.pool(), quiz).await?;
        if change == ContentChange::Published {
            self.bus
                .publish(CoreEvent::ContentPublished(ContentPublishedPayload {
                    quiz_id: quiz.id,
                    subject_id: quiz.subject_id,
                }))
                .await;
        }
        Ok(change)
    }

    // ========== Read side ==========

    pub async fn my_ability(&self, user_id: i64, now: DateTime<Utc>) -> CoreResult<UserAbilityProfile> {
        ability::get_or_initial(self.db.pool(), &self.config, user_id, now).await
    }

    pub async fn learning_path(&self, user_id: i64, limit: usize, now: DateTime<Utc>) -> CoreResult<Vec<LearningStep>> {
        insights::learning_path(self.db.pool(), self.content.as_ref(), &self.config, user_id, limit, now).await
    }

    pub async fn memory_profile(&self, user_id: i64, upcoming_days: i64, now: DateTime<Utc>) -> CoreResult<MemoryProfile> {
        memory::profile(self.db.pool(), &self.config, user_id, upcoming_days, now).await
    }

    pub async fn progress_insights(&self, user_id: i64, now: DateTime<Utc>) -> CoreResult<ProgressInsights> {
        insights::progress_insights(self.db.pool(), &self.config, user_id, now).await
    }

    pub async fn progress_overview(&self, user_id: i64, now: DateTime<Utc>) -> CoreResult<ProgressOverview> {
        scoring::overview(self.db.pool(), user_id, now).await
    }

    pub async fn feed(&self, user_id: i64, kind: FeedKind, limit: Option<usize>, now: DateTime<Utc>) -> CoreResult<FeedPage> {
        feed::feed(self.db.pool(), self.content.as_ref(), &self.config, user_id, kind, limit, now).await
    }

    // ========== Batch ==========

    pub async fn decay_all(&self, now: DateTime<Utc>) -> CoreResult<JobReport> {
        decay::decay_all(self.db.pool(), self.config(), now).await
    }

    pub async fn weekly_intelligence_rebuild(&self, now: DateTime<Utc>) -> CoreResult<RebuildReport> {
        rebuild::weekly_intelligence_rebuild(self.db.pool(), self.content(), self.config(), now).await
    }

    pub async fn rebuild_from_log(&self, now: DateTime<Utc>) -> CoreResult<LogReplayReport> {
        rebuild::rebuild_from_log(self.db.pool(), self.content(), self.config(), now).await
    }
}
