//! Weekly intelligence rebuild and full replay of the event log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use super::{checkpoints, decay};
use super::partition::{self, JobReport, PartitionedJob, RunOptions};
use crate::cache;
use crate::config::CoreConfig;
use crate::content::ContentReadModel;
use crate::db::schema::LOG_DERIVED_TABLES;
use crate::db::time::to_ms;
use crate::error::CoreResult;
use crate::events::{self, Event, EventPayload};
use crate::services::{ability, answers, completions, difficulty, matching};

pub const JOB_NAME: &str = "weekly_intelligence_rebuild";
const ABILITY_JOB: &str = "ability_rebuild";
const MATCH_JOB: &str = "match_rebuild";

fn run_options(config: &CoreConfig) -> RunOptions {
    RunOptions {
        partitions: config.batch.partitions,
        page_size: config.batch.page_size,
        deadline: config.batch.partition_deadline,
    }
}

/// Users of one partition after `after`. Without `active_since` only users who have
/// answered something are listed; with it, anyone with an event since then.
async fn user_page(
    pool: &SqlitePool,
    partition: u32,
    partitions: u32,
    after: Option<i64>,
    limit: i64,
    active_since: Option<DateTime<Utc>>,
) -> CoreResult<Vec<i64>> {
    let users = sqlx::query_scalar(
        r#"
        SELECT DISTINCT "user_id" FROM "events"
        WHERE "user_id" IS NOT NULL
          AND ("user_id" % ?) = ?
          AND "user_id" > ?
          AND (? IS NULL OR "occurred_at" >= ?)
          AND (? = 0 OR "kind" = 'quiz_answer_submitted')
        ORDER BY "user_id"
        LIMIT ?
        "#,
    )
    .bind(i64::from(partitions.max(1)))
    .bind(i64::from(partition))
    .bind(after.unwrap_or(i64::MIN))
    .bind(active_since.map(to_ms))
    .bind(active_since.map(to_ms))
    .bind(active_since.is_some())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(users)
}

struct AbilityJob {
    content: Arc<dyn ContentReadModel>,
    config: Arc<CoreConfig>,
    now: DateTime<Utc>,
}

#[async_trait]
impl PartitionedJob for AbilityJob {
    type Item = i64;
    type Key = i64;

    fn name(&self) -> &'static str {
        ABILITY_JOB
    }

    fn key_of(&self, user_id: &i64) -> i64 {
        *user_id
    }

    async fn load_page(
        &self,
        pool: &SqlitePool,
        partition: u32,
        partitions: u32,
        after: Option<&i64>,
        limit: i64,
    ) -> CoreResult<Vec<i64>> {
        user_page(pool, partition, partitions, after.copied(), limit, None).await
    }

    async fn process(&self, pool: &SqlitePool, user_id: i64) -> CoreResult<()> {
        let profile = ability::compute_user(pool, self.content.as_ref(), &self.config, user_id, self.now).await?;
        let mut conn = pool.acquire().await?;
        ability::save(&mut conn, &profile).await
    }
}

struct MatchJob {
    content: Arc<dyn ContentReadModel>,
    config: Arc<CoreConfig>,
    now: DateTime<Utc>,
    active_since: DateTime<Utc>,
}

#[async_trait]
impl PartitionedJob for MatchJob {
    type Item = i64;
    type Key = i64;

    fn name(&self) -> &'static str {
        MATCH_JOB
    }

    fn key_of(&self, user_id: &i64) -> i64 {
        *user_id
    }

    async fn load_page(
        &self,
        pool: &SqlitePool,
        partition: u32,
        partitions: u32,
        after: Option<&i64>,
        limit: i64,
    ) -> CoreResult<Vec<i64>> {
        user_page(pool, partition, partitions, after.copied(), limit, Some(self.active_since)).await
    }

    async fn process(&self, pool: &SqlitePool, user_id: i64) -> CoreResult<()> {
        matching::refresh_user(pool, self.content.as_ref(), &self.config, user_id, self.now).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildReport {
    pub abilities: JobReport,
    pub ranked_users: usize,
    pub difficulty: difficulty::DifficultyRebuildStats,
    pub matches: JobReport,
    pub invalidated_feeds: u64,
}

/// Abilities, ranks, difficulties, then match scores for active users. Feeds cached
/// before `now` are dropped at the end.
///
/// Stops with `DeadlineExceeded` when a partition runs out of time; rerunning resumes
/// from the checkpoints.
pub async fn weekly_intelligence_rebuild(
    pool: &SqlitePool,
    content: Arc<dyn ContentReadModel>,
    config: Arc<CoreConfig>,
    now: DateTime<Utc>,
) -> CoreResult<RebuildReport> {
    let options = run_options(&config);

    let ability_job = AbilityJob {
        content: Arc::clone(&content),
        config: Arc::clone(&config),
        now,
    };
    let abilities = partition::run(pool, Arc::new(ability_job), options).await?.into_result()?;
    let ranked_users = ability::assign_ranks(pool).await?;
    let difficulty = difficulty::rebuild_all(pool, &config, now).await?;

    let match_job = MatchJob {
        content,
        config: Arc::clone(&config),
        now,
        active_since: now - Duration::days(config.batch.active_window_days),
    };
    let matches = partition::run(pool, Arc::new(match_job), options).await?.into_result()?;
    let invalidated_feeds = cache::invalidate_before(pool, now).await?;

    info!(
        users = abilities.processed,
        ranked_users,
        questions = difficulty.questions,
        quizzes = difficulty.quizzes,
        matched_users = matches.processed,
        invalidated_feeds,
        "intelligence rebuild finished"
    );
    Ok(RebuildReport {
        abilities,
        ranked_users,
        difficulty,
        matches,
        invalidated_feeds,
    })
}

/// Re-apply one logged event to the derived tables without appending anything
pub async fn replay_event(
    conn: &mut SqliteConnection,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    event: &Event,
) -> CoreResult<()> {
    match event.payload()? {
        EventPayload::QuizStarted(p) => answers::replay_quiz_started(conn, content, event, &p).await,
        EventPayload::AnswerSubmitted(p) => answers::replay_answer(conn, content, config, event, &p).await,
        EventPayload::QuizCompleted(_) => answers::replay_quiz_completed(conn, config, event).await,
        EventPayload::LessonCompleted(p) => completions::replay_lesson_completed(conn, content, event, &p).await,
        EventPayload::CourseCompleted(p) => {
            completions::apply_course_completed(conn, event, p.course_id).await?;
            Ok(())
        }
        EventPayload::EnrollmentCreated(p) => completions::replay_enrollment(conn, content, event, &p).await,
        EventPayload::QuizSubmitted(_) | EventPayload::InteractionTime(_) | EventPayload::ContentChanged(_) => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogReplayReport {
    pub events: i64,
    pub failed: i64,
    pub decay: JobReport,
    pub rebuild: RebuildReport,
}

/// Drop every log-derived table, replay the whole log in id order, bring retention
/// up to `now`, then rebuild intelligence with nothing treated as fresh.
pub async fn rebuild_from_log(
    pool: &SqlitePool,
    content: Arc<dyn ContentReadModel>,
    config: Arc<CoreConfig>,
    now: DateTime<Utc>,
) -> CoreResult<LogReplayReport> {
    {
        let mut tx = pool.begin().await?;
        for table in LOG_DERIVED_TABLES {
            sqlx::query(&format!(r#"DELETE FROM "{table}""#)).execute(&mut *tx).await?;
        }
        tx.commit().await?;
    }
    checkpoints::clear_all(pool).await?;

    let mut report = LogReplayReport::default();
    let mut after_id = 0;
    loop {
        let page = events::store::page_by_id(pool, after_id, config.batch.page_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after_id = last.event_id;

        let mut tx = pool.begin().await?;
        for event in &page {
            report.events += 1;
            if let Err(e) = replay_event(&mut tx, content.as_ref(), &config, event).await {
                report.failed += 1;
                warn!(event_id = event.event_id, kind = event.kind.as_str(), error = %e, "replay failed, skipping event");
            }
        }
        tx.commit().await?;
    }
    info!(events = report.events, failed = report.failed, "event log replayed");

    report.decay = decay::decay_all(pool, Arc::clone(&config), now).await?.into_result()?;
    report.rebuild = weekly_intelligence_rebuild(pool, content, config, now).await?;
    cache::invalidate_all(pool).await?;
    Ok(report)
}
