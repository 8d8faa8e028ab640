//! Reacts to bus notifications by dropping stale feeds and refreshing abilities.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::cache;
use crate::config::CoreConfig;
use crate::content::ContentReadModel;
use crate::core::{AbilityShiftedPayload, CoreEvent, EventBus};
use crate::error::CoreResult;
use crate::services::{ability, matching};

pub struct InvalidationReactor {
    pool: SqlitePool,
    content: Arc<dyn ContentReadModel>,
    config: Arc<CoreConfig>,
    bus: Arc<EventBus>,
}

impl InvalidationReactor {
    pub fn new(pool: SqlitePool, content: Arc<dyn ContentReadModel>, config: Arc<CoreConfig>, bus: Arc<EventBus>) -> Self {
        Self {
            pool,
            content,
            config,
            bus,
        }
    }

    /// Consume the bus until `shutdown` fires or the bus closes
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = BroadcastStream::new(self.bus.subscribe_global());
        info!("invalidation reactor started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                next = events.next() => match next {
                    Some(Ok(envelope)) => {
                        if let Err(e) = self.handle(&envelope.event).await {
                            warn!(event_type = envelope.event.event_type(), error = %e, "reactor failed to handle event");
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "reactor lagged behind the bus");
                    }
                    None => break,
                },
            }
        }
        info!("invalidation reactor stopped");
    }

    pub async fn handle(&self, event: &CoreEvent) -> CoreResult<()> {
        match event {
            CoreEvent::QuizCompleted(p) => {
                cache::invalidate_user(&self.pool, p.user_id).await?;
                let change =
                    ability::refresh_user(&self.pool, self.content.as_ref(), &self.config, p.user_id, Utc::now()).await?;
                if change.delta().abs() > self.config.batch.ability_invalidation_threshold {
                    self.bus
                        .publish(CoreEvent::AbilityShifted(AbilityShiftedPayload {
                            user_id: p.user_id,
                            previous: change.previous,
                            current: change.current,
                        }))
                        .await;
                }
            }
            CoreEvent::AbilityShifted(p) => {
                let written =
                    matching::refresh_user(&self.pool, self.content.as_ref(), &self.config, p.user_id, Utc::now()).await?;
                cache::invalidate_user(&self.pool, p.user_id).await?;
                debug!(user_id = p.user_id, scores = written, "match scores refreshed after ability shift");
            }
            CoreEvent::ContentPublished(p) => {
                let Some(subject_id) = p.subject_id else {
                    return Ok(());
                };
                let users = self.users_following(subject_id).await?;
                for &user_id in &users {
                    cache::invalidate_user(&self.pool, user_id).await?;
                }
                debug!(quiz_id = p.quiz_id, subject_id, users = users.len(), "feeds invalidated for new content");
            }
            CoreEvent::AnswerRecorded(_) | CoreEvent::LessonCompleted(_) | CoreEvent::CourseCompleted(_) => {}
        }
        Ok(())
    }

    /// Users who answered a quiz of the subject or declared interest in it
    async fn users_following(&self, subject_id: i64) -> CoreResult<BTreeSet<i64>> {
        let mut users: BTreeSet<i64> = self.content.users_interested_in(subject_id).await?.into_iter().collect();

        let quiz_ids = self.content.quiz_ids_in_subject(subject_id).await?;
        if !quiz_ids.is_empty() {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                r#"SELECT DISTINCT "user_id" FROM "events" WHERE "kind" = 'quiz_answer_submitted' AND "user_id" IS NOT NULL AND "quiz_id" IN ("#,
            );
            let mut ids = qb.separated(", ");
            for quiz_id in &quiz_ids {
                ids.push_bind(*quiz_id);
            }
            qb.push(")");
            let answered: Vec<i64> = qb.build_query_scalar().fetch_all(&self.pool).await?;
            users.extend(answered);
        }
        Ok(users)
    }
}
