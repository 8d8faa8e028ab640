pub mod checkpoints;
pub mod decay;
pub mod partition;
pub mod reactor;
pub mod rebuild;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::content::ContentReadModel;
use crate::core::EventBus;
use crate::error::CoreError;

pub use partition::{JobReport, PartitionedJob, RunOptions};
pub use reactor::InvalidationReactor;

/// Scheduled batch jobs plus the invalidation reactor. Only the leader process runs them.
pub struct WorkerManager {
    scheduler: Mutex<JobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    leader: AtomicBool,
    pool: SqlitePool,
    content: Arc<dyn ContentReadModel>,
    config: Arc<CoreConfig>,
    bus: Arc<EventBus>,
}

impl WorkerManager {
    pub async fn new(
        pool: SqlitePool,
        content: Arc<dyn ContentReadModel>,
        config: Arc<CoreConfig>,
        bus: Arc<EventBus>,
    ) -> Result<Self, WorkerError> {
        let scheduler = JobScheduler::new().await.map_err(WorkerError::Scheduler)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            shutdown_tx,
            reactor: Mutex::new(None),
            leader: AtomicBool::new(false),
            pool,
            content,
            config,
            bus,
        })
    }

    pub async fn start(&self, leader: bool) -> Result<(), WorkerError> {
        if !leader {
            info!("WORKER_LEADER not set, skipping worker startup");
            return Ok(());
        }

        self.leader.store(true, Ordering::Relaxed);
        info!("Starting workers (leader mode)");

        let scheduler = self.scheduler.lock().await;

        {
            let schedule = self.config.batch.decay_schedule.clone();
            let pool = self.pool.clone();
            let config = Arc::clone(&self.config);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let pool = pool.clone();
                let config = Arc::clone(&config);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        result = decay::decay_all(&pool, config, Utc::now()) => match result.and_then(JobReport::into_result) {
                            Ok(report) => info!(processed = report.processed, failed = report.failed, "retention decay done"),
                            Err(e) => error!(error = %e, "Retention decay worker error"),
                        }
                    }
                })
            })
            .map_err(WorkerError::Scheduler)?;
            scheduler.add(job).await.map_err(WorkerError::Scheduler)?;
            info!(schedule = %schedule, "Retention decay worker scheduled");
        }

        {
            let schedule = self.config.batch.rebuild_schedule.clone();
            let pool = self.pool.clone();
            let content = Arc::clone(&self.content);
            let config = Arc::clone(&self.config);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let pool = pool.clone();
                let content = Arc::clone(&content);
                let config = Arc::clone(&config);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        result = rebuild::weekly_intelligence_rebuild(&pool, content, config, Utc::now()) => {
                            if let Err(e) = result {
                                error!(error = %e, "Intelligence rebuild worker error");
                            }
                        }
                    }
                })
            })
            .map_err(WorkerError::Scheduler)?;
            scheduler.add(job).await.map_err(WorkerError::Scheduler)?;
            info!(schedule = %schedule, "Intelligence rebuild worker scheduled");
        }

        scheduler.start().await.map_err(WorkerError::Scheduler)?;

        let reactor = InvalidationReactor::new(
            self.pool.clone(),
            Arc::clone(&self.content),
            Arc::clone(&self.config),
            Arc::clone(&self.bus),
        );
        let handle = tokio::spawn(reactor.run(self.shutdown_tx.subscribe()));
        *self.reactor.lock().await = Some(handle);

        info!("All workers started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.is_leader() {
            return;
        }

        info!("Stopping workers...");
        let _ = self.shutdown_tx.send(());

        let mut scheduler = self.scheduler.lock().await;
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Error shutting down scheduler");
        }
        if let Some(handle) = self.reactor.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reactor task ended abnormally");
            }
        }

        self.leader.store(false, Ordering::Relaxed);
        info!("Workers stopped");
    }

    /// True between a leader `start` and `stop`
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::SqlContentModel;
    use crate::db::Database;

    async fn manager(db: &Database) -> WorkerManager {
        WorkerManager::new(
            db.pool().clone(),
            Arc::new(SqlContentModel::new(db.pool().clone())),
            Arc::new(CoreConfig::default()),
            Arc::new(EventBus::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_leadership_belongs_to_each_manager() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&dir.path().join("w.db")).await.unwrap();
        let leader = manager(&db).await;
        let follower = manager(&db).await;

        follower.start(false).await.unwrap();
        leader.start(true).await.unwrap();
        assert!(leader.is_leader());
        assert!(!follower.is_leader());

        follower.stop().await;
        assert!(leader.is_leader());

        leader.stop().await;
        assert!(!leader.is_leader());
    }
}
