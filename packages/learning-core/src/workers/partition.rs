//! Partitioned, checkpointed batch runner.
//!
//! Work is split by `user_id mod N`. Each partition pages through its keys, saves a
//! checkpoint after every page and stops once its deadline passes; the report turns
//! that into `DeadlineExceeded`. The next run resumes unfinished partitions from
//! their checkpoints. A run that finds every partition done starts over.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::checkpoints::{self, Checkpoint, RunStatus};
use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait PartitionedJob: Send + Sync + 'static {
    type Item: Send;
    type Key: Serialize + DeserializeOwned + Send + Sync;

    fn name(&self) -> &'static str;

    fn key_of(&self, item: &Self::Item) -> Self::Key;

    /// Next page of this partition strictly after `after`
    async fn load_page(
        &self,
        pool: &SqlitePool,
        partition: u32,
        partitions: u32,
        after: Option<&Self::Key>,
        limit: i64,
    ) -> CoreResult<Vec<Self::Item>>;

    async fn process(&self, pool: &SqlitePool, item: Self::Item) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub partitions: u32,
    pub page_size: i64,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobReport {
    pub job: String,
    pub processed: i64,
    pub failed: i64,
    pub completed_partitions: Vec<u32>,
    pub timed_out_partitions: Vec<u32>,
}

impl JobReport {
    pub fn is_complete(&self) -> bool {
        self.timed_out_partitions.is_empty()
    }

    /// `DeadlineExceeded` for the first partition that ran out of time
    pub fn into_result(self) -> CoreResult<JobReport> {
        match self.timed_out_partitions.first() {
            Some(&partition) => Err(CoreError::DeadlineExceeded {
                job: self.job,
                partition,
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Default)]
struct PartitionOutcome {
    processed: i64,
    failed: i64,
    timed_out: bool,
}

async fn run_partition<J: PartitionedJob>(
    job: Arc<J>,
    pool: SqlitePool,
    mut checkpoint: Checkpoint,
    options: RunOptions,
) -> CoreResult<PartitionOutcome> {
    let started = Instant::now();
    let partition = checkpoint.partition;
    let mut after: Option<J::Key> = match &checkpoint.last_key {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };
    let mut outcome = PartitionOutcome::default();

    loop {
        let page = job
            .load_page(&pool, partition, options.partitions, after.as_ref(), options.page_size)
            .await?;
        if page.is_empty() {
            checkpoint.done = true;
            checkpoints::save(&pool, &checkpoint, Utc::now()).await?;
            return Ok(outcome);
        }

        let page_len = page.len() as i64;
        let mut last_key = None;
        for item in page {
            let key = job.key_of(&item);
            match job.process(&pool, item).await {
                Ok(()) => outcome.processed += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(job = job.name(), partition, error = %e, "item failed, continuing");
                }
            }
            last_key = Some(key);
        }

        checkpoint.processed += page_len;
        checkpoint.last_key = last_key.as_ref().map(serde_json::to_string).transpose()?;
        checkpoints::save(&pool, &checkpoint, Utc::now()).await?;
        after = last_key;

        if started.elapsed() >= options.deadline {
            debug!(job = job.name(), partition, processed = checkpoint.processed, "partition deadline reached");
            outcome.timed_out = true;
            return Ok(outcome);
        }
    }
}

/// Run every partition of `job` concurrently.
///
/// Fails only when the checkpoint store does; timed-out partitions are reported.
pub async fn run<J: PartitionedJob>(pool: &SqlitePool, job: Arc<J>, options: RunOptions) -> CoreResult<JobReport> {
    let name = job.name();
    let partitions = options.partitions.max(1);
    let options = RunOptions { partitions, ..options };

    let mut existing = checkpoints::load_all(pool, name).await?;
    let finished = existing.len() as u32 >= partitions && existing.iter().all(|c| c.done);
    if finished || existing.iter().any(|c| c.partition >= partitions) {
        checkpoints::clear(pool, name).await?;
        existing.clear();
    }

    let run_id = existing.first().map(|c| c.run_id).unwrap_or_else(Uuid::new_v4);
    checkpoints::begin_run(pool, name, run_id, Utc::now()).await?;

    let mut report = JobReport {
        job: name.to_string(),
        ..Default::default()
    };
    let mut tasks = JoinSet::new();
    for partition in 0..partitions {
        let checkpoint = existing
            .iter()
            .find(|c| c.partition == partition)
            .cloned()
            .unwrap_or_else(|| Checkpoint::start(name, partition, run_id));
        if checkpoint.done {
            report.completed_partitions.push(partition);
            continue;
        }
        let job = Arc::clone(&job);
        let pool = pool.clone();
        tasks.spawn(async move { (partition, run_partition(job, pool, checkpoint, options).await) });
    }

    let mut store_error = None;
    while let Some(joined) = tasks.join_next().await {
        let (partition, result) = joined?;
        match result {
            Ok(outcome) => {
                report.processed += outcome.processed;
                report.failed += outcome.failed;
                if outcome.timed_out {
                    report.timed_out_partitions.push(partition);
                } else {
                    report.completed_partitions.push(partition);
                }
            }
            Err(e) => {
                warn!(job = name, partition, error = %e, "partition aborted");
                store_error.get_or_insert(e);
            }
        }
    }
    report.completed_partitions.sort_unstable();
    report.timed_out_partitions.sort_unstable();

    let status = match (&store_error, report.is_complete()) {
        (Some(_), _) => RunStatus::Failed,
        (None, true) => RunStatus::Completed,
        (None, false) => RunStatus::Incomplete,
    };
    checkpoints::finish_run(pool, run_id, status, Utc::now()).await?;
    if let Some(e) = store_error {
        return Err(e);
    }

    info!(
        job = name,
        processed = report.processed,
        failed = report.failed,
        timed_out = report.timed_out_partitions.len(),
        "batch job finished"
    );
    Ok(report)
}
