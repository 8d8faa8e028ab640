use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::partition::{self, JobReport, PartitionedJob, RunOptions};
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::services::memory::{self, MemoryStat};

pub const JOB_NAME: &str = "daily_retention_decay";

/// Recomputes `current_retention_estimate` of every reviewed stat at `now`
pub struct DecayJob {
    config: Arc<CoreConfig>,
    now: DateTime<Utc>,
}

impl DecayJob {
    pub fn new(config: Arc<CoreConfig>, now: DateTime<Utc>) -> Self {
        Self { config, now }
    }
}

#[async_trait]
impl PartitionedJob for DecayJob {
    type Item = MemoryStat;
    type Key = (i64, String, i64);

    fn name(&self) -> &'static str {
        JOB_NAME
    }

    fn key_of(&self, stat: &MemoryStat) -> Self::Key {
        (stat.user_id, stat.item.item_type.as_str().to_string(), stat.item.item_id)
    }

    async fn load_page(
        &self,
        pool: &SqlitePool,
        partition: u32,
        partitions: u32,
        after: Option<&Self::Key>,
        limit: i64,
    ) -> CoreResult<Vec<MemoryStat>> {
        memory::page_for_partition(pool, partition, partitions, after, limit).await
    }

    async fn process(&self, pool: &SqlitePool, stat: MemoryStat) -> CoreResult<()> {
        let value = stat.retention_at(self.now, &self.config.decay);
        let mut conn = pool.acquire().await?;
        if !memory::write_retention(&mut conn, &stat, value).await? {
            debug!(user_id = stat.user_id, item_id = stat.item.item_id, "retention unchanged or row moved");
        }
        Ok(())
    }
}

/// `decay_all(now)` over every partition
pub async fn decay_all(pool: &SqlitePool, config: Arc<CoreConfig>, now: DateTime<Utc>) -> CoreResult<JobReport> {
    let options = RunOptions {
        partitions: config.batch.partitions,
        page_size: config.batch.page_size,
        deadline: config.batch.partition_deadline,
    };
    partition::run(pool, Arc::new(DecayJob::new(config, now)), options).await
}
