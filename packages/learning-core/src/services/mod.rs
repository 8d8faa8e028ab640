pub mod ability;
pub mod answers;
pub mod completions;
pub mod difficulty;
pub mod feed;
pub mod insights;
pub mod matching;
pub mod memory;
pub mod scoring;
pub mod sessions;

use sqlx::SqlitePool;

use crate::config::CoreConfig;
use crate::content::ContentReadModel;
use crate::core::EventBus;

/// Shared handles the inbound pipelines run against
#[derive(Clone, Copy)]
pub struct Deps<'a> {
    pub pool: &'a SqlitePool,
    pub content: &'a dyn ContentReadModel,
    pub config: &'a CoreConfig,
    pub bus: &'a EventBus,
}
