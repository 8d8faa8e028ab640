use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lumen_algo::{DecayParams, DifficultyParams, EloParams, MatchParams, QualityThresholds, Sm2Params};

pub const DEFAULT_DECAY_SCHEDULE: &str = "0 0 3 * * *";
pub const DEFAULT_REBUILD_SCHEDULE: &str = "0 0 4 * * 0";

/// Process-level settings for the worker binary
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub database_path: PathBuf,
    pub worker_leader: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let database_path = std::env::var("LUMEN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/lumen.db"));

        Self {
            log_level,
            database_path,
            worker_leader: env_bool("WORKER_LEADER", false),
        }
    }
}

/// Memory engine thresholds used by the read side
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Retention at or above which an item counts as mastered
    pub mastery_retention: f64,
    /// Interval at or above which an item counts as mastered
    pub mastery_interval_days: i64,
    pub strong_threshold: f64,
    pub strong_min_interval_days: i64,
    /// Optimistic-lock attempts before `Conflict`
    pub conflict_retries: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mastery_retention: 0.9,
            mastery_interval_days: 60,
            strong_threshold: 0.5,
            strong_min_interval_days: 14,
            conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub personalized_ttl: Duration,
    pub explore_ttl: Duration,
    pub review_ttl: Duration,
    pub challenge_ttl: Duration,
    /// Items stored per cached feed
    pub max_items: usize,
    pub default_limit: usize,
    /// Challenge feed keeps gaps in (min, max]
    pub challenge_gap_min: f64,
    pub challenge_gap_max: f64,
    pub max_path_len: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            personalized_ttl: Duration::from_secs(60 * 60),
            explore_ttl: Duration::from_secs(60 * 60),
            review_ttl: Duration::from_secs(10 * 60),
            challenge_ttl: Duration::from_secs(30 * 60),
            max_items: 50,
            default_limit: 20,
            challenge_gap_min: 100.0,
            challenge_gap_max: 250.0,
            max_path_len: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Work is split by `user_id mod partitions`
    pub partitions: u32,
    pub page_size: i64,
    pub partition_deadline: Duration,
    /// Users with any event in this window are rescored weekly
    pub active_window_days: i64,
    /// Ability moves larger than this invalidate feeds
    pub ability_invalidation_threshold: f64,
    pub trend_window_days: i64,
    /// |trend| at or below this is reported as stable
    pub trend_stable_band: f64,
    pub decay_schedule: String,
    pub rebuild_schedule: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            page_size: 500,
            partition_deadline: Duration::from_secs(15 * 60),
            active_window_days: 30,
            ability_invalidation_threshold: 25.0,
            trend_window_days: 30,
            trend_stable_band: 5.0,
            decay_schedule: DEFAULT_DECAY_SCHEDULE.to_string(),
            rebuild_schedule: DEFAULT_REBUILD_SCHEDULE.to_string(),
        }
    }
}

/// Every tunable of the learning core, passed to components explicitly
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub sm2: Sm2Params,
    pub decay: DecayParams,
    pub quality: QualityThresholds,
    pub elo: EloParams,
    pub difficulty: DifficultyParams,
    pub matching: MatchParams,
    pub memory: MemoryConfig,
    pub feed: FeedConfig,
    pub batch: BatchConfig,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.decay.base_multiplier = env_f64("DECAY_BASE_MULTIPLIER", config.decay.base_multiplier);
        config.decay.min_stability = env_f64("DECAY_MIN_STABILITY", config.decay.min_stability);
        config.decay.interval_cap_days = env_f64("DECAY_INTERVAL_CAP_DAYS", config.decay.interval_cap_days);
        config.matching.sigma = env_f64("ZPD_SIGMA", config.matching.sigma);
        config.elo.k_min = env_f64("ELO_K_MIN", config.elo.k_min);
        config.elo.k_base = env_f64("ELO_K_BASE", config.elo.k_base);

        config.feed.personalized_ttl = Duration::from_secs(env_u64(
            "FEED_PERSONALIZED_TTL_SECS",
            config.feed.personalized_ttl.as_secs(),
        ));
        config.feed.explore_ttl =
            Duration::from_secs(env_u64("FEED_EXPLORE_TTL_SECS", config.feed.explore_ttl.as_secs()));
        config.feed.review_ttl =
            Duration::from_secs(env_u64("FEED_REVIEW_TTL_SECS", config.feed.review_ttl.as_secs()));
        config.feed.challenge_ttl =
            Duration::from_secs(env_u64("FEED_CHALLENGE_TTL_SECS", config.feed.challenge_ttl.as_secs()));

        config.batch.partitions = env_u32("BATCH_PARTITIONS", config.batch.partitions).max(1);
        config.batch.page_size = env_i64("BATCH_PAGE_SIZE", config.batch.page_size).max(1);
        config.batch.partition_deadline = Duration::from_secs(env_u64(
            "BATCH_PARTITION_DEADLINE_SECS",
            config.batch.partition_deadline.as_secs(),
        ));
        config.batch.active_window_days = env_i64("ACTIVE_WINDOW_DAYS", config.batch.active_window_days);
        config.batch.decay_schedule = env_schedule("DECAY_SCHEDULE", DEFAULT_DECAY_SCHEDULE);
        config.batch.rebuild_schedule = env_schedule("REBUILD_SCHEDULE", DEFAULT_REBUILD_SCHEDULE);

        config
    }
}

fn env_schedule(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if cron::Schedule::from_str(&value).is_ok() => value,
        Ok(value) => {
            tracing::warn!(key = key, value = %value, "invalid cron expression, using default");
            default.to_string()
        }
        Err(_) => default.to_string(),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let c = CoreConfig::default();
        assert_eq!(c.sm2.default_easiness, 2.5);
        assert_eq!(c.decay.base_multiplier, 1.5);
        assert_eq!(c.decay.interval_cap_days, 180.0);
        assert_eq!(c.matching.sigma, 80.0);
        assert_eq!(c.feed.review_ttl, Duration::from_secs(600));
        assert_eq!(c.feed.challenge_ttl, Duration::from_secs(1800));
        assert_eq!(c.memory.conflict_retries, 3);
        assert_eq!(c.batch.ability_invalidation_threshold, 25.0);
    }

    #[test]
    fn test_default_schedules_parse() {
        assert!(cron::Schedule::from_str(DEFAULT_DECAY_SCHEDULE).is_ok());
        assert!(cron::Schedule::from_str(DEFAULT_REBUILD_SCHEDULE).is_ok());
    }
}
