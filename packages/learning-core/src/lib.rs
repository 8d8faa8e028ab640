//! Learning intelligence core: an append-only learning event log with the
//! memory, ability, difficulty, matching and scoring state derived from it.

pub mod cache;
pub mod config;
pub mod content;
pub mod core;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod services;
pub mod state;
pub mod workers;

pub use error::{CoreError, CoreResult};
pub use state::LearningCore;
