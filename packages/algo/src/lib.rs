//! # lumen-algo - learning intelligence algorithms
//!
//! Pure Rust, I/O-free models used by the learning core:
//!
//! - **SM-2** - spaced-repetition scheduling, retention decay, quality of recall
//! - **Elo** - user ability update with a decaying K schedule
//! - **Difficulty** - maximum-likelihood item difficulty, ability-band segments
//! - **Matching** - ZPD fit, preference alignment, topic similarity, recency penalty
//! - **Trend** - difficulty-weighted recent correctness trend
//!
//! ## Modules
//!
//! - [`sm2`] - SM-2 update and continuous retention
//! - [`elo`] - Elo expected score, K factor, rating tracks
//! - [`difficulty`] - difficulty fitting (parallel with rayon)
//! - [`matching`] - match score combination and explanation tokens
//! - [`trend`] - recent trend and direction
//! - [`sanitize`] - numerical guards and clamping
//! - [`types`] - shared constants and level bands
//!
//! ## Example
//!
//! ```rust
//! use lumen_algo::{derive_quality, review, QualityThresholds, Sm2Params, Sm2State};
//!
//! let params = Sm2Params::default();
//! let q = derive_quality(true, Some(3_000), &QualityThresholds::default());
//! let next = review(&Sm2State::new(&params), q, &params);
//! assert_eq!(next.interval_days, 1);
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod difficulty;
pub mod elo;
pub mod matching;
pub mod sanitize;
pub mod sm2;
pub mod trend;
pub mod types;

// ============================================================================
// Re-exports
// ============================================================================

pub use types::*;

pub use sm2::{
    derive_quality, mean_quality, retention, review, stability, DecayParams, QualityThresholds,
    Sm2Params, Sm2State,
};

pub use elo::{confidence, expected_score, k_factor, update_ability, EloParams, EloUpdate, RatingTrack};

pub use difficulty::{
    fit_difficulty, profile, profile_many, segment_score, trimmed_mean, DifficultyFit,
    DifficultyParams, Observation,
};

pub use matching::{
    cosine_similarity, jaccard, mean_vector, preference_alignment, recency_penalty, zpd_score,
    Interests, ItemFacets, MatchBreakdown, MatchInputs, MatchParams, MatchWeights, WhyToken,
};

pub use trend::{recent_trend, TrendDirection, TrendSample};
