//! SM-2 Scheduling and Retention Decay
//!
//! Review update for a quality of recall q ∈ {0..5}:
//! - q < 3: repetitions = 0, interval = 1 day
//! - q ≥ 3: repetitions += 1; interval = 1 (first), 6 (second), round(prev · EF) afterwards
//! - EF' = max(1.3, EF + 0.1 − (5 − q) · (0.08 + (5 − q) · 0.02))
//!
//! Continuous retention between reviews:
//! - R(Δ) = exp(−Δdays / S)
//! - S = max(min_stability, min(interval, cap) · (EF / 2.5) · base_multiplier)
//!
//! Quality of recall when the caller does not grade the answer:
//! - incorrect ⇒ 1
//! - correct, time unknown or > 15 s ⇒ 3
//! - correct, > 7 s ⇒ 4
//! - otherwise ⇒ 5

use serde::{Deserialize, Serialize};

use crate::sanitize::{clamp_unit, finite_or};

// ==================== Constants ====================

/// Highest SM-2 grade
pub const MAX_QUALITY: u8 = 5;

/// Grade assumed for an incorrect answer
pub const QUALITY_INCORRECT: u8 = 1;

// ==================== Parameters ====================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sm2Params {
    /// EF for an item that was never reviewed
    pub default_easiness: f64,
    /// Floor of EF
    pub min_easiness: f64,
    /// Interval after the first successful review
    pub first_interval_days: i64,
    /// Interval after the second successful review
    pub second_interval_days: i64,
    /// Lowest grade counted as a successful recall
    pub pass_quality: u8,
}

impl Default for Sm2Params {
    fn default() -> Self {
        Self {
            default_easiness: 2.5,
            min_easiness: 1.3,
            first_interval_days: 1,
            second_interval_days: 6,
            pass_quality: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecayParams {
    /// Lower bound on stability in days
    pub min_stability: f64,
    /// Interval contribution is capped at this many days
    pub interval_cap_days: f64,
    /// Global stability multiplier
    pub base_multiplier: f64,
    /// EF at which the easiness term is neutral
    pub reference_easiness: f64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self {
            min_stability: 0.5,
            interval_cap_days: 180.0,
            base_multiplier: 1.5,
            reference_easiness: 2.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Correct answers slower than this grade 3
    pub slow_ms: i64,
    /// Correct answers slower than this (and not slow) grade 4
    pub medium_ms: i64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            slow_ms: 15_000,
            medium_ms: 7_000,
        }
    }
}

// ==================== State ====================

/// Scheduling part of a memory stat
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sm2State {
    pub interval_days: i64,
    pub easiness_factor: f64,
    pub repetitions: i64,
}

impl Sm2State {
    pub fn new(params: &Sm2Params) -> Self {
        Self {
            interval_days: 0,
            easiness_factor: params.default_easiness,
            repetitions: 0,
        }
    }
}

// ==================== Review Update ====================

/// Apply one SM-2 review. Grades above 5 are treated as 5.
pub fn review(state: &Sm2State, quality: u8, params: &Sm2Params) -> Sm2State {
    let q = quality.min(MAX_QUALITY);
    let prev_ef = finite_or(state.easiness_factor, params.default_easiness).max(params.min_easiness);

    let (repetitions, interval_days) = if q < params.pass_quality {
        (0, params.first_interval_days)
    } else {
        let reps = state.repetitions.max(0) + 1;
        let interval = match reps {
            1 => params.first_interval_days,
            2 => params.second_interval_days,
            _ => (state.interval_days.max(0) as f64 * prev_ef).round() as i64,
        };
        (reps, interval)
    };

    Sm2State {
        interval_days: interval_days.max(0),
        easiness_factor: next_easiness(prev_ef, q, params),
        repetitions,
    }
}

/// EF' = max(min, EF + 0.1 − (5 − q)(0.08 + (5 − q)·0.02))
pub fn next_easiness(easiness: f64, quality: u8, params: &Sm2Params) -> f64 {
    let miss = (MAX_QUALITY - quality.min(MAX_QUALITY)) as f64;
    (easiness + 0.1 - miss * (0.08 + miss * 0.02)).max(params.min_easiness)
}

// ==================== Retention ====================

/// Stability in days for a scheduled interval and EF
pub fn stability(interval_days: i64, easiness: f64, params: &DecayParams) -> f64 {
    let capped = (interval_days.max(0) as f64).min(params.interval_cap_days);
    let ease_term = finite_or(easiness, params.reference_easiness) / params.reference_easiness;
    (capped * ease_term * params.base_multiplier).max(params.min_stability)
}

/// Retention estimate after `elapsed_days` without review, in [0, 1]
pub fn retention(elapsed_days: f64, interval_days: i64, easiness: f64, params: &DecayParams) -> f64 {
    let elapsed = finite_or(elapsed_days, 0.0);
    if elapsed <= 0.0 {
        return 1.0;
    }
    let s = stability(interval_days, easiness, params);
    clamp_unit((-elapsed / s).exp())
}

// ==================== Quality of Recall ====================

/// Map correctness and answer time to an SM-2 grade
pub fn derive_quality(is_correct: bool, time_spent_ms: Option<i64>, thresholds: &QualityThresholds) -> u8 {
    if !is_correct {
        return QUALITY_INCORRECT;
    }
    match time_spent_ms {
        None => 3,
        Some(ms) if ms > thresholds.slow_ms => 3,
        Some(ms) if ms > thresholds.medium_ms => 4,
        Some(_) => 5,
    }
}

/// Rounded mean of a set of grades (None when empty)
pub fn mean_quality(qualities: &[u8]) -> Option<u8> {
    if qualities.is_empty() {
        return None;
    }
    let sum: f64 = qualities.iter().map(|&q| q.min(MAX_QUALITY) as f64).sum();
    Some((sum / qualities.len() as f64).round() as u8)
}
