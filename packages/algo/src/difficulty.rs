//! Item Difficulty Estimation
//!
//! Difficulty is the ability at which expected success is 50% under the Elo model,
//! fitted by maximum likelihood from (ability, outcome) observations:
//!
//! - L(d) = Σ o_i · ln E_i(d) + (1 − o_i) · ln(1 − E_i(d))
//! - dL/dd = 0  ⇔  Σ E_i(d) = Σ o_i
//!
//! Σ E_i(d) is strictly decreasing in d, so the root is found by bisection on the
//! 0..1000 scale (all-correct clips to 0, all-wrong clips to 1000).
//!
//! Segment scores map the success rate inside an ability band onto the same scale:
//! 100% → 0, 50% → 500, 0% → 1000.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::elo::expected_score;
use crate::sanitize::clamp_score;
use crate::types::{LevelBand, DEFAULT_SCORE, SCORE_MAX, SCORE_MIN};

// ==================== Constants ====================

/// Bisection maximum iterations
const MAX_SEARCH_ITERATIONS: usize = 60;

/// Bisection tolerance in rating points
const SEARCH_TOLERANCE: f64 = 1e-6;

// ==================== Parameters ====================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DifficultyParams {
    /// Below this many attempts the default difficulty is used
    pub min_attempts: usize,
    pub default_difficulty: f64,
    /// Fraction trimmed from each end of the answer-time distribution
    pub trim_fraction: f64,
    /// Elo logistic scale
    pub scale: f64,
}

impl Default for DifficultyParams {
    fn default() -> Self {
        Self {
            min_attempts: 3,
            default_difficulty: DEFAULT_SCORE,
            trim_fraction: 0.05,
            scale: 400.0,
        }
    }
}

// ==================== Data Structures ====================

/// One answer to an item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Ability of the answering user at fit time
    pub ability: f64,
    pub correct: bool,
    pub time_spent_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DifficultyFit {
    pub difficulty: f64,
    /// Percentage of correct answers, 0..100
    pub success_rate: f64,
    pub avg_time_seconds: Option<f64>,
    pub attempts: usize,
    /// ln(attempts + 1)
    pub confidence_weight: f64,
    pub by_segment: BTreeMap<LevelBand, f64>,
    /// True when too few attempts forced the default difficulty
    pub defaulted: bool,
}

// ==================== Fitting ====================

/// Maximum-likelihood difficulty, or the default when evidence is thin
pub fn fit_difficulty(observations: &[Observation], params: &DifficultyParams) -> f64 {
    if observations.len() < params.min_attempts {
        return params.default_difficulty;
    }

    let observed: f64 = observations.iter().filter(|o| o.correct).count() as f64;
    let excess = |d: f64| -> f64 {
        observations
            .iter()
            .map(|o| expected_score(clamp_score(o.ability), d, params.scale))
            .sum::<f64>()
            - observed
    };

    let mut lo = SCORE_MIN;
    let mut hi = SCORE_MAX;
    if excess(lo) <= 0.0 {
        return lo;
    }
    if excess(hi) >= 0.0 {
        return hi;
    }

    for _ in 0..MAX_SEARCH_ITERATIONS {
        let mid = (lo + hi) / 2.0;
        if excess(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < SEARCH_TOLERANCE {
            break;
        }
    }

    (lo + hi) / 2.0
}

/// Success rate (fraction 0..1) to the 0..1000 difficulty scale, monotone and clipped
pub fn segment_score(success_fraction: f64) -> f64 {
    clamp_score(SCORE_MAX * (1.0 - success_fraction))
}

/// Mean after discarding `fraction` of samples from each end
pub fn trimmed_mean(values: &[f64], fraction: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let trim = (sorted.len() as f64 * fraction.clamp(0.0, 0.49)).floor() as usize;
    let kept = &sorted[trim..sorted.len() - trim];
    let kept = if kept.is_empty() { &sorted[..] } else { kept };

    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Full difficulty profile for one item
pub fn profile(observations: &[Observation], params: &DifficultyParams) -> DifficultyFit {
    let attempts = observations.len();
    let correct = observations.iter().filter(|o| o.correct).count();
    let success_rate = if attempts > 0 {
        correct as f64 / attempts as f64 * 100.0
    } else {
        0.0
    };

    let times: Vec<f64> = observations
        .iter()
        .filter_map(|o| o.time_spent_ms)
        .filter(|&ms| ms >= 0)
        .map(|ms| ms as f64 / 1000.0)
        .collect();

    let mut segments: BTreeMap<LevelBand, (usize, usize)> = BTreeMap::new();
    for obs in observations {
        let entry = segments.entry(LevelBand::from_score(obs.ability)).or_insert((0, 0));
        entry.0 += 1;
        if obs.correct {
            entry.1 += 1;
        }
    }
    let by_segment = segments
        .into_iter()
        .map(|(band, (n, c))| (band, segment_score(c as f64 / n as f64)))
        .collect();

    DifficultyFit {
        difficulty: fit_difficulty(observations, params),
        success_rate,
        avg_time_seconds: trimmed_mean(&times, params.trim_fraction),
        attempts,
        confidence_weight: (attempts as f64 + 1.0).ln(),
        by_segment,
        defaulted: attempts < params.min_attempts,
    }
}

/// Fit many items in parallel
pub fn profile_many<K>(items: Vec<(K, Vec<Observation>)>, params: &DifficultyParams) -> Vec<(K, DifficultyFit)>
where
    K: Send,
{
    items
        .into_par_iter()
        .map(|(key, observations)| {
            let fit = profile(&observations, params);
            (key, fit)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(ability: f64, correct: bool) -> Observation {
        Observation {
            ability,
            correct,
            time_spent_ms: None,
        }
    }

    // ==================== Fit Tests ====================

    #[test]
    fn test_thin_evidence_defaults() {
        let p = DifficultyParams::default();
        let fit = profile(&[obs(500.0, true), obs(500.0, false)], &p);
        assert_eq!(fit.difficulty, 400.0);
        assert!(fit.defaulted);
    }

    #[test]
    fn test_half_correct_at_equal_ability_fits_that_ability() {
        let p = DifficultyParams::default();
        let data: Vec<Observation> = (0..10).map(|i| obs(600.0, i % 2 == 0)).collect();
        let d = fit_difficulty(&data, &p);
        assert!((d - 600.0).abs() < 1e-3);
    }

    #[test]
    fn test_more_failures_means_harder() {
        let p = DifficultyParams::default();
        let easy: Vec<Observation> = (0..10).map(|i| obs(500.0, i < 8)).collect();
        let hard: Vec<Observation> = (0..10).map(|i| obs(500.0, i < 2)).collect();
        assert!(fit_difficulty(&hard, &p) > fit_difficulty(&easy, &p));
    }

    #[test]
    fn test_all_correct_clips_to_zero_and_all_wrong_to_max() {
        let p = DifficultyParams::default();
        let right: Vec<Observation> = (0..5).map(|_| obs(400.0, true)).collect();
        let wrong: Vec<Observation> = (0..5).map(|_| obs(400.0, false)).collect();
        assert_eq!(fit_difficulty(&right, &p), 0.0);
        assert_eq!(fit_difficulty(&wrong, &p), 1000.0);
    }

    // ==================== Segment Tests ====================

    #[test]
    fn test_segment_score_mapping() {
        assert_eq!(segment_score(1.0), 0.0);
        assert_eq!(segment_score(0.5), 500.0);
        assert_eq!(segment_score(0.0), 1000.0);
        assert_eq!(segment_score(1.4), 0.0);
    }

    #[test]
    fn test_profile_segments_by_band() {
        let p = DifficultyParams::default();
        let data = vec![obs(100.0, false), obs(100.0, false), obs(800.0, true), obs(800.0, true)];
        let fit = profile(&data, &p);
        assert_eq!(fit.by_segment.get(&LevelBand::Beginner), Some(&1000.0));
        assert_eq!(fit.by_segment.get(&LevelBand::Expert), Some(&0.0));
        assert!(fit.by_segment.get(&LevelBand::Advanced).is_none());
        assert!((fit.success_rate - 50.0).abs() < 1e-9);
    }

    // ==================== Trimmed Mean Tests ====================

    #[test]
    fn test_trimmed_mean_drops_outliers() {
        let mut values: Vec<f64> = vec![10.0; 18];
        values.push(0.0);
        values.push(10_000.0);
        let mean = trimmed_mean(&values, 0.05).unwrap();
        assert!((mean - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_trimmed_mean_small_sample_keeps_everything() {
        assert_eq!(trimmed_mean(&[2.0, 4.0], 0.05), Some(3.0));
        assert_eq!(trimmed_mean(&[], 0.05), None);
    }

    #[test]
    fn test_profile_many_preserves_keys() {
        let p = DifficultyParams::default();
        let items = vec![(1_i64, vec![obs(400.0, true)]), (2_i64, vec![])];
        let mut fits = profile_many(items, &p);
        fits.sort_by_key(|(k, _)| *k);
        assert_eq!(fits[0].0, 1);
        assert_eq!(fits[1].1.attempts, 0);
    }
}
