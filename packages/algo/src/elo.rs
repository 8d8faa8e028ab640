//! Elo Ability Model
//!
//! Each answered question is a match between user ability and question difficulty.
//!
//! - Expected correctness: E = 1 / (1 + 10^((difficulty − ability) / 400))
//! - Update: ability' = ability + K · (O − E), O ∈ {0, 1}
//! - K schedule: K = max(16, 64 / (1 + ln(attempts + 1)))
//!
//! Early activity moves the score fast, later activity stabilises it. Ratings are
//! clamped to the 0..1000 scale.

use serde::{Deserialize, Serialize};

use crate::sanitize::{clamp_score, finite_or};
use crate::types::{DEFAULT_SCORE, SCORE_MAX, SCORE_MIN};

// ==================== Parameters ====================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EloParams {
    /// Rating with no evidence
    pub default_rating: f64,
    /// Logistic scale (rating points per decade of odds)
    pub scale: f64,
    /// K numerator of the decay schedule
    pub k_base: f64,
    /// Floor of K
    pub k_min: f64,
}

impl Default for EloParams {
    fn default() -> Self {
        Self {
            default_rating: DEFAULT_SCORE,
            scale: 400.0,
            k_base: 64.0,
            k_min: 16.0,
        }
    }
}

// ==================== Core Formulas ====================

/// Probability that a user of `ability` answers an item of `difficulty` correctly
pub fn expected_score(ability: f64, difficulty: f64, scale: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((difficulty - ability) / scale))
}

/// K for a rating that has already seen `attempts` answers
pub fn k_factor(attempts: i64, params: &EloParams) -> f64 {
    let n = attempts.max(0) as f64;
    (params.k_base / (1.0 + (n + 1.0).ln())).max(params.k_min)
}

/// Largest possible K (first attempt); bounds the per-event rating change
pub fn k_max(params: &EloParams) -> f64 {
    k_factor(0, params)
}

/// Confidence in a rating after `attempts` answers, in [0, 1]
pub fn confidence(attempts: i64) -> f64 {
    let n = attempts.max(0) as f64;
    ((n + 1.0).ln() / 101f64.ln()).min(1.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EloUpdate {
    pub rating: f64,
    pub delta: f64,
    pub expected: f64,
    pub k: f64,
}

/// One Elo step for the user side of a match
pub fn update_ability(
    ability: f64,
    difficulty: f64,
    is_correct: bool,
    attempts: i64,
    params: &EloParams,
) -> EloUpdate {
    let ability = clamp_score(finite_or(ability, params.default_rating));
    let difficulty = clamp_score(finite_or(difficulty, params.default_rating));
    let expected = expected_score(ability, difficulty, params.scale);
    let actual = if is_correct { 1.0 } else { 0.0 };
    let k = k_factor(attempts, params);
    let rating = (ability + k * (actual - expected)).clamp(SCORE_MIN, SCORE_MAX);

    EloUpdate {
        rating,
        delta: rating - ability,
        expected,
        k,
    }
}

// ==================== Rating Track ====================

/// Running rating with its own attempt counter (overall, one subject, or one tag)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingTrack {
    pub rating: f64,
    pub attempts: i64,
    pub correct: i64,
}

impl RatingTrack {
    pub fn new(params: &EloParams) -> Self {
        Self {
            rating: params.default_rating,
            attempts: 0,
            correct: 0,
        }
    }

    pub fn observe(&mut self, difficulty: f64, is_correct: bool, params: &EloParams) -> EloUpdate {
        let update = update_ability(self.rating, difficulty, is_correct, self.attempts, params);
        self.rating = update.rating;
        self.attempts += 1;
        if is_correct {
            self.correct += 1;
        }
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_score_equal_ratings() {
        let score = expected_score(500.0, 500.0, 400.0);
        assert!((score - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_expected_score_higher_user() {
        assert!(expected_score(700.0, 500.0, 400.0) > 0.7);
        assert!(expected_score(300.0, 500.0, 400.0) < 0.3);
    }

    #[test]
    fn test_k_schedule_decays_to_floor() {
        let p = EloParams::default();
        assert!((k_factor(0, &p) - 64.0).abs() < 1e-9);
        assert!(k_factor(5, &p) < k_factor(1, &p));
        assert_eq!(k_factor(10_000, &p), 16.0);
        assert_eq!(k_max(&p), 64.0);
    }

    #[test]
    fn test_update_correct_answer_raises_rating() {
        let p = EloParams::default();
        let update = update_ability(400.0, 400.0, true, 0, &p);
        assert!((update.delta - 32.0).abs() < 1e-9);
        assert!(update.rating > 400.0);
    }

    #[test]
    fn test_update_wrong_answer_lowers_rating() {
        let update = update_ability(400.0, 400.0, false, 3, &EloParams::default());
        assert!(update.delta < 0.0);
    }

    #[test]
    fn test_update_is_clamped() {
        let p = EloParams::default();
        let low = update_ability(2.0, 900.0, false, 0, &p);
        assert_eq!(low.rating, 0.0);
        let high = update_ability(999.0, 100.0, true, 0, &p);
        assert!(high.rating <= 1000.0);
    }

    #[test]
    fn test_rating_track_counts() {
        let p = EloParams::default();
        let mut track = RatingTrack::new(&p);
        track.observe(400.0, true, &p);
        track.observe(400.0, false, &p);
        assert_eq!(track.attempts, 2);
        assert_eq!(track.correct, 1);
    }

    #[test]
    fn test_confidence_grows_and_saturates() {
        assert_eq!(confidence(0), 0.0);
        assert!(confidence(10) > confidence(2));
        assert_eq!(confidence(500), 1.0);
    }
}
