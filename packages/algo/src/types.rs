//! Common Types and Constants
//!
//! Shared data structures used across all algorithm modules.

use serde::{Deserialize, Serialize};

// ==================== Constants ====================

/// Lower bound of the ability / difficulty scale
pub const SCORE_MIN: f64 = 0.0;

/// Upper bound of the ability / difficulty scale
pub const SCORE_MAX: f64 = 1000.0;

/// Ability and difficulty assumed when there is no evidence yet
pub const DEFAULT_SCORE: f64 = 400.0;

/// Numerical stability epsilon
pub const EPSILON: f64 = 1e-10;

/// Milliseconds in one day
pub const MS_PER_DAY: f64 = 86_400_000.0;

// ==================== Level Bands ====================

/// Ability / difficulty band on the 0..1000 scale
///
/// - [0, 300) Beginner
/// - [300, 500) Intermediate
/// - [500, 700) Advanced
/// - [700, 1000] Expert
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelBand {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

impl LevelBand {
    pub const ALL: [LevelBand; 4] = [
        LevelBand::Beginner,
        LevelBand::Intermediate,
        LevelBand::Advanced,
        LevelBand::Expert,
    ];

    pub fn from_score(score: f64) -> Self {
        let score = crate::sanitize::clamp_score(score);
        if score < 300.0 {
            LevelBand::Beginner
        } else if score < 500.0 {
            LevelBand::Intermediate
        } else if score < 700.0 {
            LevelBand::Advanced
        } else {
            LevelBand::Expert
        }
    }

    /// Inclusive lower bound of the band
    pub fn lower_bound(&self) -> f64 {
        match self {
            LevelBand::Beginner => 0.0,
            LevelBand::Intermediate => 300.0,
            LevelBand::Advanced => 500.0,
            LevelBand::Expert => 700.0,
        }
    }

    pub fn next(&self) -> Option<LevelBand> {
        match self {
            LevelBand::Beginner => Some(LevelBand::Intermediate),
            LevelBand::Intermediate => Some(LevelBand::Advanced),
            LevelBand::Advanced => Some(LevelBand::Expert),
            LevelBand::Expert => None,
        }
    }

    /// Storage key (`beginner`, `intermediate`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelBand::Beginner => "beginner",
            LevelBand::Intermediate => "intermediate",
            LevelBand::Advanced => "advanced",
            LevelBand::Expert => "expert",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            LevelBand::Beginner => "Beginner",
            LevelBand::Intermediate => "Intermediate",
            LevelBand::Advanced => "Advanced",
            LevelBand::Expert => "Expert",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "beginner" => Some(LevelBand::Beginner),
            "intermediate" => Some(LevelBand::Intermediate),
            "advanced" => Some(LevelBand::Advanced),
            "expert" => Some(LevelBand::Expert),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries() {
        assert_eq!(LevelBand::from_score(0.0), LevelBand::Beginner);
        assert_eq!(LevelBand::from_score(299.99), LevelBand::Beginner);
        assert_eq!(LevelBand::from_score(300.0), LevelBand::Intermediate);
        assert_eq!(LevelBand::from_score(500.0), LevelBand::Advanced);
        assert_eq!(LevelBand::from_score(700.0), LevelBand::Expert);
        assert_eq!(LevelBand::from_score(1000.0), LevelBand::Expert);
    }

    #[test]
    fn test_band_handles_invalid_scores() {
        assert_eq!(LevelBand::from_score(-50.0), LevelBand::Beginner);
        assert_eq!(LevelBand::from_score(f64::NAN), LevelBand::Intermediate);
    }

    #[test]
    fn test_band_round_trip_keys() {
        for band in LevelBand::ALL {
            assert_eq!(LevelBand::parse(band.as_str()), Some(band));
        }
        assert_eq!(LevelBand::Advanced.next(), Some(LevelBand::Expert));
        assert_eq!(LevelBand::Expert.next(), None);
    }
}
