//! Data Sanitization
//!
//! Numerical stability utilities shared by the scoring models.
//!
//! Functions:
//! - Finite-value guards
//! - Scale clamping (0..1000 scores, unit interval)
//! - Fixed-decimal rounding used before persisting derived values

use crate::types::{DEFAULT_SCORE, SCORE_MAX, SCORE_MIN};

/// Check whether a slice contains NaN or Inf
pub fn has_invalid_values(arr: &[f64]) -> bool {
    arr.iter().any(|&x| x.is_nan() || x.is_infinite())
}

/// Replace non-finite values with a fallback
pub fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Clamp to the 0..1000 ability / difficulty scale (non-finite becomes the default score)
pub fn clamp_score(value: f64) -> f64 {
    finite_or(value, DEFAULT_SCORE).clamp(SCORE_MIN, SCORE_MAX)
}

/// Clamp to [0, 1] (non-finite becomes 0)
pub fn clamp_unit(value: f64) -> f64 {
    finite_or(value, 0.0).clamp(0.0, 1.0)
}

/// Round to a fixed number of decimals
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== has_invalid_values Tests ====================

    #[test]
    fn test_has_invalid_values_with_valid_array() {
        assert!(!has_invalid_values(&[1.0, 2.0, 3.0]));
        assert!(!has_invalid_values(&[]));
    }

    #[test]
    fn test_has_invalid_values_with_nan_and_inf() {
        assert!(has_invalid_values(&[1.0, f64::NAN]));
        assert!(has_invalid_values(&[f64::NEG_INFINITY, 2.0]));
    }

    // ==================== Clamp Tests ====================

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(1200.0), 1000.0);
        assert_eq!(clamp_score(-3.0), 0.0);
        assert_eq!(clamp_score(f64::NAN), DEFAULT_SCORE);
        assert_eq!(clamp_score(512.5), 512.5);
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(1.5), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(f64::INFINITY), 0.0);
    }

    // ==================== Rounding Tests ====================

    #[test]
    fn test_round_to_four_decimals() {
        assert_eq!(round_to(0.513_417_1, 4), 0.5134);
        assert_eq!(round_to(1.0, 4), 1.0);
    }
}
