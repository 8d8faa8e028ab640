//! Recent-Trend Estimation
//!
//! Difficulty-weighted correctness of the last window minus the window before it,
//! on a −100..+100 scale. Each answer is weighted by 1 + difficulty/1000 so that
//! harder items move the trend more than easy ones.

use serde::{Deserialize, Serialize};

use crate::sanitize::clamp_score;
use crate::types::{MS_PER_DAY, SCORE_MAX};

/// One answer on the timeline
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendSample {
    pub occurred_at_ms: i64,
    pub difficulty: f64,
    pub correct: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

impl TrendDirection {
    /// `threshold` is the absolute trend above which the direction is not stable
    pub fn from_trend(trend: f64, threshold: f64) -> Self {
        if trend > threshold {
            TrendDirection::Improving
        } else if trend < -threshold {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Stable => "stable",
            TrendDirection::Declining => "declining",
        }
    }
}

fn weighted_correctness<'a>(samples: impl Iterator<Item = &'a TrendSample>) -> Option<f64> {
    let mut num = 0.0;
    let mut den = 0.0;
    for s in samples {
        let w = 1.0 + clamp_score(s.difficulty) / SCORE_MAX;
        den += w;
        if s.correct {
            num += w;
        }
    }
    (den > 0.0).then(|| num / den)
}

/// Trend at `now_ms`; 0 unless both windows contain answers
pub fn recent_trend(samples: &[TrendSample], now_ms: i64, window_days: i64) -> f64 {
    let window = (window_days.max(1) as f64 * MS_PER_DAY) as i64;
    let recent_start = now_ms - window;
    let prior_start = recent_start - window;

    let recent = weighted_correctness(
        samples
            .iter()
            .filter(|s| s.occurred_at_ms > recent_start && s.occurred_at_ms <= now_ms),
    );
    let prior = weighted_correctness(
        samples
            .iter()
            .filter(|s| s.occurred_at_ms > prior_start && s.occurred_at_ms <= recent_start),
    );

    match (recent, prior) {
        (Some(r), Some(p)) => ((r - p) * 100.0).clamp(-100.0, 100.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    fn sample(day: i64, correct: bool) -> TrendSample {
        TrendSample {
            occurred_at_ms: day * DAY,
            difficulty: 400.0,
            correct,
        }
    }

    #[test]
    fn test_improving_trend() {
        let now = 100 * DAY;
        let samples = vec![sample(50, false), sample(55, false), sample(80, true), sample(90, true)];
        assert_eq!(recent_trend(&samples, now, 30), 100.0);
    }

    #[test]
    fn test_declining_trend() {
        let now = 100 * DAY;
        let samples = vec![sample(50, true), sample(80, false), sample(90, true)];
        let t = recent_trend(&samples, now, 30);
        assert!((t + 50.0).abs() < 1e-9);
        assert_eq!(TrendDirection::from_trend(t, 5.0), TrendDirection::Declining);
    }

    #[test]
    fn test_missing_window_is_flat() {
        let now = 100 * DAY;
        assert_eq!(recent_trend(&[sample(90, true)], now, 30), 0.0);
        assert_eq!(recent_trend(&[], now, 30), 0.0);
    }

    #[test]
    fn test_harder_items_weigh_more() {
        let now = 100 * DAY;
        let mut samples = vec![sample(50, true), sample(50, false)];
        samples.push(TrendSample {
            occurred_at_ms: 90 * DAY,
            difficulty: 900.0,
            correct: true,
        });
        samples.push(TrendSample {
            occurred_at_ms: 91 * DAY,
            difficulty: 100.0,
            correct: false,
        });
        assert!(recent_trend(&samples, now, 30) > 0.0);
    }
}
