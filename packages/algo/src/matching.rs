//! User ↔ Item Match Scoring
//!
//! - gap = difficulty − ability
//! - ZPD fit: zpd = exp(−(gap − target_gap)² / (2σ²)), σ = 80
//! - Preference alignment: 1 when subject and language are both of interest,
//!   otherwise Jaccard overlap of tag sets
//! - Topic similarity: cosine(item embedding, mean embedding of strong items), 0 when absent
//! - Recency penalty: 1 within 24 h of the last answer, linear down to 0 at 14 days
//! - score = 100 · (0.45·zpd + 0.25·pref + 0.15·topic + 0.15·(1 − recency)), clamped to [0, 100]
//!
//! Explanations are short phrases picked from the dominant sub-scores, never numbers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::sanitize::{clamp_unit, finite_or};

// ==================== Parameters ====================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchWeights {
    pub zpd: f64,
    pub preference: f64,
    pub topic: f64,
    pub freshness: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            zpd: 0.45,
            preference: 0.25,
            topic: 0.15,
            freshness: 0.15,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchParams {
    /// ZPD width in rating points
    pub sigma: f64,
    /// Gap at which ZPD peaks
    pub target_gap: f64,
    pub weights: MatchWeights,
    /// Full penalty up to this age
    pub recency_full_ms: i64,
    /// No penalty from this age on
    pub recency_zero_ms: i64,
    /// Maximum number of explanation tokens
    pub max_why: usize,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            sigma: 80.0,
            target_gap: 0.0,
            weights: MatchWeights::default(),
            recency_full_ms: 24 * 3_600_000,
            recency_zero_ms: 14 * 86_400_000,
            max_why: 3,
        }
    }
}

// ==================== Sub-scores ====================

/// Zone-of-proximal-development fit in (0, 1]
pub fn zpd_score(gap: f64, params: &MatchParams) -> f64 {
    let d = finite_or(gap, 0.0) - params.target_gap;
    (-(d * d) / (2.0 * params.sigma * params.sigma)).exp()
}

/// |A ∩ B| / |A ∪ B|, 0 when both are empty
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Cosine similarity clipped to [0, 1]; 0 for mismatched or degenerate vectors
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na < crate::types::EPSILON || nb < crate::types::EPSILON {
        return 0.0;
    }
    clamp_unit(dot / (na * nb))
}

/// Component-wise mean of equally sized vectors
pub fn mean_vector(vectors: &[Vec<f64>]) -> Option<Vec<f64>> {
    let first = vectors.first()?;
    let dim = first.len();
    if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
        return None;
    }
    let mut acc = vec![0.0; dim];
    for v in vectors {
        for (slot, x) in acc.iter_mut().zip(v) {
            *slot += x;
        }
    }
    let n = vectors.len() as f64;
    Some(acc.into_iter().map(|x| x / n).collect())
}

/// Penalty for recently answered items, `elapsed_ms` since the last answer
pub fn recency_penalty(elapsed_ms: Option<i64>, params: &MatchParams) -> f64 {
    let Some(elapsed) = elapsed_ms else {
        return 0.0;
    };
    let elapsed = elapsed.max(0);
    if elapsed <= params.recency_full_ms {
        return 1.0;
    }
    if elapsed >= params.recency_zero_ms {
        return 0.0;
    }
    let span = (params.recency_zero_ms - params.recency_full_ms) as f64;
    clamp_unit(1.0 - (elapsed - params.recency_full_ms) as f64 / span)
}

// ==================== Preferences ====================

/// Descriptive facets of a candidate item
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFacets {
    pub subject_id: Option<i64>,
    pub language: Option<String>,
    pub tags: HashSet<String>,
}

/// Stated interests of a user
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Interests {
    pub subjects: HashSet<i64>,
    pub tags: HashSet<String>,
    /// Empty means any language
    pub languages: HashSet<String>,
}

pub fn preference_alignment(item: &ItemFacets, interests: &Interests) -> f64 {
    let subject_ok = item
        .subject_id
        .map(|s| interests.subjects.contains(&s))
        .unwrap_or(false);
    let language_ok = interests.languages.is_empty()
        || item
            .language
            .as_ref()
            .map(|l| interests.languages.contains(l))
            .unwrap_or(false);

    if subject_ok && language_ok {
        1.0
    } else {
        jaccard(&item.tags, &interests.tags)
    }
}

// ==================== Explanation Tokens ====================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhyToken {
    #[serde(rename = "perfect difficulty")]
    PerfectDifficulty,
    #[serde(rename = "a good challenge")]
    GoodChallenge,
    #[serde(rename = "comfortable practice")]
    ComfortablePractice,
    #[serde(rename = "matches your interests")]
    MatchesInterests,
    #[serde(rename = "related to what you studied")]
    RelatedToStudied,
    #[serde(rename = "fresh material")]
    FreshMaterial,
    #[serde(rename = "recently practiced")]
    RecentlyPracticed,
}

impl WhyToken {
    pub fn text(&self) -> &'static str {
        match self {
            WhyToken::PerfectDifficulty => "perfect difficulty",
            WhyToken::GoodChallenge => "a good challenge",
            WhyToken::ComfortablePractice => "comfortable practice",
            WhyToken::MatchesInterests => "matches your interests",
            WhyToken::RelatedToStudied => "related to what you studied",
            WhyToken::FreshMaterial => "fresh material",
            WhyToken::RecentlyPracticed => "recently practiced",
        }
    }
}

// ==================== Combination ====================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchInputs {
    pub ability: f64,
    pub difficulty: f64,
    pub preference_alignment: f64,
    pub topic_similarity: f64,
    pub recency_penalty: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchBreakdown {
    /// 0..100
    pub score: f64,
    /// difficulty − ability
    pub difficulty_gap: f64,
    pub zpd: f64,
    pub preference_alignment: f64,
    pub topic_similarity: f64,
    pub recency_penalty: f64,
    pub why: Vec<WhyToken>,
}

pub fn score(inputs: &MatchInputs, params: &MatchParams) -> MatchBreakdown {
    let gap = finite_or(inputs.difficulty, 0.0) - finite_or(inputs.ability, 0.0);
    let zpd = zpd_score(gap, params);
    let pref = clamp_unit(inputs.preference_alignment);
    let topic = clamp_unit(inputs.topic_similarity);
    let recency = clamp_unit(inputs.recency_penalty);
    let w = &params.weights;

    let raw = 100.0 * (w.zpd * zpd + w.preference * pref + w.topic * topic + w.freshness * (1.0 - recency));

    MatchBreakdown {
        score: raw.clamp(0.0, 100.0),
        difficulty_gap: gap,
        zpd,
        preference_alignment: pref,
        topic_similarity: topic,
        recency_penalty: recency,
        why: explain(gap, zpd, pref, topic, recency, params),
    }
}

/// Tokens ordered by weighted contribution, strongest first
fn explain(gap: f64, zpd: f64, pref: f64, topic: f64, recency: f64, params: &MatchParams) -> Vec<WhyToken> {
    let w = &params.weights;
    let mut ranked: Vec<(f64, WhyToken)> = Vec::new();

    if zpd >= 0.85 {
        ranked.push((w.zpd * zpd, WhyToken::PerfectDifficulty));
    } else if zpd >= 0.5 {
        let token = if gap > 0.0 {
            WhyToken::GoodChallenge
        } else {
            WhyToken::ComfortablePractice
        };
        ranked.push((w.zpd * zpd, token));
    }
    if pref >= 0.5 {
        ranked.push((w.preference * pref, WhyToken::MatchesInterests));
    }
    if topic >= 0.5 {
        ranked.push((w.topic * topic, WhyToken::RelatedToStudied));
    }
    if recency <= 0.0 {
        ranked.push((w.freshness, WhyToken::FreshMaterial));
    } else if recency >= 0.5 {
        ranked.push((w.freshness * recency, WhyToken::RecentlyPracticed));
    }

    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.into_iter().take(params.max_why).map(|(_, t)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(ability: f64, difficulty: f64) -> MatchInputs {
        MatchInputs {
            ability,
            difficulty,
            preference_alignment: 0.0,
            topic_similarity: 0.0,
            recency_penalty: 0.0,
        }
    }

    fn tags(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    // ==================== ZPD Tests ====================

    #[test]
    fn test_zpd_peaks_at_target_gap() {
        let p = MatchParams::default();
        assert_eq!(zpd_score(0.0, &p), 1.0);
        assert!(zpd_score(80.0, &p) < 1.0);
        assert!((zpd_score(80.0, &p) - zpd_score(-80.0, &p)).abs() < 1e-12);
    }

    #[test]
    fn test_zpd_ordering_around_ability_500() {
        let p = MatchParams::default();
        let s = |d: f64| score(&inputs(500.0, d), &p).zpd;
        assert!(s(500.0) > s(300.0));
        assert!(s(580.0) > s(300.0));
        assert!(s(580.0) > s(800.0));
        assert!(s(500.0) > s(800.0));
    }

    // ==================== Sub-score Tests ====================

    #[test]
    fn test_recency_penalty_window() {
        let p = MatchParams::default();
        let hour = 3_600_000;
        assert_eq!(recency_penalty(None, &p), 0.0);
        assert_eq!(recency_penalty(Some(2 * hour), &p), 1.0);
        assert_eq!(recency_penalty(Some(24 * hour), &p), 1.0);
        assert_eq!(recency_penalty(Some(14 * 24 * hour), &p), 0.0);
        let mid = recency_penalty(Some(7 * 24 * hour + 12 * hour), &p);
        assert!((mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recent_answer_drops_score_by_fifteen() {
        let p = MatchParams::default();
        let fresh = score(&inputs(500.0, 580.0), &p);
        let mut recent_inputs = inputs(500.0, 580.0);
        recent_inputs.recency_penalty = recency_penalty(Some(3_600_000), &p);
        let recent = score(&recent_inputs, &p);
        assert!((fresh.score - recent.score - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_preference_alignment_full_and_partial() {
        let interests = Interests {
            subjects: [7].into_iter().collect(),
            tags: tags(&["algebra", "geometry"]),
            languages: tags(&["en"]),
        };
        let full = ItemFacets {
            subject_id: Some(7),
            language: Some("en".into()),
            tags: tags(&[]),
        };
        assert_eq!(preference_alignment(&full, &interests), 1.0);

        let partial = ItemFacets {
            subject_id: Some(9),
            language: Some("en".into()),
            tags: tags(&["algebra", "calculus"]),
        };
        assert!((preference_alignment(&partial, &interests) - 1.0 / 3.0).abs() < 1e-9);

        let wrong_language = ItemFacets {
            subject_id: Some(7),
            language: Some("fr".into()),
            tags: tags(&[]),
        };
        assert_eq!(preference_alignment(&wrong_language, &interests), 0.0);
    }

    #[test]
    fn test_cosine_and_mean_vector() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(mean_vector(&[vec![1.0, 3.0], vec![3.0, 5.0]]), Some(vec![2.0, 4.0]));
        assert_eq!(mean_vector(&[]), None);
    }

    // ==================== Score Tests ====================

    #[test]
    fn test_score_bounds() {
        let p = MatchParams::default();
        let best = MatchInputs {
            ability: 500.0,
            difficulty: 500.0,
            preference_alignment: 1.0,
            topic_similarity: 1.0,
            recency_penalty: 0.0,
        };
        assert!((score(&best, &p).score - 100.0).abs() < 1e-9);
        let worst = MatchInputs {
            ability: 0.0,
            difficulty: 1000.0,
            preference_alignment: -3.0,
            topic_similarity: f64::NAN,
            recency_penalty: 5.0,
        };
        let s = score(&worst, &p).score;
        assert!((0.0..=100.0).contains(&s));
    }

    #[test]
    fn test_why_tokens_have_no_numbers_and_are_bounded() {
        let p = MatchParams::default();
        let b = score(
            &MatchInputs {
                ability: 500.0,
                difficulty: 510.0,
                preference_alignment: 1.0,
                topic_similarity: 0.9,
                recency_penalty: 0.0,
            },
            &p,
        );
        assert_eq!(b.why.len(), 3);
        assert_eq!(b.why[0], WhyToken::PerfectDifficulty);
        for token in &b.why {
            assert!(!token.text().chars().any(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_why_challenge_vs_comfort() {
        let p = MatchParams::default();
        assert!(score(&inputs(500.0, 560.0), &p).why.contains(&WhyToken::GoodChallenge));
        assert!(score(&inputs(500.0, 440.0), &p).why.contains(&WhyToken::ComfortablePractice));
    }
}
