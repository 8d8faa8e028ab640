//! Property-based tests for the scheduling, rating and matching invariants
//!
//! - SM-2: EF never drops below its floor, a failed review resets repetitions
//! - Decay: retention stays in [0, 1] and never rises with elapsed time
//! - Elo: one update moves a rating by at most the first-attempt K
//! - Matching: scores stay in [0, 100]

use proptest::prelude::*;

use lumen_algo::elo::k_max;
use lumen_algo::matching::score;
use lumen_algo::{
    retention, review, update_ability, DecayParams, EloParams, MatchInputs, MatchParams, Sm2Params, Sm2State,
};

// ============================================================================
// Generators
// ============================================================================

fn arb_unit() -> impl Strategy<Value = f64> {
    (0u64..=1000u64).prop_map(|v| v as f64 / 1000.0)
}

fn arb_state() -> impl Strategy<Value = Sm2State> {
    (0i64..=400, 130u64..=400, 0i64..=30).prop_map(|(interval_days, ef, repetitions)| Sm2State {
        interval_days,
        easiness_factor: ef as f64 / 100.0,
        repetitions,
    })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_review_keeps_easiness_floor(state in arb_state(), qualities in prop::collection::vec(0u8..=5, 1..20)) {
        let params = Sm2Params::default();
        let mut current = state;
        for q in qualities {
            current = review(&current, q, &params);
            prop_assert!(current.easiness_factor >= 1.3);
            prop_assert!(current.interval_days >= 0);
            if q < 3 {
                prop_assert_eq!(current.repetitions, 0);
                prop_assert_eq!(current.interval_days, 1);
            }
        }
    }

    #[test]
    fn prop_retention_is_bounded_and_monotone(
        interval in 0i64..=400,
        ef in 130u64..=400,
        t1 in 0u32..=2000,
        extra in 0u32..=2000,
    ) {
        let params = DecayParams::default();
        let ef = ef as f64 / 100.0;
        let early = retention(t1 as f64 / 10.0, interval, ef, &params);
        let late = retention((t1 + extra) as f64 / 10.0, interval, ef, &params);
        prop_assert!((0.0..=1.0).contains(&early));
        prop_assert!((0.0..=1.0).contains(&late));
        prop_assert!(late <= early);
    }

    #[test]
    fn prop_elo_step_is_bounded(
        ability in 0.0f64..=1000.0,
        difficulty in 0.0f64..=1000.0,
        correct in any::<bool>(),
        attempts in 0i64..=10_000,
    ) {
        let params = EloParams::default();
        let update = update_ability(ability, difficulty, correct, attempts, &params);
        prop_assert!(update.delta.abs() <= k_max(&params) + 1e-9);
        prop_assert!((0.0..=1000.0).contains(&update.rating));
    }

    #[test]
    fn prop_match_score_in_range(
        ability in 0.0f64..=1000.0,
        difficulty in 0.0f64..=1000.0,
        pref in arb_unit(),
        topic in arb_unit(),
        recency in arb_unit(),
    ) {
        let inputs = MatchInputs {
            ability,
            difficulty,
            preference_alignment: pref,
            topic_similarity: topic,
            recency_penalty: recency,
        };
        let breakdown = score(&inputs, &MatchParams::default());
        prop_assert!((0.0..=100.0).contains(&breakdown.score));
        prop_assert!(breakdown.why.len() <= MatchParams::default().max_why);
    }
}
