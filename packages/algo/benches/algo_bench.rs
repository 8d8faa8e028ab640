//! Benchmark suite for lumen-algo
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lumen_algo::{
    matching, profile_many, review, DifficultyParams, MatchInputs, MatchParams, Observation,
    Sm2Params, Sm2State,
};

fn bench_sm2_review(c: &mut Criterion) {
    let params = Sm2Params::default();
    let state = Sm2State {
        interval_days: 6,
        easiness_factor: 2.5,
        repetitions: 2,
    };
    c.bench_function("sm2::review", |b| b.iter(|| review(black_box(&state), 4, &params)));
}

fn bench_match_score(c: &mut Criterion) {
    let params = MatchParams::default();
    let inputs = MatchInputs {
        ability: 500.0,
        difficulty: 560.0,
        preference_alignment: 0.6,
        topic_similarity: 0.3,
        recency_penalty: 0.2,
    };
    c.bench_function("matching::score", |b| {
        b.iter(|| matching::score(black_box(&inputs), &params))
    });
}

fn bench_difficulty_profile_many(c: &mut Criterion) {
    let params = DifficultyParams::default();
    let items: Vec<(i64, Vec<Observation>)> = (0..200)
        .map(|item| {
            let obs = (0..100)
                .map(|i| Observation {
                    ability: (i * 10) as f64,
                    correct: (i + item) % 3 != 0,
                    time_spent_ms: Some(1_000 + i * 50),
                })
                .collect();
            (item, obs)
        })
        .collect();
    c.bench_function("difficulty::profile_many(200x100)", |b| {
        b.iter(|| profile_many(black_box(items.clone()), &params))
    });
}

criterion_group!(benches, bench_sm2_review, bench_match_score, bench_difficulty_profile_many);
criterion_main!(benches);
