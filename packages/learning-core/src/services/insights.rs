use chrono::{DateTime, Utc};
use lumen_algo::sanitize::round_to;
use lumen_algo::{LevelBand, TrendDirection};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::CoreConfig;
use crate::content::ContentReadModel;
use crate::error::CoreResult;
use crate::events::ItemType;
use crate::services::ability::{self, UserAbilityProfile};
use crate::services::{difficulty, matching, memory};

const MAX_STANDINGS: usize = 3;
const ATTEMPT_MILESTONES: [i64; 7] = [10, 25, 50, 100, 250, 500, 1000];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStanding {
    pub subject_id: i64,
    pub ability: f64,
    /// Subject ability minus overall
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Milestone {
    NextLevel { band: LevelBand, points_needed: f64 },
    Attempts { target: i64, remaining: i64 },
    Mastery { mastered: i64, reviewed: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInsights {
    pub user_id: i64,
    pub overall: f64,
    pub level: LevelBand,
    pub recent_trend: f64,
    pub trend_direction: TrendDirection,
    pub strengths: Vec<SubjectStanding>,
    pub weaknesses: Vec<SubjectStanding>,
    pub milestones: Vec<Milestone>,
}

/// Subjects above and below the overall ability, strongest deviation first
pub fn standings(profile: &UserAbilityProfile) -> (Vec<SubjectStanding>, Vec<SubjectStanding>) {
    let all: Vec<SubjectStanding> = profile
        .by_subject
        .iter()
        .map(|(&subject_id, &ability)| SubjectStanding {
            subject_id,
            ability,
            delta: round_to(ability - profile.overall, 4),
        })
        .collect();

    let mut strengths: Vec<SubjectStanding> = all.iter().filter(|s| s.delta > 0.0).cloned().collect();
    strengths.sort_by(|a, b| b.delta.total_cmp(&a.delta).then(a.subject_id.cmp(&b.subject_id)));
    strengths.truncate(MAX_STANDINGS);

    let mut weaknesses: Vec<SubjectStanding> = all.into_iter().filter(|s| s.delta < 0.0).collect();
    weaknesses.sort_by(|a, b| a.delta.total_cmp(&b.delta).then(a.subject_id.cmp(&b.subject_id)));
    weaknesses.truncate(MAX_STANDINGS);

    (strengths, weaknesses)
}

pub fn level_milestone(overall: f64) -> Option<Milestone> {
    let next = LevelBand::from_score(overall).next()?;
    Some(Milestone::NextLevel {
        band: next,
        points_needed: round_to((next.lower_bound() - overall).max(0.0), 4),
    })
}

pub fn attempts_milestone(attempts: i64) -> Option<Milestone> {
    ATTEMPT_MILESTONES
        .iter()
        .find(|&&target| target > attempts)
        .map(|&target| Milestone::Attempts {
            target,
            remaining: target - attempts,
        })
}

pub async fn progress_insights(
    pool: &SqlitePool,
    config: &CoreConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> CoreResult<ProgressInsights> {
    let profile = ability::get_or_initial(pool, config, user_id, now).await?;
    let summary = memory::summary(pool, user_id, now, &config.memory).await?;
    let (strengths, weaknesses) = standings(&profile);

    let mut milestones: Vec<Milestone> = [level_milestone(profile.overall), attempts_milestone(profile.total_attempts)]
        .into_iter()
        .flatten()
        .collect();
    if summary.reviewed_items > 0 {
        milestones.push(Milestone::Mastery {
            mastered: summary.mastered_count,
            reviewed: summary.reviewed_items,
        });
    }

    Ok(ProgressInsights {
        user_id,
        overall: profile.overall,
        level: profile.level,
        recent_trend: profile.recent_trend,
        trend_direction: TrendDirection::from_trend(profile.recent_trend, config.batch.trend_stable_band),
        strengths,
        weaknesses,
        milestones,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStep {
    pub item_id: i64,
    pub match_score: f64,
    pub why: Vec<String>,
    pub est_time_minutes: i64,
    pub difficulty_level: LevelBand,
}

/// Minutes to finish a quiz: mean answer time times question count, at least one
pub fn estimate_minutes(avg_time_seconds: Option<f64>, question_count: i64) -> i64 {
    let questions = question_count.max(0);
    let minutes = match avg_time_seconds {
        Some(secs) if secs.is_finite() && secs > 0.0 => (secs * questions as f64 / 60.0).ceil() as i64,
        _ => questions,
    };
    minutes.max(1)
}

/// Best-matching quizzes, in match order
pub async fn learning_path(
    pool: &SqlitePool,
    content: &dyn ContentReadModel,
    config: &CoreConfig,
    user_id: i64,
    limit: usize,
    now: DateTime<Utc>,
) -> CoreResult<Vec<LearningStep>> {
    let limit = limit.clamp(1, config.feed.max_path_len.max(1));
    let scores = matching::scores_or_live(pool, content, config, user_id, limit as i64, now).await?;
    let profiles = difficulty::all_of_type(pool, ItemType::Quiz).await?;

    let mut steps = Vec::with_capacity(scores.len());
    for score in scores.iter().filter(|s| s.item.item_type == ItemType::Quiz) {
        let quiz_id = score.item.item_id;
        let profile = profiles.get(&quiz_id);
        let question_count = content.quiz(quiz_id).await?.map_or(0, |q| q.question_count);
        let difficulty = profile.map_or(config.difficulty.default_difficulty, |p| p.difficulty);

        steps.push(LearningStep {
            item_id: quiz_id,
            match_score: score.score,
            why: score.why.iter().map(|w| w.text().to_string()).collect(),
            est_time_minutes: estimate_minutes(profile.and_then(|p| p.avg_time_seconds), question_count),
            difficulty_level: LevelBand::from_score(difficulty),
        });
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standings_split_around_overall() {
        let config = CoreConfig::default();
        let mut profile = UserAbilityProfile::initial(1, &config, Utc::now());
        profile.overall = 500.0;
        profile.by_subject.insert(1, 620.0);
        profile.by_subject.insert(2, 450.0);
        profile.by_subject.insert(3, 500.0);
        profile.by_subject.insert(4, 300.0);

        let (strengths, weaknesses) = standings(&profile);
        assert_eq!(strengths.iter().map(|s| s.subject_id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(weaknesses.iter().map(|s| s.subject_id).collect::<Vec<_>>(), vec![4, 2]);
    }

    #[test]
    fn test_milestones() {
        assert_eq!(
            level_milestone(420.0),
            Some(Milestone::NextLevel {
                band: LevelBand::Advanced,
                points_needed: 80.0
            })
        );
        assert_eq!(level_milestone(800.0), None);
        assert_eq!(
            attempts_milestone(12),
            Some(Milestone::Attempts { target: 25, remaining: 13 })
        );
        assert_eq!(attempts_milestone(5000), None);
    }

    #[test]
    fn test_estimate_minutes() {
        assert_eq!(estimate_minutes(Some(45.0), 4), 3);
        assert_eq!(estimate_minutes(None, 6), 6);
        assert_eq!(estimate_minutes(Some(5.0), 1), 1);
        assert_eq!(estimate_minutes(None, 0), 1);
    }
}
