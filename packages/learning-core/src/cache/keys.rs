use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FeedConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Personalized,
    Review,
    Explore,
    Challenge,
}

impl FeedKind {
    pub const ALL: [FeedKind; 4] = [
        FeedKind::Personalized,
        FeedKind::Review,
        FeedKind::Explore,
        FeedKind::Challenge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Personalized => "personalized",
            FeedKind::Review => "review",
            FeedKind::Explore => "explore",
            FeedKind::Challenge => "challenge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "personalized" => Some(FeedKind::Personalized),
            "review" => Some(FeedKind::Review),
            "explore" => Some(FeedKind::Explore),
            "challenge" => Some(FeedKind::Challenge),
            _ => None,
        }
    }

    pub fn ttl(&self, config: &FeedConfig) -> Duration {
        match self {
            FeedKind::Personalized => config.personalized_ttl,
            FeedKind::Review => config.review_ttl,
            FeedKind::Explore => config.explore_ttl,
            FeedKind::Challenge => config.challenge_ttl,
        }
    }
}
