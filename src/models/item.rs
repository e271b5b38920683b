use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use super::UserId;

/// Identifier of a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A post with whatever raw attributes the data store could provide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Total likes; stored signed because upstream counters are not trusted
    #[serde(default)]
    pub like_count: Option<i64>,
    /// Post body, carried for callers that render full posts
    #[serde(default)]
    pub content: Option<String>,
}

impl Item {
    /// An item that carries only its identifier
    pub fn bare(id: ItemId) -> Self {
        Self {
            id,
            author_id: None,
            created_at: None,
            like_count: None,
            content: None,
        }
    }
}

/// Why an item was considered eligible, in source priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateReason {
    /// Recent post from a mutual follow
    Friend,
    /// Recent post from a followed author
    Follow,
    /// Most liked posts of the last hour
    TrendingHour,
    /// Most liked posts between one hour and one day old
    TrendingDay,
    /// Newest unseen posts regardless of age
    Fresh,
    /// Newest posts the user may already have seen, used to refill short pages
    Backfill,
}

impl Display for CandidateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CandidateReason::Friend => "friend",
            CandidateReason::Follow => "follow",
            CandidateReason::TrendingHour => "trending_hour",
            CandidateReason::TrendingDay => "trending_day",
            CandidateReason::Fresh => "fresh",
            CandidateReason::Backfill => "backfill",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub item: Item,
    pub reason: CandidateReason,
}

impl Candidate {
    pub fn new(item: Item, reason: CandidateReason) -> Self {
        Self { item, reason }
    }

    pub fn id(&self) -> ItemId {
        self.item.id
    }
}
