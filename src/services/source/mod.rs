/// Candidate source abstraction
///
/// A candidate source owns access to user signals and eligible posts. It is
/// the only place where the pipeline touches external data, so it is also
/// the only stage that may suspend.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{
    error::AppResult,
    models::{Candidate, Item, ItemId, SourceCursor, User, UserId},
};

pub mod cached;
pub mod memory;
pub mod postgres;

pub use cached::{RecordingSource, SnapshotSource};
pub use memory::InMemoryCandidateSource;
pub use postgres::PgCandidateSource;

/// One page of candidates returned by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub candidates: Vec<Candidate>,
    /// `None` once the underlying pool is exhausted
    pub next_cursor: Option<SourceCursor>,
}

impl CandidateBatch {
    pub fn exhausted(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            next_cursor: None,
        }
    }
}

/// Trait for candidate sources
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CandidateSource: Send + Sync {
    /// Load the requesting user's signals as of the given instant
    async fn load_user(&self, user_id: UserId, as_of: DateTime<Utc>) -> AppResult<User>;

    /// Fetch up to `limit` eligible candidates starting at `cursor`.
    ///
    /// Returns fewer than `limit` only when the pool is exhausted, in which
    /// case `next_cursor` is `None`. A `limit` of zero is rejected.
    async fn fetch(
        &self,
        user: &User,
        as_of: DateTime<Utc>,
        limit: usize,
        cursor: Option<SourceCursor>,
    ) -> AppResult<CandidateBatch>;

    /// Newest posts regardless of whether the user has seen them, skipping
    /// `exclude`. Used to refill short pages; sources without such a read
    /// return nothing.
    async fn backfill(
        &self,
        _user: &User,
        _as_of: DateTime<Utc>,
        _limit: usize,
        _exclude: &[ItemId],
    ) -> AppResult<Vec<Candidate>> {
        Ok(Vec::new())
    }

    /// Record that the user has been shown these items
    async fn mark_seen(&self, user_id: UserId, item_ids: &[ItemId]) -> AppResult<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// A single reason for hiding an item from a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionRule {
    AlreadySeen,
    SelfAuthored,
    BlockedAuthor,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown exclusion rule '{0}'")]
pub struct UnknownExclusionRule(String);

impl FromStr for ExclusionRule {
    type Err = UnknownExclusionRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "already_seen" => Ok(ExclusionRule::AlreadySeen),
            "self_authored" => Ok(ExclusionRule::SelfAuthored),
            "blocked_author" => Ok(ExclusionRule::BlockedAuthor),
            other => Err(UnknownExclusionRule(other.to_string())),
        }
    }
}

/// Configured set of exclusion rules shared by all sources
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExclusionPolicy {
    rules: Vec<ExclusionRule>,
}

impl ExclusionPolicy {
    pub fn new(mut rules: Vec<ExclusionRule>) -> Self {
        rules.dedup();
        Self { rules }
    }

    pub fn standard() -> Self {
        Self::new(vec![ExclusionRule::AlreadySeen, ExclusionRule::SelfAuthored])
    }

    pub fn has(&self, rule: ExclusionRule) -> bool {
        self.rules.contains(&rule)
    }

    /// Returns the first rule that hides `item` from `user`
    pub fn violated_by(&self, user: &User, item: &Item) -> Option<ExclusionRule> {
        self.rules.iter().copied().find(|rule| match rule {
            ExclusionRule::AlreadySeen => user.seen.contains(&item.id),
            ExclusionRule::SelfAuthored => item.author_id == Some(user.id),
            ExclusionRule::BlockedAuthor => item
                .author_id
                .is_some_and(|author| user.blocked_authors.contains(&author)),
        })
    }

    pub fn admits(&self, user: &User, item: &Item) -> bool {
        self.violated_by(user, item).is_none()
    }

    /// The same policy with `rule` switched off
    pub fn without(&self, rule: ExclusionRule) -> Self {
        Self {
            rules: self.rules.iter().copied().filter(|r| *r != rule).collect(),
        }
    }
}

/// Clamps a requested batch size to the configured maximum
pub(crate) fn clamp_limit(limit: usize, max: usize) -> AppResult<usize> {
    if limit == 0 {
        return Err(crate::error::AppError::InvalidRequest(
            "candidate limit must be positive".to_string(),
        ));
    }
    Ok(limit.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, author: Option<i64>) -> Item {
        Item {
            author_id: author.map(UserId),
            ..Item::bare(ItemId(id))
        }
    }

    #[test]
    fn test_policy_applies_each_rule() {
        let mut user = User::new(UserId(1));
        user.seen.insert(ItemId(10));
        user.blocked_authors.insert(UserId(66));

        let policy = ExclusionPolicy::new(vec![
            ExclusionRule::AlreadySeen,
            ExclusionRule::SelfAuthored,
            ExclusionRule::BlockedAuthor,
        ]);

        assert_eq!(
            policy.violated_by(&user, &item(10, Some(2))),
            Some(ExclusionRule::AlreadySeen)
        );
        assert_eq!(
            policy.violated_by(&user, &item(11, Some(1))),
            Some(ExclusionRule::SelfAuthored)
        );
        assert_eq!(
            policy.violated_by(&user, &item(12, Some(66))),
            Some(ExclusionRule::BlockedAuthor)
        );
        assert!(policy.admits(&user, &item(13, Some(2))));
        assert!(policy.admits(&user, &item(14, None)));
    }

    #[test]
    fn test_disabled_rule_is_not_applied() {
        let mut user = User::new(UserId(1));
        user.blocked_authors.insert(UserId(66));

        let policy = ExclusionPolicy::standard();
        assert!(policy.admits(&user, &item(12, Some(66))));
    }

    #[test]
    fn test_without_drops_only_that_rule() {
        let mut user = User::new(UserId(1));
        user.seen.insert(ItemId(10));

        let backfill = ExclusionPolicy::standard().without(ExclusionRule::AlreadySeen);
        assert!(backfill.admits(&user, &item(10, Some(2))));
        assert!(!backfill.admits(&user, &item(11, Some(1))));
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(50, 20).unwrap(), 20);
        assert_eq!(clamp_limit(5, 20).unwrap(), 5);
        assert!(clamp_limit(0, 20).is_err());
    }

    #[test]
    fn test_parse_rule() {
        assert_eq!(
            "self_authored".parse::<ExclusionRule>().unwrap(),
            ExclusionRule::SelfAuthored
        );
        assert!("muted".parse::<ExclusionRule>().is_err());
    }
}
