//! Feature extraction for (user, candidate) pairs.
//!
//! Every registered feature is "higher is better" and lies in `[0, 1]`.
//! Missing raw attributes map to the neutral value `0.0`; only attributes
//! that are present but corrupt make extraction fail.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Candidate, CandidateReason, FeatureVector, Relationship, User};

pub const RECENCY: &str = "recency";
pub const AFFINITY: &str = "affinity";
pub const POPULARITY: &str = "popularity";
pub const TRENDING: &str = "trending";

/// Names every extracted vector carries
pub const REGISTERED_FEATURES: [&str; 4] = [RECENCY, AFFINITY, POPULARITY, TRENDING];

/// Neutral value for a signal that cannot be computed
pub const NEUTRAL: f64 = 0.0;

const RELATIONSHIP_SHARE: f64 = 0.6;
const INTERACTION_SHARE: f64 = 0.4;
/// Interactions at which the interaction component reaches one half
const INTERACTION_PIVOT: f64 = 5.0;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractionError {
    #[error("item {item_id} has negative like count {value}")]
    NegativeLikeCount { item_id: i64, value: i64 },
}

/// Tunables of the extractor
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    /// Age at which recency halves
    pub recency_half_life_hours: f64,
    /// Like count at which popularity reaches one half
    pub popularity_pivot: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            recency_half_life_hours: 6.0,
            popularity_pivot: 10.0,
        }
    }
}

/// Computes feature vectors. Holds configuration only, no mutable state.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    /// Extracts all registered features for one candidate.
    ///
    /// Time-dependent signals are computed against `as_of`, never the clock.
    pub fn extract(
        &self,
        user: &User,
        candidate: &Candidate,
        as_of: DateTime<Utc>,
    ) -> Result<FeatureVector, ExtractionError> {
        let item = &candidate.item;

        let popularity = match item.like_count {
            Some(likes) if likes < 0 => {
                return Err(ExtractionError::NegativeLikeCount {
                    item_id: item.id.0,
                    value: likes,
                })
            }
            Some(likes) => saturate(likes as f64, self.config.popularity_pivot),
            None => NEUTRAL,
        };

        let recency = item
            .created_at
            .map(|created| self.recency(created, as_of))
            .unwrap_or(NEUTRAL);

        let affinity = item
            .author_id
            .map(|author| {
                let relationship = match user.relationship_with(author) {
                    Relationship::Friend => 1.0,
                    Relationship::Followed => 0.5,
                    Relationship::None => 0.0,
                };
                let interactions =
                    saturate(f64::from(user.interactions_with(author)), INTERACTION_PIVOT);
                RELATIONSHIP_SHARE * relationship + INTERACTION_SHARE * interactions
            })
            .unwrap_or(NEUTRAL);

        let trending = match candidate.reason {
            CandidateReason::TrendingHour => 1.0,
            CandidateReason::TrendingDay => 0.5,
            CandidateReason::Friend
            | CandidateReason::Follow
            | CandidateReason::Fresh
            | CandidateReason::Backfill => 0.0,
        };

        let mut features = FeatureVector::new();
        features.set(RECENCY, recency);
        features.set(AFFINITY, affinity);
        features.set(POPULARITY, popularity);
        features.set(TRENDING, trending);
        Ok(features)
    }

    /// Exponential decay by age; content from the future counts as brand new
    fn recency(&self, created: DateTime<Utc>, as_of: DateTime<Utc>) -> f64 {
        let age_hours = (as_of - created).num_milliseconds().max(0) as f64 / 3_600_000.0;
        0.5f64.powf(age_hours / self.config.recency_half_life_hours)
    }
}

/// Maps `[0, inf)` onto `[0, 1)`, reaching 0.5 at `pivot`
fn saturate(value: f64, pivot: f64) -> f64 {
    value / (value + pivot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, ItemId, UserId};
    use chrono::{Duration, TimeZone};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn post(created_hours_ago: i64, likes: i64, author: i64) -> Candidate {
        Candidate::new(
            Item {
                id: ItemId(1),
                author_id: Some(UserId(author)),
                created_at: Some(as_of() - Duration::hours(created_hours_ago)),
                like_count: Some(likes),
                content: None,
            },
            CandidateReason::Fresh,
        )
    }

    #[test]
    fn test_all_registered_features_present_for_bare_item() {
        let extractor = FeatureExtractor::default();
        let candidate = Candidate::new(Item::bare(ItemId(9)), CandidateReason::Fresh);

        let features = extractor
            .extract(&User::new(UserId(1)), &candidate, as_of())
            .unwrap();

        for name in REGISTERED_FEATURES {
            assert_eq!(features.get(name), Some(NEUTRAL), "feature {}", name);
        }
    }

    #[test]
    fn test_recency_halves_every_half_life() {
        let extractor = FeatureExtractor::default();
        let user = User::new(UserId(1));

        let fresh = extractor.extract(&user, &post(0, 0, 2), as_of()).unwrap();
        let six = extractor.extract(&user, &post(6, 0, 2), as_of()).unwrap();
        let twelve = extractor.extract(&user, &post(12, 0, 2), as_of()).unwrap();

        assert_eq!(fresh.get(RECENCY), Some(1.0));
        assert!((six.get(RECENCY).unwrap() - 0.5).abs() < 1e-12);
        assert!((twelve.get(RECENCY).unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_recency_decreases_with_age() {
        let extractor = FeatureExtractor::default();
        let user = User::new(UserId(1));

        let mut previous = f64::INFINITY;
        for hours in [0, 1, 3, 24, 72, 500] {
            let value = extractor
                .extract(&user, &post(hours, 0, 2), as_of())
                .unwrap()
                .get(RECENCY)
                .unwrap();
            assert!(value < previous);
            previous = value;
        }
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let extractor = FeatureExtractor::default();
        let features = extractor
            .extract(&User::new(UserId(1)), &post(-3, 0, 2), as_of())
            .unwrap();
        assert_eq!(features.get(RECENCY), Some(1.0));
    }

    #[test]
    fn test_affinity_orders_friend_follow_stranger() {
        let extractor = FeatureExtractor::default();
        let mut user = User::new(UserId(1));
        user.follows.extend([UserId(2), UserId(3)]);
        user.friends.insert(UserId(2));

        let friend = extractor.extract(&user, &post(1, 0, 2), as_of()).unwrap();
        let followed = extractor.extract(&user, &post(1, 0, 3), as_of()).unwrap();
        let stranger = extractor.extract(&user, &post(1, 0, 4), as_of()).unwrap();

        assert!(friend.get(AFFINITY) > followed.get(AFFINITY));
        assert!(followed.get(AFFINITY) > stranger.get(AFFINITY));
        assert_eq!(stranger.get(AFFINITY), Some(0.0));
    }

    #[test]
    fn test_interactions_raise_affinity() {
        let extractor = FeatureExtractor::default();
        let mut user = User::new(UserId(1));
        user.author_interactions.insert(UserId(4), 5);

        let features = extractor.extract(&user, &post(1, 0, 4), as_of()).unwrap();
        assert!((features.get(AFFINITY).unwrap() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_popularity_saturates() {
        let extractor = FeatureExtractor::default();
        let user = User::new(UserId(1));

        let ten = extractor.extract(&user, &post(1, 10, 2), as_of()).unwrap();
        let many = extractor.extract(&user, &post(1, 10_000, 2), as_of()).unwrap();

        assert_eq!(ten.get(POPULARITY), Some(0.5));
        assert!(many.get(POPULARITY).unwrap() < 1.0);
        assert!(many.get(POPULARITY) > ten.get(POPULARITY));
    }

    #[test]
    fn test_trending_reason_feature() {
        let extractor = FeatureExtractor::default();
        let user = User::new(UserId(1));
        let hour = Candidate::new(Item::bare(ItemId(1)), CandidateReason::TrendingHour);
        let day = Candidate::new(Item::bare(ItemId(2)), CandidateReason::TrendingDay);

        assert_eq!(
            extractor.extract(&user, &hour, as_of()).unwrap().get(TRENDING),
            Some(1.0)
        );
        assert_eq!(
            extractor.extract(&user, &day, as_of()).unwrap().get(TRENDING),
            Some(0.5)
        );
    }

    #[test]
    fn test_negative_like_count_fails_extraction() {
        let extractor = FeatureExtractor::default();
        let result = extractor.extract(&User::new(UserId(1)), &post(1, -4, 2), as_of());

        assert_eq!(
            result,
            Err(ExtractionError::NegativeLikeCount {
                item_id: 1,
                value: -4
            })
        );
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = FeatureExtractor::default();
        let user = User::new(UserId(1));
        let candidate = post(5, 3, 2);

        let a = extractor.extract(&user, &candidate, as_of()).unwrap();
        let b = extractor.extract(&user, &candidate, as_of()).unwrap();
        assert_eq!(a, b);
    }
}
