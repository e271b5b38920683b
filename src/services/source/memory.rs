use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use super::{clamp_limit, CandidateBatch, CandidateSource, ExclusionPolicy, ExclusionRule};
use crate::{
    error::AppResult,
    models::{Candidate, CandidateReason, ItemId, SourceCursor, User, UserId},
};

/// Candidate source backed by process memory.
///
/// Used for tests and local demos. The pool is bounded by reason priority,
/// then ordered by item id so that offset cursors stay stable across calls.
pub struct InMemoryCandidateSource {
    users: HashMap<UserId, User>,
    candidates: Vec<Candidate>,
    policy: ExclusionPolicy,
    pool_max: usize,
    seen: RwLock<HashMap<UserId, HashSet<ItemId>>>,
}

impl InMemoryCandidateSource {
    pub fn new(policy: ExclusionPolicy, pool_max: usize) -> Self {
        Self {
            users: HashMap::new(),
            candidates: Vec::new(),
            policy,
            pool_max,
            seen: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.users.insert(user.id, user);
        self
    }

    pub fn with_candidate(mut self, candidate: Candidate) -> Self {
        self.candidates.push(candidate);
        self
    }

    pub fn with_candidates(mut self, candidates: impl IntoIterator<Item = Candidate>) -> Self {
        self.candidates.extend(candidates);
        self
    }

    /// Items recorded through `mark_seen` for a user
    pub async fn seen_by(&self, user_id: UserId) -> HashSet<ItemId> {
        self.seen
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Eligible pool for a user: visible at `as_of`, admitted by the policy,
    /// one entry per item (highest-priority reason wins). At most `pool_max`
    /// entries are kept, strongest reasons first, and the result is ordered
    /// by id.
    fn eligible_pool(&self, user: &User, as_of: DateTime<Utc>) -> Vec<Candidate> {
        let mut pool: BTreeMap<ItemId, Candidate> = BTreeMap::new();

        for candidate in &self.candidates {
            let visible = candidate.item.created_at.map_or(true, |ts| ts <= as_of);
            if !visible || !self.policy.admits(user, &candidate.item) {
                continue;
            }

            match pool.get(&candidate.id()) {
                Some(existing) if existing.reason <= candidate.reason => {}
                _ => {
                    pool.insert(candidate.id(), candidate.clone());
                }
            }
        }

        let mut pool: Vec<Candidate> = pool.into_values().collect();
        if pool.len() > self.pool_max {
            pool.sort_by_key(|c| c.reason);
            pool.truncate(self.pool_max);
            pool.sort_by_key(Candidate::id);
        }
        pool
    }
}

#[async_trait::async_trait]
impl CandidateSource for InMemoryCandidateSource {
    async fn load_user(&self, user_id: UserId, _as_of: DateTime<Utc>) -> AppResult<User> {
        let mut user = self
            .users
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| User::new(user_id));

        if let Some(marked) = self.seen.read().await.get(&user_id) {
            user.seen.extend(marked.iter().copied());
        }

        Ok(user)
    }

    async fn fetch(
        &self,
        user: &User,
        as_of: DateTime<Utc>,
        limit: usize,
        cursor: Option<SourceCursor>,
    ) -> AppResult<CandidateBatch> {
        let limit = clamp_limit(limit, self.pool_max)?;
        let offset = match &cursor {
            Some(c) => c.offset()?,
            None => 0,
        };

        let pool = self.eligible_pool(user, as_of);
        let end = (offset + limit).min(pool.len());
        let candidates = pool.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < pool.len()).then(|| SourceCursor::from_offset(end));

        tracing::debug!(
            user_id = %user.id,
            offset,
            returned = candidates.len(),
            pool = pool.len(),
            "In-memory candidates fetched"
        );

        Ok(CandidateBatch {
            candidates,
            next_cursor,
        })
    }

    async fn backfill(
        &self,
        user: &User,
        as_of: DateTime<Utc>,
        limit: usize,
        exclude: &[ItemId],
    ) -> AppResult<Vec<Candidate>> {
        let limit = clamp_limit(limit, self.pool_max)?;
        let policy = self.policy.without(ExclusionRule::AlreadySeen);

        let mut newest: BTreeMap<ItemId, Candidate> = BTreeMap::new();
        for candidate in &self.candidates {
            let visible = candidate.item.created_at.map_or(true, |ts| ts <= as_of);
            if visible && !exclude.contains(&candidate.id()) && policy.admits(user, &candidate.item) {
                newest.entry(candidate.id()).or_insert_with(|| {
                    Candidate::new(candidate.item.clone(), CandidateReason::Backfill)
                });
            }
        }

        // newest first, undated posts last
        let mut newest: Vec<Candidate> = newest.into_values().collect();
        newest.sort_by(|a, b| {
            let by_age = match (a.item.created_at, b.item.created_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_age.then_with(|| b.id().cmp(&a.id()))
        });
        newest.truncate(limit);
        Ok(newest)
    }

    async fn mark_seen(&self, user_id: UserId, item_ids: &[ItemId]) -> AppResult<()> {
        let mut seen = self.seen.write().await;
        seen.entry(user_id).or_default().extend(item_ids.iter().copied());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateReason, Item};
    use crate::services::source::ExclusionRule;
    use chrono::{Duration, TimeZone};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn candidate(id: i64, author: i64, reason: CandidateReason) -> Candidate {
        Candidate::new(
            Item {
                id: ItemId(id),
                author_id: Some(UserId(author)),
                created_at: Some(as_of() - Duration::minutes(id)),
                like_count: Some(id),
                content: None,
            },
            reason,
        )
    }

    fn source() -> InMemoryCandidateSource {
        InMemoryCandidateSource::new(ExclusionPolicy::standard(), 100).with_candidates(
            (1..=5).map(|id| candidate(id, 2, CandidateReason::Fresh)),
        )
    }

    #[tokio::test]
    async fn test_fetch_pages_until_exhausted() {
        let source = source();
        let user = User::new(UserId(1));

        let first = source.fetch(&user, as_of(), 2, None).await.unwrap();
        assert_eq!(first.candidates.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();

        let second = source.fetch(&user, as_of(), 2, Some(cursor)).await.unwrap();
        let third = source
            .fetch(&user, as_of(), 2, second.next_cursor.clone())
            .await
            .unwrap();

        assert_eq!(third.candidates.len(), 1);
        assert!(third.next_cursor.is_none());

        let ids: Vec<i64> = first
            .candidates
            .iter()
            .chain(&second.candidates)
            .chain(&third.candidates)
            .map(|c| c.id().0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_limit_zero_is_rejected() {
        let source = source();
        let result = source.fetch(&User::new(UserId(1)), as_of(), 0, None).await;
        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    async fn test_limit_is_clamped_to_pool_max() {
        let source = InMemoryCandidateSource::new(ExclusionPolicy::standard(), 3)
            .with_candidates((1..=5).map(|id| candidate(id, 2, CandidateReason::Fresh)));

        let batch = source
            .fetch(&User::new(UserId(1)), as_of(), 1000, None)
            .await
            .unwrap();
        assert_eq!(batch.candidates.len(), 3);
        assert!(batch.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_items_keep_strongest_reason() {
        let source = InMemoryCandidateSource::new(ExclusionPolicy::standard(), 10)
            .with_candidate(candidate(7, 2, CandidateReason::TrendingDay))
            .with_candidate(candidate(7, 2, CandidateReason::Friend));

        let batch = source
            .fetch(&User::new(UserId(1)), as_of(), 10, None)
            .await
            .unwrap();
        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(batch.candidates[0].reason, CandidateReason::Friend);
    }

    #[tokio::test]
    async fn test_marked_items_are_excluded_afterwards() {
        let source = source();
        source
            .mark_seen(UserId(1), &[ItemId(1), ItemId(2)])
            .await
            .unwrap();

        let user = source.load_user(UserId(1), as_of()).await.unwrap();
        let batch = source.fetch(&user, as_of(), 10, None).await.unwrap();
        let ids: Vec<i64> = batch.candidates.iter().map(|c| c.id().0).collect();

        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(source.seen_by(UserId(1)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_pool_bound_prefers_stronger_reasons() {
        let source = InMemoryCandidateSource::new(ExclusionPolicy::standard(), 2)
            .with_candidate(candidate(1, 2, CandidateReason::Fresh))
            .with_candidate(candidate(2, 2, CandidateReason::Fresh))
            .with_candidate(candidate(900, 3, CandidateReason::Friend));

        let batch = source
            .fetch(&User::new(UserId(1)), as_of(), 10, None)
            .await
            .unwrap();
        let ids: Vec<i64> = batch.candidates.iter().map(|c| c.id().0).collect();
        assert_eq!(ids, vec![1, 900]);
    }

    #[tokio::test]
    async fn test_backfill_returns_seen_posts_newest_first() {
        let source = source().with_candidate(candidate(6, 1, CandidateReason::Fresh));
        source
            .mark_seen(UserId(1), &[ItemId(1), ItemId(2), ItemId(3)])
            .await
            .unwrap();
        let user = source.load_user(UserId(1), as_of()).await.unwrap();

        let refill = source
            .backfill(&user, as_of(), 3, &[ItemId(1)])
            .await
            .unwrap();
        let ids: Vec<i64> = refill.iter().map(|c| c.id().0).collect();

        // item 6 is self-authored, item 1 is excluded, lower ids are newer
        assert_eq!(ids, vec![2, 3, 4]);
        assert!(refill.iter().all(|c| c.reason == CandidateReason::Backfill));
    }

    #[tokio::test]
    async fn test_self_authored_and_future_items_hidden() {
        let future = Candidate::new(
            Item {
                created_at: Some(as_of() + Duration::hours(1)),
                ..Item::bare(ItemId(50))
            },
            CandidateReason::Fresh,
        );
        let source = InMemoryCandidateSource::new(
            ExclusionPolicy::new(vec![ExclusionRule::SelfAuthored]),
            10,
        )
        .with_candidate(candidate(1, 1, CandidateReason::Fresh))
        .with_candidate(candidate(2, 3, CandidateReason::Fresh))
        .with_candidate(future);

        let batch = source
            .fetch(&User::new(UserId(1)), as_of(), 10, None)
            .await
            .unwrap();
        let ids: Vec<i64> = batch.candidates.iter().map(|c| c.id().0).collect();
        assert_eq!(ids, vec![2]);
    }
}
