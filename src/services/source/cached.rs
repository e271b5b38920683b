use chrono::{DateTime, Utc};

use super::{CandidateBatch, CandidateSource};
use crate::{
    db::{Cache, CacheKey},
    error::{AppError, AppResult},
    models::{Candidate, ItemId, SourceCursor, User, UserId},
};

fn batch_key(user_id: UserId, cursor: Option<&SourceCursor>) -> CacheKey {
    CacheKey::CandidateBatch {
        user_id,
        cursor: cursor.map(|c| c.as_str().to_string()),
    }
}

/// Wraps a primary source and records every successful read to Redis
pub struct RecordingSource<S> {
    inner: S,
    cache: Cache,
    ttl: u64,
}

impl<S: CandidateSource> RecordingSource<S> {
    pub fn new(inner: S, cache: Cache, ttl: u64) -> Self {
        Self { inner, cache, ttl }
    }
}

#[async_trait::async_trait]
impl<S: CandidateSource> CandidateSource for RecordingSource<S> {
    async fn load_user(&self, user_id: UserId, as_of: DateTime<Utc>) -> AppResult<User> {
        let user = self.inner.load_user(user_id, as_of).await?;
        self.cache
            .record(&CacheKey::UserSignals(user_id), &user, self.ttl);
        Ok(user)
    }

    async fn fetch(
        &self,
        user: &User,
        as_of: DateTime<Utc>,
        limit: usize,
        cursor: Option<SourceCursor>,
    ) -> AppResult<CandidateBatch> {
        let key = batch_key(user.id, cursor.as_ref());
        let batch = self.inner.fetch(user, as_of, limit, cursor).await?;
        self.cache.record(&key, &batch, self.ttl);
        Ok(batch)
    }

    // Not recorded: degraded pages are served without refill.
    async fn backfill(
        &self,
        user: &User,
        as_of: DateTime<Utc>,
        limit: usize,
        exclude: &[ItemId],
    ) -> AppResult<Vec<Candidate>> {
        self.inner.backfill(user, as_of, limit, exclude).await
    }

    async fn mark_seen(&self, user_id: UserId, item_ids: &[ItemId]) -> AppResult<()> {
        self.inner.mark_seen(user_id, item_ids).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Read-only source serving the snapshots written by [`RecordingSource`].
///
/// Any miss or Redis failure is reported as `SourceUnavailable`, so the
/// coordinator treats a cold snapshot exactly like a dead primary.
pub struct SnapshotSource {
    cache: Cache,
}

impl SnapshotSource {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    async fn lookup<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> AppResult<T> {
        match self.cache.read_snapshot(key).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(AppError::SourceUnavailable(format!("no snapshot for {}", key))),
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Snapshot lookup failed");
                Err(AppError::SourceUnavailable(e.to_string()))
            }
        }
    }
}

#[async_trait::async_trait]
impl CandidateSource for SnapshotSource {
    async fn load_user(&self, user_id: UserId, _as_of: DateTime<Utc>) -> AppResult<User> {
        self.lookup(&CacheKey::UserSignals(user_id)).await
    }

    async fn fetch(
        &self,
        user: &User,
        _as_of: DateTime<Utc>,
        limit: usize,
        cursor: Option<SourceCursor>,
    ) -> AppResult<CandidateBatch> {
        if limit == 0 {
            return Err(AppError::InvalidRequest(
                "candidate limit must be positive".to_string(),
            ));
        }
        self.lookup(&batch_key(user.id, cursor.as_ref())).await
    }

    async fn mark_seen(&self, _user_id: UserId, _item_ids: &[ItemId]) -> AppResult<()> {
        Err(AppError::SourceUnavailable(
            "snapshot source is read-only".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "snapshot"
    }
}
