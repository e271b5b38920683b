use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashSet;

use super::{clamp_limit, CandidateBatch, CandidateSource, ExclusionPolicy, ExclusionRule};
use crate::{
    error::{AppError, AppResult},
    models::{Candidate, CandidateReason, Item, ItemId, SourceCursor, User, UserId},
};

const AUTHOR_WINDOW_HOURS: i64 = 24;
const TRENDING_HOUR: i64 = 1;

#[derive(Debug, sqlx::FromRow)]
struct PostRow {
    id: i64,
    author_id: Option<i64>,
    created_at: Option<DateTime<Utc>>,
    nb_likes: Option<i64>,
    content: Option<String>,
}

impl PostRow {
    fn into_candidate(self, reason: CandidateReason) -> Candidate {
        Candidate::new(
            Item {
                id: ItemId(self.id),
                author_id: self.author_id.map(UserId),
                created_at: self.created_at,
                like_count: self.nb_likes,
                content: self.content,
            },
            reason,
        )
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InteractionRow {
    author_id: i64,
    nb_likes: i64,
}

/// Candidate source reading the Twittix Postgres schema.
///
/// The pool is assembled from five tiers (friends, follows, trending last
/// hour, trending last day, newest) with first-tier-wins deduplication.
/// The pool bound is applied in tier order, then the survivors are ordered
/// by post id so offset cursors are stable.
pub struct PgCandidateSource {
    pool: PgPool,
    policy: ExclusionPolicy,
    pool_max: usize,
}

impl PgCandidateSource {
    pub fn new(pool: PgPool, policy: ExclusionPolicy, pool_max: usize) -> Self {
        Self {
            pool,
            policy,
            pool_max,
        }
    }

    async fn user_ids(&self, sql: &str, user_id: UserId) -> AppResult<HashSet<UserId>> {
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let rows: Vec<(i64,)> = sqlx::query_as(sql)
            .bind(user_id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn author_tier(
        &self,
        user: &User,
        authors: &HashSet<UserId>,
        as_of: DateTime<Utc>,
        reason: CandidateReason,
    ) -> AppResult<Vec<Candidate>> {
        if authors.is_empty() {
            return Ok(Vec::new());
        }

        let author_ids: Vec<i64> = authors.iter().map(|a| a.0).collect();
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let rows: Vec<PostRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.author_id, p.created_at, p.content, COUNT(l.twit_id) AS nb_likes
            FROM twit p
            LEFT JOIN "like" l ON l.twit_id = p.id
            WHERE p.author_id = ANY($2)
              AND p.created_at > $3
              AND p.created_at <= $4
              AND (NOT $5 OR NOT EXISTS (
                SELECT 1 FROM user_twit ut WHERE ut.user_id = $1 AND ut.twit_id = p.id
              ))
            GROUP BY p.id
            ORDER BY p.created_at DESC, p.id ASC
            LIMIT $6
            "#,
        )
        .bind(user.id.0)
        .bind(&author_ids)
        .bind(as_of - Duration::hours(AUTHOR_WINDOW_HOURS))
        .bind(as_of)
        .bind(self.policy.has(ExclusionRule::AlreadySeen))
        .bind(self.pool_max as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(|r| r.into_candidate(reason)).collect())
    }

    async fn trending_tier(
        &self,
        user: &User,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        reason: CandidateReason,
    ) -> AppResult<Vec<Candidate>> {
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let rows: Vec<PostRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.author_id, p.created_at, p.content, COUNT(l.twit_id) AS nb_likes
            FROM twit p
            LEFT JOIN "like" l ON l.twit_id = p.id
            WHERE p.created_at > $2
              AND p.created_at <= $3
              AND (NOT $4 OR NOT EXISTS (
                SELECT 1 FROM user_twit ut WHERE ut.user_id = $1 AND ut.twit_id = p.id
              ))
            GROUP BY p.id
            ORDER BY nb_likes DESC, p.id ASC
            LIMIT $5
            "#,
        )
        .bind(user.id.0)
        .bind(after)
        .bind(until)
        .bind(self.policy.has(ExclusionRule::AlreadySeen))
        .bind(self.pool_max as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(|r| r.into_candidate(reason)).collect())
    }

    async fn fresh_tier(&self, user: &User, as_of: DateTime<Utc>) -> AppResult<Vec<Candidate>> {
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let rows: Vec<PostRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.author_id, p.created_at, p.content, COUNT(l.twit_id) AS nb_likes
            FROM twit p
            LEFT JOIN "like" l ON l.twit_id = p.id
            WHERE (p.created_at IS NULL OR p.created_at <= $2)
              AND (NOT $3 OR NOT EXISTS (
                SELECT 1 FROM user_twit ut WHERE ut.user_id = $1 AND ut.twit_id = p.id
              ))
            GROUP BY p.id
            ORDER BY p.created_at DESC NULLS LAST, p.id DESC
            LIMIT $4
            "#,
        )
        .bind(user.id.0)
        .bind(as_of)
        .bind(self.policy.has(ExclusionRule::AlreadySeen))
        .bind(self.pool_max as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|r| r.into_candidate(CandidateReason::Fresh))
            .collect())
    }

    /// Authors the backfill query must skip, per the enabled rules
    fn excluded_authors(&self, user: &User) -> Vec<i64> {
        let mut authors = Vec::new();
        if self.policy.has(ExclusionRule::SelfAuthored) {
            authors.push(user.id.0);
        }
        if self.policy.has(ExclusionRule::BlockedAuthor) {
            authors.extend(user.blocked_authors.iter().map(|a| a.0));
        }
        authors
    }
}

#[async_trait::async_trait]
impl CandidateSource for PgCandidateSource {
    #[tracing::instrument(skip(self), fields(source = "postgres"))]
    async fn load_user(&self, user_id: UserId, _as_of: DateTime<Utc>) -> AppResult<User> {
        let follows = self
            .user_ids(
                "SELECT followed_id FROM follow WHERE follower_id = $1",
                user_id,
            )
            .await?;

        let friends = self
            .user_ids(
                r#"
                SELECT f1.followed_id
                FROM follow f1
                JOIN follow f2
                  ON f1.followed_id = f2.follower_id
                 AND f1.follower_id = f2.followed_id
                WHERE f1.follower_id = $1
                "#,
                user_id,
            )
            .await?;

        let blocked_authors = if self.policy.has(ExclusionRule::BlockedAuthor) {
            self.user_ids(
                "SELECT blocked_id FROM block WHERE blocker_id = $1",
                user_id,
            )
            .await?
        } else {
            HashSet::new()
        };

        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let interactions: Vec<InteractionRow> = sqlx::query_as(
            r#"
            SELECT p.author_id, COUNT(*) AS nb_likes
            FROM "like" l
            JOIN twit p ON p.id = l.twit_id
            WHERE l.user_id = $1 AND p.author_id IS NOT NULL
            GROUP BY p.author_id
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;

        tracing::debug!(
            follows = follows.len(),
            friends = friends.len(),
            interacted_authors = interactions.len(),
            "User signals loaded"
        );

        Ok(User {
            id: user_id,
            follows,
            friends,
            blocked_authors,
            // already-seen filtering is pushed down into the candidate queries
            seen: HashSet::new(),
            author_interactions: interactions
                .into_iter()
                .map(|row| (UserId(row.author_id), row.nb_likes.clamp(0, u32::MAX as i64) as u32))
                .collect(),
        })
    }

    #[tracing::instrument(skip(self, user, cursor), fields(source = "postgres", user_id = %user.id))]
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

        let hour_ago = as_of - Duration::hours(TRENDING_HOUR);
        let day_ago = as_of - Duration::hours(AUTHOR_WINDOW_HOURS);

        let tiers = vec![
            self.author_tier(user, &user.friends, as_of, CandidateReason::Friend)
                .await?,
            self.author_tier(user, &user.follows, as_of, CandidateReason::Follow)
                .await?,
            self.trending_tier(user, hour_ago, as_of, CandidateReason::TrendingHour)
                .await?,
            self.trending_tier(user, day_ago, hour_ago, CandidateReason::TrendingDay)
                .await?,
            self.fresh_tier(user, as_of).await?,
        ];

        let pool = merge_tiers(tiers, user, &self.policy, self.pool_max);
        let end = (offset + limit).min(pool.len());
        let candidates = pool.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < pool.len()).then(|| SourceCursor::from_offset(end));

        tracing::debug!(
            pool = pool.len(),
            returned = candidates.len(),
            "Postgres candidates fetched"
        );

        Ok(CandidateBatch {
            candidates,
            next_cursor,
        })
    }

    #[tracing::instrument(skip(self, user, exclude), fields(source = "postgres", user_id = %user.id))]
    async fn backfill(
        &self,
        user: &User,
        as_of: DateTime<Utc>,
        limit: usize,
        exclude: &[ItemId],
    ) -> AppResult<Vec<Candidate>> {
        let limit = clamp_limit(limit, self.pool_max)?;
        let exclude_ids: Vec<i64> = exclude.iter().map(|id| id.0).collect();

        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let rows: Vec<PostRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.author_id, p.created_at, p.content, COUNT(l.twit_id) AS nb_likes
            FROM twit p
            LEFT JOIN "like" l ON l.twit_id = p.id
            WHERE (p.created_at IS NULL OR p.created_at <= $1)
              AND NOT (p.id = ANY($2))
              AND (p.author_id IS NULL OR NOT (p.author_id = ANY($3)))
            GROUP BY p.id
            ORDER BY p.created_at DESC NULLS LAST, p.id DESC
            LIMIT $4
            "#,
        )
        .bind(as_of)
        .bind(&exclude_ids)
        .bind(self.excluded_authors(user))
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;

        let policy = self.policy.without(ExclusionRule::AlreadySeen);
        let candidates: Vec<Candidate> = rows
            .into_iter()
            .map(|r| r.into_candidate(CandidateReason::Backfill))
            .filter(|c| policy.admits(user, &c.item))
            .collect();

        tracing::debug!(returned = candidates.len(), "Postgres backfill fetched");
        Ok(candidates)
    }

    #[tracing::instrument(skip(self, item_ids), fields(count = item_ids.len()))]
    async fn mark_seen(&self, user_id: UserId, item_ids: &[ItemId]) -> AppResult<()> {
        if item_ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = item_ids.iter().map(|id| id.0).collect();
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        sqlx::query(
            r#"
            INSERT INTO user_twit (user_id, twit_id)
            SELECT $1, UNNEST($2::bigint[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id.0)
        .bind(&ids)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// Flattens tiers in priority order, keeping the first occurrence of each
/// post and dropping excluded posts. At most `pool_max` posts survive, taken
/// from the highest tiers first; the survivors are then ordered by post id.
fn merge_tiers(
    tiers: Vec<Vec<Candidate>>,
    user: &User,
    policy: &ExclusionPolicy,
    pool_max: usize,
) -> Vec<Candidate> {
    let mut seen_ids = HashSet::new();
    let mut pool: Vec<Candidate> = tiers
        .into_iter()
        .flatten()
        .filter(|c| seen_ids.insert(c.id()))
        .filter(|c| policy.admits(user, &c.item))
        .take(pool_max)
        .collect();
    pool.sort_by_key(Candidate::id);
    pool
}

/// Connectivity failures mean the data store is unavailable; anything else
/// is a genuine database error.
fn classify(err: sqlx::Error) -> AppError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => {
            tracing::warn!(error = %err, "Postgres unavailable");
            AppError::SourceUnavailable(err.to_string())
        }
        other => AppError::Database(other),
    }
}
