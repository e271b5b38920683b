use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::{ItemId, RankCursor, UserId},
    services::pipeline::{cancellation, PageRequest, Pipeline, PipelineOutput},
};

/// Unvalidated request parameters as received from the HTTP layer
#[derive(Debug, Clone, Default)]
pub struct RecommendationQuery {
    pub user_id: UserId,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    /// Refill a short first page with already-seen posts
    pub backfill: bool,
}

/// Entry point for serving recommendation pages.
///
/// Owns request validation and the side effects around a pipeline run;
/// ranking itself lives in [`Pipeline`].
pub struct RecommendationService {
    pipeline: Arc<Pipeline>,
    page_size_default: usize,
    page_size_max: usize,
    mark_seen_on_serve: bool,
}

impl RecommendationService {
    pub fn new(pipeline: Arc<Pipeline>, config: &Config) -> Self {
        Self {
            pipeline,
            page_size_default: config.page_size_default,
            page_size_max: config.page_size_max,
            mark_seen_on_serve: config.mark_seen_on_serve,
        }
    }

    /// Validates `query` into a pipeline request pinned to `as_of`
    pub fn page_request(
        &self,
        query: RecommendationQuery,
        as_of: DateTime<Utc>,
    ) -> AppResult<PageRequest> {
        let page_size = match query.limit {
            None => self.page_size_default,
            Some(limit) if limit <= 0 => {
                return Err(AppError::InvalidRequest(format!(
                    "limit must be positive, got {}",
                    limit
                )))
            }
            Some(limit) => usize::try_from(limit)
                .unwrap_or(usize::MAX)
                .min(self.page_size_max),
        };

        let after = query
            .cursor
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(RankCursor::decode)
            .transpose()?;

        Ok(PageRequest {
            user_id: query.user_id,
            page_size,
            after,
            as_of,
            backfill: query.backfill,
        })
    }

    /// Serves one page using the current time as the reference instant
    pub async fn recommend(&self, query: RecommendationQuery) -> AppResult<PipelineOutput> {
        self.recommend_at(query, Utc::now()).await
    }

    /// Serves one page as of `as_of`.
    ///
    /// The pipeline runs on its own task. Dropping the returned future drops
    /// the cancellation handle, which stops the pipeline at its next stage
    /// boundary.
    #[tracing::instrument(skip(self, query), fields(user_id = %query.user_id))]
    pub async fn recommend_at(
        &self,
        query: RecommendationQuery,
        as_of: DateTime<Utc>,
    ) -> AppResult<PipelineOutput> {
        let request = self.page_request(query, as_of)?;
        let user_id = request.user_id;

        let (_guard, signal) = cancellation();
        let pipeline = self.pipeline.clone();
        let output = tokio::spawn(async move { pipeline.run(request, signal).await })
            .await
            .map_err(|e| AppError::Internal(format!("pipeline task failed: {}", e)))??;

        if self.mark_seen_on_serve && !output.diagnostics.degraded {
            self.mark_served(user_id, &output.page.item_ids()).await;
        }

        Ok(output)
    }

    async fn mark_served(&self, user_id: UserId, item_ids: &[ItemId]) {
        if item_ids.is_empty() {
            return;
        }
        let source = self.pipeline.source();
        if let Err(e) = source.mark_seen(user_id, item_ids).await {
            tracing::warn!(
                user_id = %user_id,
                items = item_ids.len(),
                source = source.name(),
                error = %e,
                "Failed to mark served posts as viewed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Candidate, CandidateReason, Item, User};
    use crate::services::features::FeatureExtractor;
    use crate::services::pipeline::PipelineConfig;
    use crate::services::scorer::{Scorer, ScorerWeights};
    use crate::services::source::{CandidateBatch, MockCandidateSource};
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn service(source: MockCandidateSource, config: &Config) -> RecommendationService {
        let pipeline = Pipeline::new(
            Arc::new(source),
            FeatureExtractor::default(),
            Scorer::new(ScorerWeights::for_version("v1").unwrap()),
            PipelineConfig::from(config),
        );
        RecommendationService::new(Arc::new(pipeline), config)
    }

    fn query(limit: Option<i64>) -> RecommendationQuery {
        RecommendationQuery {
            user_id: UserId(1),
            limit,
            cursor: None,
            backfill: false,
        }
    }

    fn serving_mock() -> MockCandidateSource {
        let mut source = MockCandidateSource::new();
        source.expect_load_user().returning(|id, _| Ok(User::new(id)));
        source.expect_fetch().returning(|_, _, _, _| {
            Ok(CandidateBatch::exhausted(vec![
                Candidate::new(Item::bare(ItemId(1)), CandidateReason::Fresh),
                Candidate::new(Item::bare(ItemId(2)), CandidateReason::TrendingHour),
            ]))
        });
        source.expect_name().return_const("mock");
        source
    }

    #[test]
    fn test_limit_defaults_and_clamps() {
        let config = Config::default();
        let service = service(MockCandidateSource::new(), &config);

        let default = service.page_request(query(None), as_of()).unwrap();
        assert_eq!(default.page_size, 30);

        let clamped = service.page_request(query(Some(10_000)), as_of()).unwrap();
        assert_eq!(clamped.page_size, 100);
    }

    #[test]
    fn test_non_positive_limit_rejected() {
        let config = Config::default();
        let service = service(MockCandidateSource::new(), &config);

        assert!(matches!(
            service.page_request(query(Some(0)), as_of()),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.page_request(query(Some(-3)), as_of()),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_bad_cursor_rejected() {
        let config = Config::default();
        let service = service(MockCandidateSource::new(), &config);
        let q = RecommendationQuery {
            cursor: Some("%%%".to_string()),
            ..query(None)
        };
        assert_err!(service.page_request(q, as_of()));
    }

    #[tokio::test]
    async fn test_served_items_marked_seen() {
        let mut source = serving_mock();
        source
            .expect_mark_seen()
            .withf(|user, items| *user == UserId(1) && items.to_vec() == vec![ItemId(2), ItemId(1)])
            .times(1)
            .returning(|_, _| Ok(()));

        let config = Config::default();
        let output = assert_ok!(service(source, &config).recommend_at(query(None), as_of()).await);
        assert_eq!(output.page.item_ids(), vec![ItemId(2), ItemId(1)]);
    }

    #[tokio::test]
    async fn test_mark_seen_failure_does_not_fail_response() {
        let mut source = serving_mock();
        source
            .expect_mark_seen()
            .returning(|_, _| Err(AppError::SourceUnavailable("write failed".to_string())));

        let config = Config::default();
        let result = service(source, &config).recommend_at(query(None), as_of()).await;
        assert_ok!(result);
    }

    #[tokio::test]
    async fn test_degraded_page_not_marked_seen() {
        let mut primary = MockCandidateSource::new();
        primary
            .expect_load_user()
            .returning(|_, _| Err(AppError::SourceUnavailable("down".to_string())));
        primary.expect_name().return_const("primary");
        primary.expect_mark_seen().never();

        let config = Config {
            retry_backoff_ms: 1,
            ..Config::default()
        };
        let pipeline = Pipeline::new(
            Arc::new(primary),
            FeatureExtractor::default(),
            Scorer::new(ScorerWeights::for_version("v1").unwrap()),
            PipelineConfig::from(&config),
        )
        .with_fallback(Arc::new(serving_mock()));
        let service = RecommendationService::new(Arc::new(pipeline), &config);

        let output = assert_ok!(service.recommend_at(query(None), as_of()).await);
        assert!(output.diagnostics.degraded);
        assert_eq!(output.page.item_ids(), vec![ItemId(2), ItemId(1)]);
    }

    #[test]
    fn test_backfill_flag_reaches_request() {
        let config = Config::default();
        let service = service(MockCandidateSource::new(), &config);
        let q = RecommendationQuery {
            backfill: true,
            ..query(None)
        };
        assert!(service.page_request(q, as_of()).unwrap().backfill);
    }

    #[tokio::test]
    async fn test_mark_seen_disabled() {
        let mut source = serving_mock();
        source.expect_mark_seen().never();

        let config = Config {
            mark_seen_on_serve: false,
            ..Config::default()
        };
        assert_ok!(service(source, &config).recommend_at(query(None), as_of()).await);
    }
}
