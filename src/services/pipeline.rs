//! Pipeline coordinator.
//!
//! Drives one request through `Started → CandidatesFetched →
//! FeaturesExtracted → Scored → Ranked → Completed`, or into `Failed` from
//! any non-terminal state. Only the fetch stage suspends; the later stages
//! are pure computations over the fetched pool.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::{
        Candidate, FeatureVector, PipelineDiagnostics, PipelineState, RankCursor, RankedPage,
        ItemId, ScoredCandidate, SourceCursor, Stage, StageLatency, User, UserId,
    },
    services::{
        features::{FeatureConfig, FeatureExtractor},
        ranker::Ranker,
        retry::{retry_unavailable, RetryPolicy},
        scorer::{Scorer, ScorerWeights},
        source::CandidateSource,
    },
};

/// Limits the coordinator enforces on every request
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub candidate_pool_max: usize,
    pub stage_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            candidate_pool_max: 500,
            stage_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Deadline for one source attempt. The stage budget minus the retry
    /// backoff is split between every primary attempt and one fallback
    /// attempt, so a hanging source still leaves time for both.
    pub fn attempt_timeout(&self) -> Duration {
        let attempts = self.retry.max_retries.saturating_add(2);
        let spare = self.stage_timeout.saturating_sub(self.retry.total_backoff());
        (spare / attempts).max(Duration::from_millis(1))
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            candidate_pool_max: config.candidate_pool_max,
            stage_timeout: config.stage_timeout(),
            retry: RetryPolicy {
                max_retries: config.retry_count,
                initial_backoff: config.retry_backoff(),
                ..RetryPolicy::default()
            },
        }
    }
}

/// A validated request for one page of recommendations
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub user_id: UserId,
    pub page_size: usize,
    pub after: Option<RankCursor>,
    /// Reference instant for every time-dependent signal
    pub as_of: DateTime<Utc>,
    /// Refill a short first page with the newest posts, seen or not
    pub backfill: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub page: RankedPage,
    pub diagnostics: PipelineDiagnostics,
}

/// Sender half of a cancellation signal. Dropping it cancels as well.
#[derive(Debug)]
pub struct CancellationHandle(watch::Sender<bool>);

impl CancellationHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiver half checked by the coordinator between stages
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
    // keeps the channel open for signals nobody can cancel
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancellationSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation is requested or the handle is dropped
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn cancellation() -> (CancellationHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancellationHandle(tx),
        CancellationSignal {
            rx,
            _keepalive: None,
        },
    )
}

/// What one source returned for a request
struct SourceRead {
    user: User,
    candidates: Vec<Candidate>,
    backfill: Vec<Candidate>,
}

/// Result of the fetch stage
struct FetchedPool {
    read: SourceRead,
    retries: u32,
    degraded: bool,
}

/// Request-scoped bookkeeping of the state machine
struct Run {
    state: PipelineState,
    diagnostics: PipelineDiagnostics,
    user_id: UserId,
}

impl Run {
    fn new(user_id: UserId) -> Self {
        Self {
            state: PipelineState::Started,
            diagnostics: PipelineDiagnostics::default(),
            user_id,
        }
    }

    fn stage(&self) -> Stage {
        self.state.pending_stage().unwrap_or(Stage::Rank)
    }

    fn advance(&mut self, started: Instant) {
        let stage = self.stage();
        self.diagnostics.stage_latencies.push(StageLatency {
            stage,
            elapsed_us: started.elapsed().as_micros() as u64,
        });
        if let Some(next) = self.state.next() {
            tracing::debug!(user_id = %self.user_id, from = ?self.state, to = ?next, "Pipeline transition");
            self.state = next;
        }
        self.diagnostics.state = self.state;
    }

    fn complete(&mut self) {
        self.state = PipelineState::Completed;
        self.diagnostics.state = PipelineState::Completed;
    }

    fn fail(&mut self, err: AppError) -> AppError {
        tracing::warn!(
            user_id = %self.user_id,
            state = ?self.state,
            kind = err.kind(),
            error = %err,
            "Pipeline failed"
        );
        self.state = PipelineState::Failed;
        self.diagnostics.state = PipelineState::Failed;
        err
    }
}

/// Sequences candidate fetch, feature extraction, scoring and ranking
pub struct Pipeline {
    source: Arc<dyn CandidateSource>,
    fallback: Option<Arc<dyn CandidateSource>>,
    extractor: FeatureExtractor,
    scorer: Scorer,
    ranker: Ranker,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn CandidateSource>,
        extractor: FeatureExtractor,
        scorer: Scorer,
        config: PipelineConfig,
    ) -> Self {
        let ranker = Ranker::new(scorer.weights_version());
        Self {
            source,
            fallback: None,
            extractor,
            scorer,
            ranker,
            config,
        }
    }

    /// Builds a pipeline from application configuration
    pub fn from_config(config: &Config, source: Arc<dyn CandidateSource>) -> anyhow::Result<Self> {
        let weights = ScorerWeights::for_version(&config.scorer_weights_version)?;
        let extractor = FeatureExtractor::new(FeatureConfig {
            recency_half_life_hours: config.recency_half_life_hours,
            popularity_pivot: config.popularity_pivot,
        });
        Ok(Self::new(
            source,
            extractor,
            Scorer::new(weights),
            PipelineConfig::from(config),
        ))
    }

    /// Source consulted once the primary keeps failing with `SourceUnavailable`
    pub fn with_fallback(mut self, fallback: Arc<dyn CandidateSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn source(&self) -> Arc<dyn CandidateSource> {
        self.source.clone()
    }

    pub fn weights_version(&self) -> &str {
        self.scorer.weights_version()
    }

    /// Runs the pipeline for one request
    pub async fn run(
        &self,
        request: PageRequest,
        cancel: CancellationSignal,
    ) -> AppResult<PipelineOutput> {
        let mut run = Run::new(request.user_id);

        match self.execute(&request, cancel, &mut run).await {
            Ok(page) => {
                run.complete();
                tracing::info!(
                    user_id = %request.user_id,
                    returned = page.entries.len(),
                    pool_size = run.diagnostics.pool_size,
                    dropped = run.diagnostics.dropped_candidates,
                    retries = run.diagnostics.source_retries,
                    degraded = run.diagnostics.degraded,
                    latencies = ?run.diagnostics.stage_latencies,
                    "Recommendation pipeline completed"
                );
                Ok(PipelineOutput {
                    page,
                    diagnostics: run.diagnostics,
                })
            }
            Err(err) => Err(run.fail(err)),
        }
    }

    async fn execute(
        &self,
        request: &PageRequest,
        mut cancel: CancellationSignal,
        run: &mut Run,
    ) -> AppResult<RankedPage> {
        let budget = self.config.stage_timeout;

        // Fetch
        self.check_cancelled(&cancel, Stage::Fetch)?;
        let started = Instant::now();
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled(Stage::Fetch)),
            result = tokio::time::timeout(budget, self.fetch_pool(request)) => {
                result.map_err(|_| timeout(Stage::Fetch, budget))?
            }
        }?;
        run.diagnostics.source_retries = fetched.retries;
        run.diagnostics.degraded = fetched.degraded;
        run.diagnostics.pool_size = fetched.read.candidates.len();
        run.advance(started);
        let SourceRead {
            user,
            candidates,
            backfill,
        } = fetched.read;

        // Extract
        self.check_cancelled(&cancel, Stage::Extract)?;
        let started = Instant::now();
        let extracted = self.extract_all(&user, candidates, request, run);
        let extracted_backfill = self.extract_all(&user, backfill, request, run);
        within_budget(started, budget, Stage::Extract)?;
        run.advance(started);

        // Score
        self.check_cancelled(&cancel, Stage::Score)?;
        let started = Instant::now();
        let scored = self.score_all(extracted)?;
        let scored_backfill = self.score_all(extracted_backfill)?;
        within_budget(started, budget, Stage::Score)?;
        run.advance(started);

        // Rank
        self.check_cancelled(&cancel, Stage::Rank)?;
        let started = Instant::now();
        let mut page = self
            .ranker
            .rank(scored, request.page_size, request.after.as_ref())?;
        let short = request.page_size.saturating_sub(page.entries.len());
        if short > 0 && page.next_cursor.is_none() && !scored_backfill.is_empty() {
            let refill = self.ranker.rank(scored_backfill, short, None)?;
            run.diagnostics.backfilled = refill.entries.len();
            page.entries.extend(refill.entries);
        }
        within_budget(started, budget, Stage::Rank)?;
        run.advance(started);

        Ok(page)
    }

    /// Extracts features, dropping candidates whose attributes are unusable
    fn extract_all(
        &self,
        user: &User,
        candidates: Vec<Candidate>,
        request: &PageRequest,
        run: &mut Run,
    ) -> Vec<(Candidate, FeatureVector)> {
        let mut extracted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.extractor.extract(user, &candidate, request.as_of) {
                Ok(features) => extracted.push((candidate, features)),
                Err(e) => {
                    run.diagnostics.dropped_candidates += 1;
                    tracing::warn!(
                        user_id = %request.user_id,
                        item_id = %candidate.id(),
                        error = %e,
                        "Dropping candidate with unusable attributes"
                    );
                }
            }
        }
        extracted
    }

    fn score_all(
        &self,
        extracted: Vec<(Candidate, FeatureVector)>,
    ) -> AppResult<Vec<ScoredCandidate>> {
        extracted
            .into_iter()
            .map(|(candidate, features)| {
                let score = self.scorer.score(&features);
                ScoredCandidate::new(candidate, features, score)
            })
            .collect()
    }

    fn check_cancelled(&self, cancel: &CancellationSignal, stage: Stage) -> AppResult<()> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(stage));
        }
        Ok(())
    }

    /// Loads the user and drains the source, retrying transient failures
    /// and falling back to the secondary source when configured.
    async fn fetch_pool(&self, request: &PageRequest) -> AppResult<FetchedPool> {
        let outcome = retry_unavailable(&self.config.retry, move || {
            self.attempt(self.source.as_ref(), request)
        })
        .await;

        match (outcome.result, &self.fallback) {
            (Ok(read), _) => Ok(FetchedPool {
                read,
                retries: outcome.retries,
                degraded: false,
            }),
            (Err(AppError::SourceUnavailable(reason)), Some(fallback)) => {
                tracing::warn!(
                    user_id = %request.user_id,
                    primary = self.source.name(),
                    fallback = fallback.name(),
                    reason = %reason,
                    "Primary source unavailable, serving from fallback"
                );
                match self.attempt(fallback.as_ref(), request).await {
                    Ok(read) => Ok(FetchedPool {
                        read,
                        retries: outcome.retries,
                        degraded: true,
                    }),
                    Err(fallback_err) => {
                        tracing::warn!(error = %fallback_err, "Fallback source failed as well");
                        Err(AppError::SourceUnavailable(reason))
                    }
                }
            }
            (Err(e), _) => Err(e),
        }
    }

    /// One read from `source` under its own deadline. A source that does
    /// not answer in time counts as unavailable, so it can be retried.
    async fn attempt(
        &self,
        source: &dyn CandidateSource,
        request: &PageRequest,
    ) -> AppResult<SourceRead> {
        let deadline = self.config.attempt_timeout();
        match tokio::time::timeout(deadline, self.fetch_from(source, request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    source = source.name(),
                    deadline_ms = deadline.as_millis() as u64,
                    "Source attempt timed out"
                );
                Err(AppError::SourceUnavailable(format!(
                    "{} did not answer within {}ms",
                    source.name(),
                    deadline.as_millis()
                )))
            }
        }
    }

    async fn fetch_from(
        &self,
        source: &dyn CandidateSource,
        request: &PageRequest,
    ) -> AppResult<SourceRead> {
        let user = source.load_user(request.user_id, request.as_of).await?;

        let pool_max = self.config.candidate_pool_max;
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut cursor: Option<SourceCursor> = None;

        while candidates.len() < pool_max {
            let remaining = pool_max - candidates.len();
            let batch = source
                .fetch(&user, request.as_of, remaining, cursor.take())
                .await?;

            let received = batch.candidates.len();
            candidates.extend(batch.candidates);

            match batch.next_cursor {
                Some(next) if received > 0 => cursor = Some(next),
                Some(_) => {
                    tracing::warn!(
                        source = source.name(),
                        "Source returned an empty batch with a cursor, treating as exhausted"
                    );
                    break;
                }
                None => break,
            }
        }

        candidates.truncate(pool_max);

        let wanted = request.page_size.saturating_sub(candidates.len());
        let backfill = if request.backfill && request.after.is_none() && wanted > 0 {
            let pooled: Vec<ItemId> = candidates.iter().map(Candidate::id).collect();
            source
                .backfill(&user, request.as_of, wanted, &pooled)
                .await?
        } else {
            Vec::new()
        };

        Ok(SourceRead {
            user,
            candidates,
            backfill,
        })
    }
}

fn timeout(stage: Stage, budget: Duration) -> AppError {
    AppError::Timeout {
        stage,
        budget_ms: budget.as_millis() as u64,
    }
}

fn within_budget(started: Instant, budget: Duration, stage: Stage) -> AppResult<()> {
    if started.elapsed() > budget {
        return Err(timeout(stage, budget));
    }
    Ok(())
}
