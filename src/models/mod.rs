use serde::Serialize;
use std::fmt::Display;

pub mod cursor;
pub mod item;
pub mod ranking;
pub mod user;

pub use cursor::{RankCursor, SourceCursor};
pub use item::{Candidate, CandidateReason, Item, ItemId};
pub use ranking::{FeatureVector, RankedPage, ScoredCandidate};
pub use user::{Relationship, User, UserId};

/// Unit of work executed by the pipeline coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Extract,
    Score,
    Rank,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Score => "score",
            Stage::Rank => "rank",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle of a single recommendation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Started,
    CandidatesFetched,
    FeaturesExtracted,
    Scored,
    Ranked,
    Completed,
    Failed,
}

impl PipelineState {
    /// Stage that moves the pipeline out of this state, if any
    pub fn pending_stage(self) -> Option<Stage> {
        match self {
            PipelineState::Started => Some(Stage::Fetch),
            PipelineState::CandidatesFetched => Some(Stage::Extract),
            PipelineState::FeaturesExtracted => Some(Stage::Score),
            PipelineState::Scored => Some(Stage::Rank),
            PipelineState::Ranked | PipelineState::Completed | PipelineState::Failed => None,
        }
    }

    /// Successor on the happy path
    pub fn next(self) -> Option<PipelineState> {
        match self {
            PipelineState::Started => Some(PipelineState::CandidatesFetched),
            PipelineState::CandidatesFetched => Some(PipelineState::FeaturesExtracted),
            PipelineState::FeaturesExtracted => Some(PipelineState::Scored),
            PipelineState::Scored => Some(PipelineState::Ranked),
            PipelineState::Ranked => Some(PipelineState::Completed),
            PipelineState::Completed | PipelineState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLatency {
    pub stage: Stage,
    pub elapsed_us: u64,
}

/// Per-request observability data. Never feeds back into ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDiagnostics {
    pub state: PipelineState,
    pub stage_latencies: Vec<StageLatency>,
    pub source_retries: u32,
    pub pool_size: usize,
    pub dropped_candidates: usize,
    /// Candidates were served from the fallback source
    pub degraded: bool,
    /// Entries appended after the ranked pool ran short
    pub backfilled: usize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            state: PipelineState::Started,
            stage_latencies: Vec::new(),
            source_retries: 0,
            pool_size: 0,
            dropped_candidates: 0,
            degraded: false,
            backfilled: 0,
        }
    }
}
