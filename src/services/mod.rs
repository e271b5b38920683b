pub mod features;
pub mod pipeline;
pub mod ranker;
pub mod recommendations;
pub mod retry;
pub mod scorer;
pub mod source;

pub use features::{FeatureConfig, FeatureExtractor};
pub use pipeline::{
    cancellation, CancellationHandle, CancellationSignal, PageRequest, Pipeline, PipelineConfig,
    PipelineOutput,
};
pub use ranker::Ranker;
pub use recommendations::{RecommendationQuery, RecommendationService};
pub use retry::RetryPolicy;
pub use scorer::{Scorer, ScorerWeights};
pub use source::{CandidateSource, ExclusionPolicy, ExclusionRule};
