use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};

use super::{Candidate, ItemId};

/// Named numeric signals describing one user/item pair.
///
/// Keys are stable feature names so the extractor and the scorer can
/// evolve independently. Ordered for reproducible serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<String, f64>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A candidate with its features and final score.
///
/// Built once through [`ScoredCandidate::new`], which refuses non-finite
/// scores; fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    candidate: Candidate,
    features: FeatureVector,
    score: f64,
}

impl ScoredCandidate {
    pub fn new(candidate: Candidate, features: FeatureVector, score: f64) -> AppResult<Self> {
        if !score.is_finite() {
            return Err(AppError::InternalInconsistency(format!(
                "non-finite score {} for item {}",
                score,
                candidate.id()
            )));
        }

        Ok(Self {
            candidate,
            features,
            score,
        })
    }

    pub fn id(&self) -> ItemId {
        self.candidate.id()
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn features(&self) -> &FeatureVector {
        &self.features
    }
}

/// One page of ranked candidates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPage {
    pub entries: Vec<ScoredCandidate>,
    /// Opaque token for the next page; `None` once the ranking is exhausted
    pub next_cursor: Option<String>,
}

impl RankedPage {
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.entries.iter().map(ScoredCandidate::id).collect()
    }
}
