use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::FeatureVector;
use crate::services::features::{AFFINITY, POPULARITY, RECENCY, TRENDING};

#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("unknown scorer weights version '{0}'")]
    UnknownVersion(String),

    #[error("weight for '{feature}' must be finite and non-negative, got {value}")]
    InvalidWeight { feature: String, value: f64 },
}

/// Versioned mapping from feature name to weight.
///
/// Weights are non-negative, so the linear score never decreases when a
/// single feature increases.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorerWeights {
    version: String,
    weights: BTreeMap<String, f64>,
}

impl ScorerWeights {
    pub fn new(
        version: impl Into<String>,
        weights: impl IntoIterator<Item = (String, f64)>,
    ) -> Result<Self, WeightsError> {
        let weights: BTreeMap<String, f64> = weights.into_iter().collect();

        if let Some((feature, value)) = weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(WeightsError::InvalidWeight {
                feature: feature.clone(),
                value: *value,
            });
        }

        Ok(Self {
            version: version.into(),
            weights,
        })
    }

    /// Built-in weight sets
    pub fn for_version(version: &str) -> Result<Self, WeightsError> {
        let table: &[(&str, f64)] = match version {
            "v1" => &[
                (RECENCY, 0.35),
                (AFFINITY, 0.35),
                (POPULARITY, 0.20),
                (TRENDING, 0.10),
            ],
            // Engagement only
            "v0" => &[(POPULARITY, 0.7), (TRENDING, 0.3)],
            other => return Err(WeightsError::UnknownVersion(other.to_string())),
        };

        Self::new(
            version,
            table.iter().map(|(name, w)| (name.to_string(), *w)),
        )
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn weight(&self, feature: &str) -> Option<f64> {
        self.weights.get(feature).copied()
    }
}

/// Linear scorer over a fixed weight set
#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScorerWeights,
}

impl Scorer {
    pub fn new(weights: ScorerWeights) -> Self {
        Self { weights }
    }

    pub fn weights_version(&self) -> &str {
        self.weights.version()
    }

    /// Weighted sum of the features the weight set knows about.
    ///
    /// Features without a weight are ignored; weighted features absent from
    /// the vector contribute nothing.
    pub fn score(&self, features: &FeatureVector) -> f64 {
        features
            .iter()
            .filter_map(|(name, value)| self.weights.weight(name).map(|w| w * value))
            .sum()
    }
}
