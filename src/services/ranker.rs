use std::cmp::Ordering;
use std::collections::HashSet;

use crate::{
    error::{AppError, AppResult},
    models::{RankCursor, RankedPage, ScoredCandidate},
};

/// Orders scored candidates and cuts pages out of the ordering.
///
/// Sort key: score descending, then item id ascending. The tie-break makes
/// the order total, which keeps pagination stable for a stable pool.
#[derive(Debug, Clone)]
pub struct Ranker {
    weights_version: String,
}

impl Ranker {
    pub fn new(weights_version: impl Into<String>) -> Self {
        Self {
            weights_version: weights_version.into(),
        }
    }

    /// Ranks `scored` and returns the page that follows `after`
    pub fn rank(
        &self,
        scored: Vec<ScoredCandidate>,
        page_size: usize,
        after: Option<&RankCursor>,
    ) -> AppResult<RankedPage> {
        if page_size == 0 {
            return Err(AppError::InvalidRequest(
                "page size must be positive".to_string(),
            ));
        }
        if let Some(cursor) = after {
            if cursor.weights_version != self.weights_version {
                return Err(AppError::InvalidRequest(format!(
                    "cursor was issued for weights {} but ranking uses {}",
                    cursor.weights_version, self.weights_version
                )));
            }
        }

        let ordered = order(scored);

        let start = after.map_or(0, |cursor| {
            ordered.partition_point(|entry| !cursor.precedes(entry.score(), entry.id()))
        });
        let end = (start + page_size).min(ordered.len());
        let has_more = end < ordered.len();

        let entries: Vec<ScoredCandidate> = ordered
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect();

        let next_cursor = match entries.last() {
            Some(last) if has_more => Some(
                RankCursor::new(self.weights_version.clone(), last.score(), last.id()).encode(),
            ),
            _ => None,
        };

        Ok(RankedPage {
            entries,
            next_cursor,
        })
    }
}

fn ranking_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| a.id().cmp(&b.id()))
}

/// Sorts into ranking order and keeps the first entry per item id
fn order(mut scored: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
    scored.sort_by(ranking_order);
    let mut emitted = HashSet::new();
    scored.retain(|entry| emitted.insert(entry.id()));
    scored
}
