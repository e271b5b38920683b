use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Display;

use crate::error::{AppError, AppResult};

use super::ItemId;

/// Continuation token handed out by a candidate source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceCursor(String);

impl SourceCursor {
    pub fn from_offset(offset: usize) -> Self {
        Self(URL_SAFE_NO_PAD.encode(format!("o:{}", offset)))
    }

    pub fn offset(&self) -> AppResult<usize> {
        let raw = decode_text(&self.0)?;
        raw.strip_prefix("o:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| AppError::InvalidRequest("malformed source cursor".to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SourceCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of the last emitted entry of a ranked page.
///
/// The cursor pins the weights version it was produced under: scores from
/// a different version are not comparable, so such a cursor is rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct RankCursor {
    pub weights_version: String,
    pub score: f64,
    pub item_id: ItemId,
}

impl RankCursor {
    pub fn new(weights_version: impl Into<String>, score: f64, item_id: ItemId) -> Self {
        Self {
            weights_version: weights_version.into(),
            score,
            item_id,
        }
    }

    /// Encodes the cursor as an opaque URL-safe token
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{:016x}|{}",
            self.weights_version,
            self.score.to_bits(),
            self.item_id.0
        );
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(token: &str) -> AppResult<Self> {
        let raw = decode_text(token)?;
        let malformed = || AppError::InvalidRequest("malformed cursor".to_string());

        let mut parts = raw.rsplitn(3, '|');
        let item_id = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(malformed)?;
        let score_bits = parts
            .next()
            .and_then(|p| u64::from_str_radix(p, 16).ok())
            .ok_or_else(malformed)?;
        let weights_version = parts.next().filter(|v| !v.is_empty()).ok_or_else(malformed)?;

        let score = f64::from_bits(score_bits);
        if !score.is_finite() {
            return Err(malformed());
        }

        Ok(Self::new(weights_version, score, ItemId(item_id)))
    }

    /// Orders an entry relative to this cursor in ranking order
    /// (score descending, item id ascending).
    pub fn cmp_entry(&self, score: f64, item_id: ItemId) -> Ordering {
        score
            .total_cmp(&self.score)
            .reverse()
            .then_with(|| item_id.cmp(&self.item_id))
    }

    /// True when the entry sorts strictly after the cursor position
    pub fn precedes(&self, score: f64, item_id: ItemId) -> bool {
        self.cmp_entry(score, item_id) == Ordering::Greater
    }
}

fn decode_text(token: &str) -> AppResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| AppError::InvalidRequest("cursor is not valid base64".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| AppError::InvalidRequest("cursor is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_cursor_preserves_exact_score() {
        let cursor = RankCursor::new("v1", 0.1 + 0.2, ItemId(42));
        let decoded = RankCursor::decode(&cursor.encode()).unwrap();

        assert_eq!(decoded, cursor);
        assert_eq!(decoded.score.to_bits(), (0.1f64 + 0.2).to_bits());
    }

    #[test]
    fn test_rank_cursor_rejects_garbage() {
        assert!(matches!(
            RankCursor::decode("not base64!"),
            Err(AppError::InvalidRequest(_))
        ));

        let token = URL_SAFE_NO_PAD.encode("v1|zz|7");
        assert!(matches!(
            RankCursor::decode(&token),
            Err(AppError::InvalidRequest(_))
        ));

        let nan = URL_SAFE_NO_PAD.encode(format!("v1|{:016x}|7", f64::NAN.to_bits()));
        assert!(RankCursor::decode(&nan).is_err());
    }

    #[test]
    fn test_precedes_follows_ranking_order() {
        let cursor = RankCursor::new("v1", 0.5, ItemId(10));

        // Lower score comes later
        assert!(cursor.precedes(0.4, ItemId(1)));
        // Same score, higher id comes later
        assert!(cursor.precedes(0.5, ItemId(11)));
        // The cursor entry itself is not after the cursor
        assert!(!cursor.precedes(0.5, ItemId(10)));
        assert!(!cursor.precedes(0.5, ItemId(9)));
        assert!(!cursor.precedes(0.9, ItemId(99)));
    }

    #[test]
    fn test_source_cursor_offset() {
        let cursor = SourceCursor::from_offset(120);
        assert_eq!(cursor.offset().unwrap(), 120);

        let bogus = SourceCursor(URL_SAFE_NO_PAD.encode("x:1"));
        assert!(bogus.offset().is_err());
    }
}
