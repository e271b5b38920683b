use axum::{
    extract::{rejection::PathRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    middleware::request_id::RequestId,
    models::{CandidateReason, ItemId, PipelineDiagnostics, ScoredCandidate, UserId},
    services::RecommendationQuery,
};

use super::AppState;

// Request/Response types

#[derive(Debug, Deserialize)]
pub struct RecommendationParams {
    pub user: i64,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedItem {
    pub id: ItemId,
    pub score: f64,
    pub author_id: Option<UserId>,
    pub created_at: Option<DateTime<Utc>>,
    pub reason: CandidateReason,
}

impl From<&ScoredCandidate> for RecommendedItem {
    fn from(entry: &ScoredCandidate) -> Self {
        let candidate = entry.candidate();
        Self {
            id: entry.id(),
            score: entry.score(),
            author_id: candidate.item.author_id,
            created_at: candidate.item.created_at,
            reason: candidate.reason,
        }
    }
}

/// Full post as returned by the single-user route
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPost {
    pub id: ItemId,
    pub author_id: Option<UserId>,
    pub created_at: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub like_count: Option<i64>,
    pub score: f64,
    pub reason: CandidateReason,
}

impl From<&ScoredCandidate> for RecommendedPost {
    fn from(entry: &ScoredCandidate) -> Self {
        let item = &entry.candidate().item;
        Self {
            id: entry.id(),
            author_id: item.author_id,
            created_at: item.created_at,
            content: item.content.clone(),
            like_count: item.like_count,
            score: entry.score(),
            reason: entry.candidate().reason,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationsResponse {
    pub items: Vec<RecommendedItem>,
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<PipelineDiagnostics>,
}

// Handlers

/// Health check endpoint
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

/// One page of ranked recommendations for a user
pub async fn recommendations(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    params: Result<Query<RecommendationParams>, QueryRejection>,
) -> AppResult<Json<RecommendationsResponse>> {
    let Query(params) = params.map_err(|e| AppError::InvalidRequest(e.body_text()))?;

    tracing::debug!(
        request_id = %request_id,
        user_id = params.user,
        limit = ?params.limit,
        paged = params.cursor.is_some(),
        "Serving recommendations"
    );

    let output = state
        .recommendations
        .recommend(RecommendationQuery {
            user_id: UserId(params.user),
            limit: params.limit,
            cursor: params.cursor,
            backfill: false,
        })
        .await?;

    Ok(Json(RecommendationsResponse {
        items: output.page.entries.iter().map(RecommendedItem::from).collect(),
        next_cursor: output.page.next_cursor,
        diagnostics: params.debug.then_some(output.diagnostics),
    }))
}

/// First page for a user with the default page size, as a bare array of
/// full posts. A short page is refilled with the newest posts.
pub async fn legacy_recommendation(
    State(state): State<AppState>,
    user_id: Result<Path<i64>, PathRejection>,
) -> AppResult<Json<Vec<RecommendedPost>>> {
    let Path(user_id) = user_id.map_err(|e| AppError::InvalidRequest(e.body_text()))?;

    let output = state
        .recommendations
        .recommend(RecommendationQuery {
            user_id: UserId(user_id),
            backfill: true,
            ..RecommendationQuery::default()
        })
        .await?;

    Ok(Json(
        output.page.entries.iter().map(RecommendedPost::from).collect(),
    ))
}
