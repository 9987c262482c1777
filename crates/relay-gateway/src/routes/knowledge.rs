//! Knowledge-base handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use relay_knowledge::{KnowledgeUpdate, PromoteKnowledge, DEFAULT_SEARCH_LIMIT};
use relay_store::{KnowledgeCategory, KnowledgeListFilter, KnowledgeSource};

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    category: Option<String>,
    source: Option<String>,
    limit: Option<u64>,
}

pub(crate) async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let category = match query.category.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            KnowledgeCategory::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown category '{raw}'")))?,
        ),
    };
    let source = match query.source.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            KnowledgeSource::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown source '{raw}'")))?,
        ),
    };

    let entries = state.knowledge.list(&KnowledgeListFilter {
        category,
        source,
        limit: query.limit,
    })?;
    Ok(Json(json!({
        "success": true,
        "count": entries.len(),
        "data": entries,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchQuery {
    q: Option<String>,
}

pub(crate) async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let q = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::validation("query parameter 'q' is required"))?;
    let results = state.knowledge.search(q, DEFAULT_SEARCH_LIMIT).await?;
    Ok(Json(json!({ "success": true, "results": results })))
}

pub(crate) async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.knowledge.stats()?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateBody {
    #[serde(default)]
    question: String,
    #[serde(default)]
    answer: String,
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

pub(crate) async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .knowledge
        .add_synced(PromoteKnowledge {
            question: body.question,
            answer: body.answer,
            category: KnowledgeCategory::parse_or_default(body.category.as_deref()),
            tags: body.tags,
            source: KnowledgeSource::Initial,
            source_request_id: None,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": entry })),
    ))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateBody {
    question: Option<String>,
    answer: Option<String>,
    category: Option<String>,
    tags: Option<Vec<String>>,
}

pub(crate) async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .knowledge
        .update(
            &id,
            KnowledgeUpdate {
                question: body.question,
                answer: body.answer,
                category: body
                    .category
                    .as_deref()
                    .map(|raw| KnowledgeCategory::parse_or_default(Some(raw))),
                tags: body.tags,
            },
        )
        .await?;
    Ok(Json(json!({ "success": true, "data": entry })))
}

pub(crate) async fn delete_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.knowledge.delete(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Knowledge base entry deactivated",
    })))
}
