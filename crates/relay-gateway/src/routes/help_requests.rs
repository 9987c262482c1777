//! Help-request CRUD and transition handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use relay_lifecycle::{NewRequest, Resolution};
use relay_store::{
    HelpRequestListQuery, KnowledgeCategory, RequestSortField, RequestStatus, SortDirection,
};

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateBody {
    #[serde(default)]
    question: String,
    #[serde(default)]
    customer_phone: String,
    #[serde(default)]
    customer_context: String,
}

pub(crate) async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state
        .requests
        .create(NewRequest {
            question: body.question,
            customer_phone: body.customer_phone,
            customer_context: body.customer_context,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": request })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListQuery {
    status: Option<String>,
    page: Option<u64>,
    limit: Option<u64>,
    sort_by: Option<String>,
    sort_order: Option<String>,
}

pub(crate) async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            RequestStatus::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown status '{raw}'")))?,
        ),
    };
    let page_size = query.limit.unwrap_or(20).max(1);
    let page = query.page.unwrap_or(1).max(1);

    let (items, total) = state.requests.list(&HelpRequestListQuery {
        status,
        page,
        page_size,
        sort_field: RequestSortField::parse_or_default(query.sort_by.as_deref()),
        sort_direction: SortDirection::parse_or_default(query.sort_order.as_deref()),
    })?;

    Ok(Json(json!({
        "success": true,
        "data": items,
        "pagination": {
            "total": total,
            "page": page,
            "pages": total.div_ceil(page_size),
        },
    })))
}

pub(crate) async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state.requests.get(&id)?;
    Ok(Json(json!({ "success": true, "data": request })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResolveBody {
    #[serde(default)]
    answer: String,
    supervisor_notes: Option<String>,
    category: Option<String>,
}

pub(crate) async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let category = body
        .category
        .as_deref()
        .map(|raw| KnowledgeCategory::parse_or_default(Some(raw)));
    let (request, entry) = state
        .requests
        .resolve(
            &id,
            Resolution {
                answer: body.answer,
                supervisor_notes: body.supervisor_notes,
                category,
            },
        )
        .await?;
    Ok(Json(json!({
        "success": true,
        "data": request,
        "kbEntry": entry,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UnresolvedBody {
    reason: Option<String>,
}

pub(crate) async fn mark_unresolved(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UnresolvedBody>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .unwrap_or("Marked as unresolved");
    let request = state.requests.mark_unresolved(&id, reason).await?;
    Ok(Json(json!({ "success": true, "data": request })))
}

pub(crate) async fn delete_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.requests.delete(&id)?;
    Ok(Json(json!({
        "success": true,
        "message": "Help request deleted successfully",
    })))
}
