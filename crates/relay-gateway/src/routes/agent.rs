//! Agent-facing handlers: knowledge checks, escalation, sync, usage.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use relay_core::current_unix_timestamp_ms;
use relay_knowledge::CheckKnowledgeOutcome;
use relay_lifecycle::NewRequest;
use relay_store::KnowledgeListFilter;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct CheckKnowledgeBody {
    question: Option<String>,
}

pub(crate) async fn check_knowledge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckKnowledgeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let question = body
        .question
        .as_deref()
        .map(str::trim)
        .filter(|question| !question.is_empty())
        .ok_or_else(|| ApiError::validation("question is required"))?;

    match state.knowledge.check_question(question).await? {
        CheckKnowledgeOutcome::Found {
            answer,
            confidence,
            kb_entry_id,
            alternatives,
        } => Ok(Json(json!({
            "found": true,
            "answer": answer,
            "confidence": confidence,
            "kbEntryId": kb_entry_id,
            "alternatives": alternatives,
        }))),
        CheckKnowledgeOutcome::Miss => Ok(Json(json!({
            "found": false,
            "message": "No relevant knowledge found",
            "suggestEscalation": true,
        }))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EscalateBody {
    #[serde(default)]
    question: String,
    #[serde(default)]
    customer_phone: String,
    #[serde(default)]
    customer_context: String,
}

pub(crate) async fn escalate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EscalateBody>,
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
        Json(json!({
            "success": true,
            "requestId": request.id,
            "message": "Request escalated to supervisor",
            "estimatedResponseTime": "30 minutes",
        })),
    ))
}

pub(crate) async fn kb_sync(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state.knowledge.list(&KnowledgeListFilter::default())?;
    let knowledge: Vec<_> = entries
        .iter()
        .map(|entry| {
            json!({
                "id": entry.id,
                "question": entry.question,
                "answer": entry.answer,
                "category": entry.category,
            })
        })
        .collect();
    Ok(Json(json!({
        "success": true,
        "count": knowledge.len(),
        "lastUpdated": current_unix_timestamp_ms(),
        "knowledge": knowledge,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackUsageBody {
    kb_entry_id: Option<String>,
}

pub(crate) async fn track_usage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TrackUsageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let kb_entry_id = body
        .kb_entry_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("kbEntryId is required"))?;
    state.knowledge.track_usage(kb_entry_id);
    Ok(Json(json!({ "success": true, "message": "Usage tracked" })))
}
