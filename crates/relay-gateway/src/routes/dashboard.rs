//! Read-only dashboard statistics and analytics.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;

use relay_core::current_unix_timestamp_ms;
use relay_store::RequestStatus;

use crate::{ApiError, AppState};

const ANALYTICS_DEFAULT_WINDOW_MS: u64 = 7 * 24 * 60 * 60 * 1_000;
// Escalation rate is a fixed dashboard constant until real funnel data
// exists upstream of this service.
const ESCALATION_RATE: f64 = 0.15;
const TOP_QUESTIONS_LIMIT: usize = 10;

pub(crate) async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let now_unix_ms = current_unix_timestamp_ms();
    let request_stats = state
        .store
        .request_stats(now_unix_ms)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    let knowledge_stats = state
        .knowledge
        .stats()?;
    let durations = state
        .store
        .resolution_durations_ms()
        .map_err(|error| ApiError::internal(error.to_string()))?;

    let most_used = knowledge_stats.most_used.first();
    Ok(Json(json!({
        "success": true,
        "stats": {
            "helpRequests": request_stats,
            "knowledgeBase": {
                "total": knowledge_stats.total_entries,
                "learned": knowledge_stats.by_source.get("learned").copied().unwrap_or(0),
                "mostUsed": most_used.map(|row| row.question.as_str()).unwrap_or("N/A"),
                "mostUsedCount": most_used.map(|row| row.usage_count).unwrap_or(0),
            },
            "responseTime": resolution_time_summary(&durations),
        },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AnalyticsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

pub(crate) async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let now_unix_ms = current_unix_timestamp_ms();
    let end_unix_ms = match query.end_date.as_deref() {
        Some(raw) => parse_date_param("endDate", raw)?,
        None => now_unix_ms,
    };
    let start_unix_ms = match query.start_date.as_deref() {
        Some(raw) => parse_date_param("startDate", raw)?,
        None => end_unix_ms.saturating_sub(ANALYTICS_DEFAULT_WINDOW_MS),
    };
    if start_unix_ms > end_unix_ms {
        return Err(ApiError::validation("startDate must precede endDate"));
    }

    let requests = state
        .store
        .list_requests_created_between(start_unix_ms, end_unix_ms)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    let total = requests.len();
    let resolved = requests
        .iter()
        .filter(|request| request.status == RequestStatus::Resolved)
        .count();
    let resolution_rate = if total > 0 {
        resolved as f64 / total as f64
    } else {
        0.0
    };

    let mut question_counts: HashMap<&str, usize> = HashMap::new();
    for request in &requests {
        *question_counts.entry(request.question.as_str()).or_default() += 1;
    }
    let mut top_questions: Vec<_> = question_counts.into_iter().collect();
    top_questions.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(right.0)));
    let top_questions: Vec<_> = top_questions
        .into_iter()
        .take(TOP_QUESTIONS_LIMIT)
        .map(|(question, count)| json!({ "question": question, "count": count }))
        .collect();

    let escalations_by_category = state
        .store
        .escalation_category_counts(start_unix_ms, end_unix_ms)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    let durations = state
        .store
        .resolution_durations_ms()
        .map_err(|error| ApiError::internal(error.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "analytics": {
            "escalationRate": ESCALATION_RATE,
            "resolutionRate": resolution_rate,
            "averageResolutionTime": resolution_time_summary(&durations)["average"],
            "topQuestions": top_questions,
            "escalationsByCategory": escalations_by_category,
            "totalRequests": total,
            "resolvedRequests": resolved,
        },
    })))
}

fn parse_date_param(name: &str, raw: &str) -> Result<u64, ApiError> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| ApiError::validation(format!("invalid {name} '{raw}'")))?;
    u64::try_from(parsed.timestamp_millis())
        .map_err(|_| ApiError::validation(format!("{name} predates the epoch")))
}

/// Renders average/median resolution time the way the dashboard expects:
/// whole minutes, "N/A" when nothing has resolved yet.
fn resolution_time_summary(durations_ms: &[u64]) -> serde_json::Value {
    if durations_ms.is_empty() {
        return json!({ "average": "N/A", "median": "N/A" });
    }

    let mut minutes: Vec<f64> = durations_ms
        .iter()
        .map(|duration| *duration as f64 / 60_000.0)
        .collect();
    minutes.sort_by(|left, right| left.partial_cmp(right).unwrap_or(std::cmp::Ordering::Equal));

    let average = minutes.iter().sum::<f64>() / minutes.len() as f64;
    let median = if minutes.len() % 2 == 0 {
        (minutes[minutes.len() / 2 - 1] + minutes[minutes.len() / 2]) / 2.0
    } else {
        minutes[minutes.len() / 2]
    };

    json!({
        "average": format!("{} minutes", average.round() as u64),
        "median": format!("{} minutes", median.round() as u64),
    })
}
