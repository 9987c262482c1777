//! Outbound webhook notifications.
//!
//! A separate, independent sink from the fanout hub: one configurable
//! endpoint, bounded timeout, failures logged and never retried, never
//! surfaced to the triggering operation's caller.

use std::time::Duration;

use serde_json::{json, Value};

use relay_core::current_unix_timestamp_ms;

const WEBHOOK_TIMEOUT_MS: u64 = 5_000;

/// Fire-and-forget webhook dispatcher.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    endpoint: Option<String>,
}

impl WebhookNotifier {
    /// `endpoint = None` disables dispatch entirely; notification log
    /// lines are still written.
    pub fn new(endpoint: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(WEBHOOK_TIMEOUT_MS))
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    /// Posts `{event, timestamp, data}` to the configured endpoint.
    /// Failure is logged and swallowed.
    pub async fn send(&self, event_type: &str, data: Value) {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return;
        };
        let body = json!({
            "event": event_type,
            "timestamp": current_unix_timestamp_ms(),
            "data": data,
        });
        match self.http.post(endpoint).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(event = event_type, "webhook sent");
            }
            Ok(response) => {
                tracing::warn!(
                    event = event_type,
                    status = response.status().as_u16(),
                    "webhook rejected"
                );
            }
            Err(error) => {
                tracing::warn!(event = event_type, %error, "webhook dispatch failed");
            }
        }
    }

    /// Alerts the supervisor channel about a newly escalated request.
    pub async fn notify_supervisor(
        &self,
        request_id: &str,
        question: &str,
        customer_phone: &str,
        created_unix_ms: u64,
    ) {
        tracing::info!(
            request_id = request_id,
            question = question,
            customer_phone = customer_phone,
            "supervisor notification"
        );
        self.send(
            "supervisor_notification",
            json!({
                "requestId": request_id,
                "question": question,
                "customerPhone": customer_phone,
                "createdAt": created_unix_ms,
            }),
        )
        .await;
    }

    /// Delivers a message to the customer (answer or apology).
    pub async fn notify_customer(&self, customer_phone: &str, message: &str) {
        tracing::info!(
            customer_phone = customer_phone,
            message = message,
            "customer notification"
        );
        self.send(
            "customer_notification",
            json!({
                "phone": customer_phone,
                "message": message,
            }),
        )
        .await;
    }

    /// Advisory warning that a pending request is close to its deadline.
    pub async fn notify_timeout_warning(
        &self,
        request_id: &str,
        question: &str,
        minutes_remaining: u64,
        timeout_at_unix_ms: u64,
    ) {
        tracing::info!(
            request_id = request_id,
            minutes_remaining = minutes_remaining,
            "timeout warning"
        );
        self.send(
            "timeout_warning",
            json!({
                "requestId": request_id,
                "question": question,
                "minutesRemaining": minutes_remaining,
                "timeoutAt": timeout_at_unix_ms,
            }),
        )
        .await;
    }
}
