//! Request lifecycle engine.
//!
//! A help request moves through a bounded lifecycle: it is created pending
//! with a fixed 30-minute deadline and leaves that state exactly once,
//! either resolved by a supervisor or unresolved (manually or by the
//! timeout sweep). The durable store's conditional transition is the
//! serialization point for racing callers; the loser of a race gets a
//! conflict and must not repeat side effects.

use std::sync::Arc;

use thiserror::Error;

use relay_core::{current_unix_timestamp_ms, minutes_to_ms, rounded_minutes_from_ms};
use relay_events::{
    FanoutEvent, FanoutHub, NewHelpRequestPayload, RequestResolvedPayload,
    RequestTimeoutWarningPayload, RequestUnresolvedPayload, WebhookNotifier,
};
use relay_knowledge::{KnowledgeError, KnowledgeService, PromoteKnowledge};
use relay_store::{
    HelpRequest, HelpRequestListQuery, KnowledgeCategory, KnowledgeEntry, KnowledgeSource,
    NewHelpRequest, RequestStats, RequestStatus, SqliteStore, StoreError,
};

mod sweeper;

pub use sweeper::{SweepReport, TimeoutSweeper, TimeoutSweeperConfig};


/// Minutes a request stays pending before it is eligible for auto-timeout.
pub const REQUEST_TIMEOUT_MINUTES: u64 = 30;

/// Warning-pass window bounds, relative to the sweep instant.
pub const WARNING_LEAD_MIN_MINUTES: u64 = 1;
pub const WARNING_LEAD_MAX_MINUTES: u64 = 5;

/// Supervisor notes recorded on an auto-timed-out request.
pub const AUTO_TIMEOUT_NOTES: &str = "Auto-timeout: No response within 30 minutes";

const TIMEOUT_APOLOGY_MESSAGE: &str = "We're sorry, but we weren't able to get an answer to \
    your question in time. Please call us at (555) 123-4567.";

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),
    #[error("help request '{0}' not found")]
    NotFound(String),
    #[error("help request '{id}' already {status}")]
    Conflict { id: String, status: RequestStatus },
    #[error("knowledge promotion failed: {0}")]
    Promotion(#[from] KnowledgeError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::RequestNotFound(id) => Self::NotFound(id),
            StoreError::RequestAlreadyClosed { id, status } => Self::Conflict { id, status },
            other => Self::Store(other),
        }
    }
}

/// Inputs for creating a help request.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub question: String,
    pub customer_phone: String,
    pub customer_context: String,
}

/// Inputs for resolving a help request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub answer: String,
    pub supervisor_notes: Option<String>,
    pub category: Option<KnowledgeCategory>,
}

/// The state machine for help requests.
pub struct RequestService {
    store: Arc<SqliteStore>,
    knowledge: Arc<KnowledgeService>,
    hub: Arc<FanoutHub>,
    notifier: Arc<WebhookNotifier>,
}

impl RequestService {
    pub fn new(
        store: Arc<SqliteStore>,
        knowledge: Arc<KnowledgeService>,
        hub: Arc<FanoutHub>,
        notifier: Arc<WebhookNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            knowledge,
            hub,
            notifier,
        })
    }

    /// Creates a pending request with `timeout_at = now + 30min`, alerts
    /// the supervisor channel, and emits `new_help_request`.
    pub async fn create(&self, new_request: NewRequest) -> LifecycleResult<HelpRequest> {
        let question = new_request.question.trim().to_string();
        if question.is_empty() {
            return Err(LifecycleError::Validation(
                "question is required".to_string(),
            ));
        }
        let customer_phone = new_request.customer_phone.trim().to_string();
        if customer_phone.is_empty() {
            return Err(LifecycleError::Validation(
                "customerPhone is required".to_string(),
            ));
        }

        let now_unix_ms = current_unix_timestamp_ms();
        let request = self.store.insert_help_request(
            NewHelpRequest {
                question,
                customer_phone,
                customer_context: new_request.customer_context,
                timeout_at_unix_ms: now_unix_ms + minutes_to_ms(REQUEST_TIMEOUT_MINUTES),
            },
            now_unix_ms,
        )?;

        self.notifier
            .notify_supervisor(
                &request.id,
                &request.question,
                &request.customer_phone,
                request.created_unix_ms,
            )
            .await;
        self.hub
            .emit_default(&FanoutEvent::NewHelpRequest(NewHelpRequestPayload {
                request_id: request.id.clone(),
                question: request.question.clone(),
                customer_phone: request.customer_phone.clone(),
                timestamp: request.created_unix_ms,
            }));

        tracing::info!(request_id = %request.id, "help request created");
        Ok(request)
    }

    /// Resolves a pending request: wins the transition, promotes the
    /// answer into the knowledge base (durable phase only; the index
    /// phase is queued), notifies the customer, and emits
    /// `request_resolved`. Success never waits on the index phase.
    pub async fn resolve(
        &self,
        id: &str,
        resolution: Resolution,
    ) -> LifecycleResult<(HelpRequest, KnowledgeEntry)> {
        let answer = resolution.answer.trim().to_string();
        if answer.is_empty() {
            return Err(LifecycleError::Validation("answer is required".to_string()));
        }

        let now_unix_ms = current_unix_timestamp_ms();
        let request = self.store.claim_transition(
            id,
            RequestStatus::Resolved,
            Some(&answer),
            resolution.supervisor_notes.as_deref(),
            now_unix_ms,
        )?;

        let entry = self.knowledge.promote(PromoteKnowledge {
            question: request.question.clone(),
            answer: answer.clone(),
            category: resolution.category.unwrap_or_default(),
            tags: Vec::new(),
            source: KnowledgeSource::Learned,
            source_request_id: Some(request.id.clone()),
        })?;

        self.notifier
            .notify_customer(&request.customer_phone, &answer)
            .await;
        self.hub
            .emit_default(&FanoutEvent::RequestResolved(RequestResolvedPayload {
                request_id: request.id.clone(),
                status: request.status.as_str().to_string(),
                kb_created: true,
                kb_entry_id: entry.id.clone(),
            }));

        tracing::info!(request_id = %request.id, kb_entry_id = %entry.id, "help request resolved");
        Ok((request, entry))
    }

    /// Marks a pending request unresolved and emits `request_unresolved`.
    ///
    /// Invoking this on an already-terminal request is a conflict, not a
    /// silent overwrite: the one-way transition invariant wins over the
    /// convenience of idempotent re-invocation.
    pub async fn mark_unresolved(&self, id: &str, reason: &str) -> LifecycleResult<HelpRequest> {
        let now_unix_ms = current_unix_timestamp_ms();
        let request = self.store.claim_transition(
            id,
            RequestStatus::Unresolved,
            None,
            Some(reason),
            now_unix_ms,
        )?;

        self.hub
            .emit_default(&FanoutEvent::RequestUnresolved(RequestUnresolvedPayload {
                request_id: request.id.clone(),
                reason: reason.to_string(),
            }));

        tracing::info!(request_id = %request.id, reason = reason, "help request marked unresolved");
        Ok(request)
    }

    pub fn get(&self, id: &str) -> LifecycleResult<HelpRequest> {
        Ok(self.store.get_help_request(id)?)
    }

    /// Paginated listing; returns the page plus the total match count.
    pub fn list(
        &self,
        query: &HelpRequestListQuery,
    ) -> LifecycleResult<(Vec<HelpRequest>, u64)> {
        Ok(self.store.list_help_requests(query)?)
    }

    /// Hard delete; returns whether a row existed.
    pub fn delete(&self, id: &str) -> LifecycleResult<bool> {
        Ok(self.store.delete_help_request(id)?)
    }

    pub fn stats(&self) -> LifecycleResult<RequestStats> {
        Ok(self.store.request_stats(current_unix_timestamp_ms())?)
    }

    /// Force-transitions every overdue pending request to unresolved and
    /// sends the customer apology. Safe to run concurrently with manual
    /// transitions: a request claimed by a concurrent caller is skipped
    /// without side effects. Returns the number processed.
    pub async fn check_timeouts(&self, now_unix_ms: u64) -> LifecycleResult<usize> {
        let overdue = self.store.list_overdue_pending(now_unix_ms)?;
        let mut processed = 0;
        for request in overdue {
            match self.store.claim_transition(
                &request.id,
                RequestStatus::Unresolved,
                None,
                Some(AUTO_TIMEOUT_NOTES),
                now_unix_ms,
            ) {
                Ok(expired) => {
                    self.hub.emit_default(&FanoutEvent::RequestUnresolved(
                        RequestUnresolvedPayload {
                            request_id: expired.id.clone(),
                            reason: AUTO_TIMEOUT_NOTES.to_string(),
                        },
                    ));
                    self.notifier
                        .notify_customer(&expired.customer_phone, TIMEOUT_APOLOGY_MESSAGE)
                        .await;
                    tracing::info!(request_id = %expired.id, "help request auto-timed out");
                    processed += 1;
                }
                Err(StoreError::RequestAlreadyClosed { id, status }) => {
                    tracing::debug!(
                        request_id = %id,
                        status = %status,
                        "timeout claim lost to a concurrent transition"
                    );
                }
                Err(StoreError::RequestNotFound(id)) => {
                    tracing::debug!(request_id = %id, "request deleted before timeout claim");
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(processed)
    }

    /// Advisory pass: emits `request_timeout_warning` for every pending
    /// request whose deadline falls inside `[now+1min, now+5min]`. Not a
    /// state transition; the same request may warn on consecutive sweeps.
    pub async fn send_timeout_warnings(&self, now_unix_ms: u64) -> LifecycleResult<usize> {
        let window_from = now_unix_ms + minutes_to_ms(WARNING_LEAD_MIN_MINUTES);
        let window_to = now_unix_ms + minutes_to_ms(WARNING_LEAD_MAX_MINUTES);
        let soon = self
            .store
            .list_pending_in_warning_window(window_from, window_to)?;

        for request in &soon {
            let minutes_remaining =
                rounded_minutes_from_ms(request.timeout_at_unix_ms.saturating_sub(now_unix_ms));
            self.hub.emit_default(&FanoutEvent::RequestTimeoutWarning(
                RequestTimeoutWarningPayload {
                    request_id: request.id.clone(),
                    question: request.question.clone(),
                    time_remaining: format!("{minutes_remaining} minutes"),
                },
            ));
            self.notifier
                .notify_timeout_warning(
                    &request.id,
                    &request.question,
                    minutes_remaining,
                    request.timeout_at_unix_ms,
                )
                .await;
        }
        Ok(soon.len())
    }
}
