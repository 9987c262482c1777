//! Knowledge promotion pipeline.
//!
//! Promotion is a two-phase write: a synchronous durable insert that the
//! caller waits on, and a best-effort semantic-index write handled by a
//! bounded background worker so external-service latency never sits on the
//! resolution path. The durable store stays the source of truth; the index
//! is derived and rebuildable.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use relay_core::current_unix_timestamp_ms;
use relay_events::{FanoutEvent, FanoutHub, KbAction, KbUpdatedPayload};
use relay_memory::{
    compose_memory_content, MemoryGateway, MemorySearchHit, MemoryWriteMetadata,
};
use relay_store::{
    KnowledgeCategory, KnowledgeEntry, KnowledgeEntryUpdate, KnowledgeListFilter, KnowledgeSource,
    KnowledgeStats, MemoryRef, NewKnowledgeEntry, SqliteStore, StoreError,
};

#[cfg(test)]
mod tests;

pub const DEFAULT_SEARCH_LIMIT: usize = 5;

/// Result type for knowledge operations.
pub type KnowledgeResult<T> = Result<T, KnowledgeError>;

/// Errors surfaced by the promotion pipeline.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("{0}")]
    Validation(String),
    #[error("knowledge entry '{0}' not found")]
    NotFound(String),
    #[error("semantic memory gateway failure: {0}")]
    External(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for KnowledgeError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::EntryNotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Inputs for promoting a question/answer pair into the knowledge base.
#[derive(Debug, Clone)]
pub struct PromoteKnowledge {
    pub question: String,
    pub answer: String,
    pub category: KnowledgeCategory,
    pub tags: Vec<String>,
    pub source: KnowledgeSource,
    pub source_request_id: Option<String>,
}

/// Partial update accepted by the update operation.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeUpdate {
    pub question: Option<String>,
    pub answer: Option<String>,
    pub category: Option<KnowledgeCategory>,
    pub tags: Option<Vec<String>>,
}

/// One ranked match returned by the search façade. Ordering is the
/// gateway's ranking, highest relevance first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeMatch {
    pub memory_id: String,
    pub question: String,
    pub answer: String,
    pub category: KnowledgeCategory,
    pub source: KnowledgeSource,
    pub relevance_score: f64,
}

/// A lower-confidence alternative surfaced next to the best match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeAlternative {
    pub answer: String,
    pub confidence: f64,
}

/// Outcome of the agent-facing knowledge check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckKnowledgeOutcome {
    Found {
        answer: String,
        confidence: f64,
        kb_entry_id: String,
        alternatives: Vec<KnowledgeAlternative>,
    },
    Miss,
}

/// Tuning for the background index worker.
#[derive(Debug, Clone)]
pub struct KnowledgeServiceConfig {
    pub index_queue_capacity: usize,
    pub index_retry_max_attempts: usize,
    pub index_retry_base_delay_ms: u64,
}

impl Default for KnowledgeServiceConfig {
    fn default() -> Self {
        Self {
            index_queue_capacity: 64,
            index_retry_max_attempts: 3,
            index_retry_base_delay_ms: 500,
        }
    }
}

#[derive(Debug)]
struct IndexJob {
    entry_id: String,
    question: String,
    answer: String,
    metadata: MemoryWriteMetadata,
}

/// Orchestrates durable and index writes for knowledge entries.
pub struct KnowledgeService {
    store: Arc<SqliteStore>,
    gateway: Arc<dyn MemoryGateway>,
    hub: Arc<FanoutHub>,
    index_tx: mpsc::Sender<IndexJob>,
}

impl KnowledgeService {
    /// Builds the service plus the worker that drains the index queue.
    /// The worker must be spawned by the caller.
    pub fn new(
        store: Arc<SqliteStore>,
        gateway: Arc<dyn MemoryGateway>,
        hub: Arc<FanoutHub>,
        config: KnowledgeServiceConfig,
    ) -> (Arc<Self>, IndexWorker) {
        let (index_tx, index_rx) = mpsc::channel(config.index_queue_capacity.max(1));
        let service = Arc::new(Self {
            store: Arc::clone(&store),
            gateway: Arc::clone(&gateway),
            hub,
            index_tx,
        });
        let worker = IndexWorker {
            rx: index_rx,
            store,
            gateway,
            retry_max_attempts: config.index_retry_max_attempts.max(1),
            retry_base_delay_ms: config.index_retry_base_delay_ms,
        };
        (service, worker)
    }

    /// Durable phase of promotion: inserts the entry with a pending memory
    /// reference, emits `kb_updated`, and queues the index phase. Returns
    /// as soon as the durable write lands.
    pub fn promote(&self, promote: PromoteKnowledge) -> KnowledgeResult<KnowledgeEntry> {
        let now_unix_ms = current_unix_timestamp_ms();
        let entry = self.store.insert_knowledge_entry(
            NewKnowledgeEntry {
                question: promote.question.clone(),
                answer: promote.answer.clone(),
                category: promote.category,
                tags: promote.tags.clone(),
                source: promote.source,
                source_request_id: promote.source_request_id,
                memory_ref: MemoryRef::Pending,
            },
            now_unix_ms,
        )?;

        self.hub.emit_default(&FanoutEvent::KbUpdated(KbUpdatedPayload {
            action: KbAction::Added,
            kb_entry_id: entry.id.clone(),
            question: Some(entry.question.clone()),
        }));

        let job = IndexJob {
            entry_id: entry.id.clone(),
            question: promote.question,
            answer: promote.answer,
            metadata: MemoryWriteMetadata {
                question: entry.question.clone(),
                category: promote.category.as_str().to_string(),
                source: promote.source.as_str().to_string(),
                tags: promote.tags,
            },
        };
        match self.index_tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    entry_id = %job.entry_id,
                    "index queue full; entry left with pending memory reference"
                );
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(
                    entry_id = %job.entry_id,
                    "index worker stopped; entry left with pending memory reference"
                );
            }
        }

        Ok(entry)
    }

    /// Synchronous add: index write first, durable insert second, both on
    /// the caller's path. Used by the manual-authoring API.
    pub async fn add_synced(&self, promote: PromoteKnowledge) -> KnowledgeResult<KnowledgeEntry> {
        if promote.question.trim().is_empty() || promote.answer.trim().is_empty() {
            return Err(KnowledgeError::Validation(
                "question and answer are required".to_string(),
            ));
        }

        let metadata = MemoryWriteMetadata {
            question: promote.question.clone(),
            category: promote.category.as_str().to_string(),
            source: promote.source.as_str().to_string(),
            tags: promote.tags.clone(),
        };
        let memory_id = self
            .gateway
            .add(&promote.question, &promote.answer, &metadata)
            .await
            .map_err(|error| KnowledgeError::External(error.to_string()))?;

        let now_unix_ms = current_unix_timestamp_ms();
        let entry = self.store.insert_knowledge_entry(
            NewKnowledgeEntry {
                question: promote.question,
                answer: promote.answer,
                category: promote.category,
                tags: promote.tags,
                source: promote.source,
                source_request_id: promote.source_request_id,
                memory_ref: MemoryRef::Resolved { memory_id },
            },
            now_unix_ms,
        )?;

        self.hub.emit_default(&FanoutEvent::KbUpdated(KbUpdatedPayload {
            action: KbAction::Added,
            kb_entry_id: entry.id.clone(),
            question: Some(entry.question.clone()),
        }));
        Ok(entry)
    }

    /// Applies a partial update. An answer change on an indexed entry
    /// updates the gateway first and propagates its failure: the two
    /// backends must not drift apart silently on this path.
    pub async fn update(
        &self,
        id: &str,
        update: KnowledgeUpdate,
    ) -> KnowledgeResult<KnowledgeEntry> {
        let existing = self.store.get_knowledge_entry(id)?;

        if let Some(answer) = update.answer.as_deref() {
            if let Some(memory_id) = existing.memory_ref.memory_id() {
                let question = update.question.as_deref().unwrap_or(&existing.question);
                let content = compose_memory_content(question, answer);
                let metadata = MemoryWriteMetadata {
                    question: question.to_string(),
                    category: update
                        .category
                        .unwrap_or(existing.category)
                        .as_str()
                        .to_string(),
                    source: existing.source.as_str().to_string(),
                    tags: update.tags.clone().unwrap_or_else(|| existing.tags.clone()),
                };
                self.gateway
                    .update(memory_id, &content, &metadata)
                    .await
                    .map_err(|error| KnowledgeError::External(error.to_string()))?;
            }
        }

        let now_unix_ms = current_unix_timestamp_ms();
        let entry = self.store.update_knowledge_entry(
            id,
            &KnowledgeEntryUpdate {
                question: update.question,
                answer: update.answer,
                category: update.category,
                tags: update.tags,
            },
            now_unix_ms,
        )?;

        self.hub.emit_default(&FanoutEvent::KbUpdated(KbUpdatedPayload {
            action: KbAction::Updated,
            kb_entry_id: entry.id.clone(),
            question: None,
        }));
        Ok(entry)
    }

    /// Soft delete. The durable flag is authoritative; the index delete is
    /// best-effort and may trail behind.
    pub async fn delete(&self, id: &str) -> KnowledgeResult<()> {
        let now_unix_ms = current_unix_timestamp_ms();
        let entry = self.store.deactivate_knowledge_entry(id, now_unix_ms)?;

        if let Some(memory_id) = entry.memory_ref.memory_id() {
            if let Err(error) = self.gateway.delete(memory_id).await {
                tracing::warn!(
                    entry_id = %entry.id,
                    memory_id = %memory_id,
                    %error,
                    "index delete failed; durable entry already deactivated"
                );
            }
        }

        self.hub.emit_default(&FanoutEvent::KbUpdated(KbUpdatedPayload {
            action: KbAction::Deleted,
            kb_entry_id: entry.id,
            question: None,
        }));
        Ok(())
    }

    /// Thin façade over gateway search; ordering is preserved as returned.
    /// Hits whose durable entry was soft-deleted are dropped here, since
    /// the index delete is best-effort and may trail behind.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> KnowledgeResult<Vec<KnowledgeMatch>> {
        let hits = self
            .gateway
            .search(query, limit)
            .await
            .map_err(|error| KnowledgeError::External(error.to_string()))?;
        let mut matches = Vec::with_capacity(hits.len());
        for hit in hits {
            if self.store.memory_id_is_deactivated(&hit.memory_id)? {
                tracing::debug!(memory_id = %hit.memory_id, "stale index hit filtered");
                continue;
            }
            matches.push(knowledge_match_from_hit(hit));
        }
        Ok(matches)
    }

    /// Agent-facing check: search, cross-reference the best hit back to a
    /// durable entry for usage tracking, and shape the outcome. A failed
    /// cross-reference skips tracking rather than failing the caller.
    pub async fn check_question(&self, question: &str) -> KnowledgeResult<CheckKnowledgeOutcome> {
        let matches = self.search(question, DEFAULT_SEARCH_LIMIT).await?;
        let Some(best) = matches.first() else {
            return Ok(CheckKnowledgeOutcome::Miss);
        };

        let kb_entry_id = match self.store.find_by_memory_id(&best.memory_id) {
            Ok(Some(entry)) => {
                self.track_usage(&entry.id);
                entry.id
            }
            Ok(None) => best.memory_id.clone(),
            Err(error) => {
                tracing::warn!(%error, "memory-id cross-reference failed; skipping usage tracking");
                best.memory_id.clone()
            }
        };

        let alternatives = matches
            .iter()
            .skip(1)
            .take(2)
            .map(|candidate| KnowledgeAlternative {
                answer: candidate.answer.clone(),
                confidence: candidate.relevance_score,
            })
            .collect();

        Ok(CheckKnowledgeOutcome::Found {
            answer: best.answer.clone(),
            confidence: best.relevance_score,
            kb_entry_id,
            alternatives,
        })
    }

    /// Best-effort usage increment; never fails the caller.
    pub fn track_usage(&self, id: &str) {
        match self.store.increment_usage(id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(entry_id = id, "usage tracking skipped for unknown entry");
            }
            Err(error) => {
                tracing::warn!(entry_id = id, %error, "usage tracking failed");
            }
        }
    }

    /// Active entries matching the filter, newest first.
    pub fn list(&self, filter: &KnowledgeListFilter) -> KnowledgeResult<Vec<KnowledgeEntry>> {
        Ok(self.store.list_knowledge(filter)?)
    }

    pub fn get(&self, id: &str) -> KnowledgeResult<KnowledgeEntry> {
        Ok(self.store.get_knowledge_entry(id)?)
    }

    pub fn stats(&self) -> KnowledgeResult<KnowledgeStats> {
        Ok(self.store.knowledge_stats()?)
    }

    /// Seeds the initial knowledge base, skipping questions that already
    /// have an active initial entry. Index writes ride the normal queue.
    pub fn seed_initial(&self) -> KnowledgeResult<usize> {
        let mut seeded = 0;
        for seed in initial_knowledge_seed() {
            if self.store.find_initial_by_question(seed.question)?.is_some() {
                continue;
            }
            self.promote(PromoteKnowledge {
                question: seed.question.to_string(),
                answer: seed.answer.to_string(),
                category: seed.category,
                tags: seed.tags.iter().map(|tag| tag.to_string()).collect(),
                source: KnowledgeSource::Initial,
                source_request_id: None,
            })?;
            seeded += 1;
        }
        if seeded > 0 {
            tracing::info!(seeded = seeded, "initial knowledge base seeded");
        }
        Ok(seeded)
    }
}

struct KnowledgeSeed {
    question: &'static str,
    answer: &'static str,
    category: KnowledgeCategory,
    tags: &'static [&'static str],
}

fn initial_knowledge_seed() -> &'static [KnowledgeSeed] {
    &[
        KnowledgeSeed {
            question: "What are your business hours?",
            answer: "We're open Monday through Saturday from 9 AM to 7 PM. We're closed on Sundays.",
            category: KnowledgeCategory::Hours,
            tags: &["hours", "schedule", "open"],
        },
        KnowledgeSeed {
            question: "What services do you offer?",
            answer: "We offer haircuts ($50), hair coloring ($120), manicures ($35), and pedicures ($45).",
            category: KnowledgeCategory::Services,
            tags: &["services", "menu", "offerings"],
        },
        KnowledgeSeed {
            question: "Where are you located?",
            answer: "We're located at 123 Beauty Lane, San Francisco, CA. Our phone number is (555) 123-4567.",
            category: KnowledgeCategory::Location,
            tags: &["location", "address", "directions"],
        },
        KnowledgeSeed {
            question: "How much does a haircut cost?",
            answer: "A haircut costs $50.",
            category: KnowledgeCategory::Pricing,
            tags: &["pricing", "haircut", "cost"],
        },
        KnowledgeSeed {
            question: "Do you accept walk-ins?",
            answer: "Yes, we accept walk-ins, but appointments are recommended to avoid wait times.",
            category: KnowledgeCategory::Booking,
            tags: &["booking", "walk-in", "appointment"],
        },
    ]
}

fn knowledge_match_from_hit(hit: MemorySearchHit) -> KnowledgeMatch {
    let answer = answer_from_content(&hit.content);
    KnowledgeMatch {
        question: hit
            .metadata
            .question
            .clone()
            .unwrap_or_else(|| "N/A".to_string()),
        answer,
        category: KnowledgeCategory::parse_or_default(hit.metadata.category.as_deref()),
        source: hit
            .metadata
            .source
            .as_deref()
            .and_then(KnowledgeSource::parse)
            .unwrap_or(KnowledgeSource::Learned),
        relevance_score: hit.score,
        memory_id: hit.memory_id,
    }
}

/// Extracts the answer half of composed "Question: .. / Answer: .." content;
/// falls back to the raw content for memories stored in another shape.
fn answer_from_content(content: &str) -> String {
    match content.split_once("\nAnswer: ") {
        Some((prefix, answer)) if prefix.starts_with("Question: ") => answer.to_string(),
        _ => content.to_string(),
    }
}

/// Drains the index queue: one gateway write per job with bounded retries,
/// then records the outcome on the durable entry.
pub struct IndexWorker {
    rx: mpsc::Receiver<IndexJob>,
    store: Arc<SqliteStore>,
    gateway: Arc<dyn MemoryGateway>,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl IndexWorker {
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            self.process(job).await;
        }
        tracing::debug!("index queue closed; worker stopping");
    }

    async fn process(&self, job: IndexJob) {
        let mut last_error = None;
        for attempt in 1..=self.retry_max_attempts {
            match self
                .gateway
                .add(&job.question, &job.answer, &job.metadata)
                .await
            {
                Ok(memory_id) => {
                    let memory_ref = MemoryRef::Resolved { memory_id };
                    if let Err(error) =
                        self.store
                            .set_memory_ref(&job.entry_id, &memory_ref, current_unix_timestamp_ms())
                    {
                        tracing::warn!(entry_id = %job.entry_id, %error, "failed to record index outcome");
                    } else {
                        tracing::info!(
                            entry_id = %job.entry_id,
                            attempt = attempt,
                            "knowledge entry indexed"
                        );
                    }
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        entry_id = %job.entry_id,
                        attempt = attempt,
                        %error,
                        "index write attempt failed"
                    );
                    last_error = Some(error);
                    if attempt < self.retry_max_attempts {
                        let exponent = (attempt - 1).min(6) as u32;
                        tokio::time::sleep(Duration::from_millis(
                            self.retry_base_delay_ms.saturating_mul(1u64 << exponent),
                        ))
                        .await;
                    }
                }
            }
        }

        tracing::warn!(
            entry_id = %job.entry_id,
            error = %last_error.map(|error| error.to_string()).unwrap_or_default(),
            "index write permanently failed; entry marked failed"
        );
        if let Err(error) =
            self.store
                .set_memory_ref(&job.entry_id, &MemoryRef::Failed, current_unix_timestamp_ms())
        {
            tracing::warn!(entry_id = %job.entry_id, %error, "failed to record index failure");
        }
    }
}
