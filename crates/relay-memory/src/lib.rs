//! Semantic memory gateway adapter.
//!
//! Wraps an external mem0-style memory service behind the `MemoryGateway`
//! trait. The service owns no canonical state; it is a derived, rebuildable
//! index over knowledge content, so every call here is fallible and bounded.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use relay_core::current_unix_timestamp_ms;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;

/// Metadata attached to an indexed memory on write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryWriteMetadata {
    pub question: String,
    pub category: String,
    pub source: String,
    pub tags: Vec<String>,
}

/// Metadata echoed back on search hits; every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemoryHitMetadata {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One ranked search result from the gateway, highest relevance first.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySearchHit {
    pub memory_id: String,
    pub content: String,
    pub score: f64,
    pub metadata: MemoryHitMetadata,
}

/// Contract for the external semantic memory service.
#[async_trait]
pub trait MemoryGateway: Send + Sync {
    /// Indexes a question/answer pair; returns the gateway-native id.
    async fn add(
        &self,
        question: &str,
        answer: &str,
        metadata: &MemoryWriteMetadata,
    ) -> Result<String>;

    /// Meaning-based search; returned order is the gateway's ranking.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemorySearchHit>>;

    /// Replaces the content of an existing memory.
    async fn update(
        &self,
        memory_id: &str,
        content: &str,
        metadata: &MemoryWriteMetadata,
    ) -> Result<()>;

    /// Removes a memory from the index.
    async fn delete(&self, memory_id: &str) -> Result<()>;
}

/// Composes the canonical indexed content for a question/answer pair.
pub fn compose_memory_content(question: &str, answer: &str) -> String {
    format!("Question: {question}\nAnswer: {answer}")
}

#[derive(Debug, Clone, Deserialize)]
struct MemoryAddResponse {
    #[serde(default)]
    results: Vec<MemoryAddResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct MemoryAddResult {
    id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MemorySearchResponse {
    #[serde(default)]
    results: Vec<MemorySearchResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct MemorySearchResult {
    id: String,
    #[serde(default)]
    memory: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    metadata: Option<MemoryHitMetadata>,
}

/// Configuration for the HTTP gateway client.
#[derive(Debug, Clone)]
pub struct HttpMemoryGatewayConfig {
    pub api_base: String,
    pub api_key: String,
    /// Namespace all memories are stored under.
    pub agent_id: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl HttpMemoryGatewayConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            agent_id: "salon-receptionist".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

/// HTTP client for a mem0-style memory API.
#[derive(Clone)]
pub struct HttpMemoryGateway {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    agent_id: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl HttpMemoryGateway {
    pub fn new(config: HttpMemoryGatewayConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to build memory gateway http client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            agent_id: config.agent_id,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms,
        })
    }

    async fn send_with_retry<F>(&self, label: &str, mut build: F) -> Result<reqwest::Response>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = build()
                .header("Authorization", format!("Token {}", self.api_key))
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if attempt < self.retry_max_attempts && is_retryable_status(status.as_u16()) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt)).await;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    bail!(
                        "memory gateway {label} failed: status={} body={}",
                        status,
                        truncate_for_error(&body)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts
                        && (error.is_timeout() || error.is_connect() || error.is_request())
                    {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt)).await;
                        continue;
                    }
                    return Err(
                        anyhow!(error).context(format!("memory gateway {label} transport failed"))
                    );
                }
            }
        }
    }
}

#[async_trait]
impl MemoryGateway for HttpMemoryGateway {
    async fn add(
        &self,
        question: &str,
        answer: &str,
        metadata: &MemoryWriteMetadata,
    ) -> Result<String> {
        let content = compose_memory_content(question, answer);
        let body = json!({
            "messages": [{ "role": "user", "content": content }],
            "user_id": self.agent_id,
            "metadata": {
                "type": "knowledge",
                "question": metadata.question,
                "category": metadata.category,
                "source": metadata.source,
                "tags": metadata.tags,
            },
        });
        let response = self
            .send_with_retry("add", || {
                self.http
                    .post(format!("{}/v1/memories/", self.api_base))
                    .json(&body)
            })
            .await?;
        let parsed: MemoryAddResponse = response
            .json()
            .await
            .context("failed to decode memory add response")?;
        let memory_id = parsed
            .results
            .into_iter()
            .find_map(|result| result.id)
            .unwrap_or_else(|| format!("mem-{}", current_unix_timestamp_ms()));
        tracing::debug!(memory_id = %memory_id, "memory gateway add succeeded");
        Ok(memory_id)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemorySearchHit>> {
        let body = json!({
            "query": query,
            "user_id": self.agent_id,
            "limit": limit,
        });
        let response = self
            .send_with_retry("search", || {
                self.http
                    .post(format!("{}/v1/memories/search/", self.api_base))
                    .json(&body)
            })
            .await?;
        let parsed: MemorySearchResponse = response
            .json()
            .await
            .context("failed to decode memory search response")?;
        let hits = parsed
            .results
            .into_iter()
            .map(|result| MemorySearchHit {
                content: result
                    .memory
                    .or(result.content)
                    .unwrap_or_default(),
                score: result.score.unwrap_or(0.8),
                metadata: result.metadata.unwrap_or_default(),
                memory_id: result.id,
            })
            .collect();
        Ok(hits)
    }

    async fn update(
        &self,
        memory_id: &str,
        content: &str,
        metadata: &MemoryWriteMetadata,
    ) -> Result<()> {
        let body = json!({
            "text": content,
            "metadata": { "category": metadata.category },
        });
        self.send_with_retry("update", || {
            self.http
                .put(format!("{}/v1/memories/{}/", self.api_base, memory_id))
                .json(&body)
        })
        .await?;
        tracing::debug!(memory_id = %memory_id, "memory gateway update succeeded");
        Ok(())
    }

    async fn delete(&self, memory_id: &str) -> Result<()> {
        self.send_with_retry("delete", || {
            self.http
                .delete(format!("{}/v1/memories/{}/", self.api_base, memory_id))
        })
        .await?;
        tracing::debug!(memory_id = %memory_id, "memory gateway delete succeeded");
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

fn retry_delay(base_delay_ms: u64, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6) as u32;
    Duration::from_millis(base_delay_ms.saturating_mul(1u64 << exponent))
}

fn truncate_for_error(body: &str) -> String {
    const MAX: usize = 240;
    if body.len() <= MAX {
        body.to_string()
    } else {
        format!("{}...", &body[..MAX])
    }
}
