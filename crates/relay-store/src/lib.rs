//! Durable SQLite-backed store for help requests and knowledge entries.
//!
//! The store is the single source of truth for both aggregates. Status
//! transitions go through a conditional update so concurrent callers racing
//! on the same request id get exactly one winner.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod sqlite;

pub use sqlite::SqliteStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("help request '{0}' not found")]
    RequestNotFound(String),
    #[error("knowledge entry '{0}' not found")]
    EntryNotFound(String),
    #[error("help request '{id}' already transitioned to {status}")]
    RequestAlreadyClosed { id: String, status: RequestStatus },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a help request. Transitions are one-way: `Pending`
/// is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Resolved,
    Unresolved,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "unresolved" => Some(Self::Unresolved),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Category of a knowledge entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    Hours,
    Services,
    Pricing,
    Location,
    Booking,
    #[default]
    Other,
}

impl KnowledgeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hours => "hours",
            Self::Services => "services",
            Self::Pricing => "pricing",
            Self::Location => "location",
            Self::Booking => "booking",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hours" => Some(Self::Hours),
            "services" => Some(Self::Services),
            "pricing" => Some(Self::Pricing),
            "location" => Some(Self::Location),
            "booking" => Some(Self::Booking),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Parses a category label, falling back to `Other` for unknown or
    /// missing values.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or_default()
    }
}

/// Provenance of a knowledge entry: seeded/manually authored vs. promoted
/// from a resolved help request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSource {
    Initial,
    Learned,
}

impl KnowledgeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Learned => "learned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(Self::Initial),
            "learned" => Some(Self::Learned),
            _ => None,
        }
    }
}

/// Resolution state of the external semantic-memory reference attached to
/// a knowledge entry. `Resolved` is the only state carrying an identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MemoryRef {
    /// No index write was ever requested for this entry.
    #[default]
    Absent,
    /// An index write is queued or in flight.
    Pending,
    /// The index write succeeded.
    Resolved {
        #[serde(rename = "memoryId")]
        memory_id: String,
    },
    /// The index write permanently failed; the entry stays usable for
    /// exact-lookup paths and the state remains queryable.
    Failed,
}

impl MemoryRef {
    pub fn state_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Pending => "pending",
            Self::Resolved { .. } => "resolved",
            Self::Failed => "failed",
        }
    }

    pub fn memory_id(&self) -> Option<&str> {
        match self {
            Self::Resolved { memory_id } => Some(memory_id),
            _ => None,
        }
    }

    pub fn from_columns(state: &str, memory_id: Option<String>) -> StoreResult<Self> {
        match (state, memory_id) {
            ("absent", _) => Ok(Self::Absent),
            ("pending", _) => Ok(Self::Pending),
            ("resolved", Some(memory_id)) => Ok(Self::Resolved { memory_id }),
            ("failed", _) => Ok(Self::Failed),
            (other, _) => Err(StoreError::InvalidPersistedValue {
                field: "memory_state",
                value: other.to_string(),
            }),
        }
    }
}

/// A customer question escalated to a human supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelpRequest {
    pub id: String,
    pub question: String,
    pub customer_phone: String,
    pub customer_context: String,
    pub status: RequestStatus,
    pub answer: Option<String>,
    pub supervisor_notes: Option<String>,
    pub timeout_at_unix_ms: u64,
    pub resolved_at_unix_ms: Option<u64>,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

/// A durable question/answer record usable for future automated matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub category: KnowledgeCategory,
    pub tags: Vec<String>,
    pub source: KnowledgeSource,
    pub source_request_id: Option<String>,
    pub usage_count: u64,
    pub memory_ref: MemoryRef,
    pub is_active: bool,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

/// Fields required to insert a new help request.
#[derive(Debug, Clone)]
pub struct NewHelpRequest {
    pub question: String,
    pub customer_phone: String,
    pub customer_context: String,
    pub timeout_at_unix_ms: u64,
}

/// Fields required to insert a new knowledge entry.
#[derive(Debug, Clone)]
pub struct NewKnowledgeEntry {
    pub question: String,
    pub answer: String,
    pub category: KnowledgeCategory,
    pub tags: Vec<String>,
    pub source: KnowledgeSource,
    pub source_request_id: Option<String>,
    pub memory_ref: MemoryRef,
}

/// Partial update applied to a knowledge entry; `None` fields are kept.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeEntryUpdate {
    pub question: Option<String>,
    pub answer: Option<String>,
    pub category: Option<KnowledgeCategory>,
    pub tags: Option<Vec<String>>,
}

/// Sortable help-request list columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestSortField {
    #[default]
    Created,
    Updated,
    Timeout,
    Status,
}

impl RequestSortField {
    /// Maps an API sort key to a column, defaulting to creation time for
    /// unknown or missing keys.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value {
            Some("updatedAt") => Self::Updated,
            Some("timeoutAt") => Self::Timeout,
            Some("status") => Self::Status,
            _ => Self::Created,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::Created => "created_unix_ms",
            Self::Updated => "updated_unix_ms",
            Self::Timeout => "timeout_at_unix_ms",
            Self::Status => "status",
        }
    }
}

/// Sort direction; defaults to descending like the listing API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

impl SortDirection {
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value {
            Some("asc") => Self::Ascending,
            _ => Self::Descending,
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Pagination and filtering options for help-request listings.
#[derive(Debug, Clone)]
pub struct HelpRequestListQuery {
    pub status: Option<RequestStatus>,
    /// 1-indexed page number.
    pub page: u64,
    pub page_size: u64,
    pub sort_field: RequestSortField,
    pub sort_direction: SortDirection,
}

impl Default for HelpRequestListQuery {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            page_size: 20,
            sort_field: RequestSortField::default(),
            sort_direction: SortDirection::default(),
        }
    }
}

/// Filtering options for knowledge listings; only active entries are
/// ever returned.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeListFilter {
    pub category: Option<KnowledgeCategory>,
    pub source: Option<KnowledgeSource>,
    pub limit: Option<u64>,
}

/// Help-request counters for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub pending: u64,
    pub resolved: u64,
    pub unresolved: u64,
    pub total_today: u64,
}

/// A most-used knowledge entry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeUsageRow {
    pub question: String,
    pub usage_count: u64,
}

/// Knowledge-base counters for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStats {
    pub total_entries: u64,
    pub by_category: std::collections::BTreeMap<String, u64>,
    pub by_source: std::collections::BTreeMap<String, u64>,
    pub most_used: Vec<KnowledgeUsageRow>,
}
