//! SQLite-backed store implementation with durable persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use relay_core::start_of_utc_day_ms;

use crate::{
    HelpRequest, HelpRequestListQuery, KnowledgeCategory, KnowledgeEntry, KnowledgeEntryUpdate,
    KnowledgeListFilter, KnowledgeSource, KnowledgeStats, KnowledgeUsageRow, MemoryRef,
    NewHelpRequest, NewKnowledgeEntry, RequestStats, RequestStatus, StoreError, StoreResult,
};

const MOST_USED_LIMIT: u64 = 5;

/// Persistent SQLite store owning the help-request and knowledge aggregates.
#[derive(Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
    id_sequence: AtomicU64,
}

impl SqliteStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            db_path,
            id_sequence: AtomicU64::new(0),
        };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS help_requests (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                customer_phone TEXT NOT NULL,
                customer_context TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                answer TEXT NULL,
                supervisor_notes TEXT NULL,
                timeout_at_unix_ms INTEGER NOT NULL,
                resolved_at_unix_ms INTEGER NULL,
                created_unix_ms INTEGER NOT NULL,
                updated_unix_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_help_requests_status_created
                ON help_requests (status, created_unix_ms);
            CREATE INDEX IF NOT EXISTS idx_help_requests_timeout
                ON help_requests (timeout_at_unix_ms);

            CREATE TABLE IF NOT EXISTS knowledge_entries (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                category TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                source TEXT NOT NULL,
                source_request_id TEXT NULL,
                usage_count INTEGER NOT NULL,
                memory_state TEXT NOT NULL,
                memory_id TEXT NULL,
                is_active INTEGER NOT NULL,
                created_unix_ms INTEGER NOT NULL,
                updated_unix_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_knowledge_category_active
                ON knowledge_entries (category, is_active);
            CREATE INDEX IF NOT EXISTS idx_knowledge_source_created
                ON knowledge_entries (source, created_unix_ms);
            CREATE INDEX IF NOT EXISTS idx_knowledge_memory_id
                ON knowledge_entries (memory_id);
            "#,
        )?;
        Ok(())
    }

    fn next_id(&self, prefix: &str, now_unix_ms: u64) -> String {
        let sequence = self.id_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{now_unix_ms}-{sequence:04x}")
    }

    // --- help requests ---

    /// Inserts a pending help request and returns the stored record.
    pub fn insert_help_request(
        &self,
        new_request: NewHelpRequest,
        now_unix_ms: u64,
    ) -> StoreResult<HelpRequest> {
        let id = self.next_id("req", now_unix_ms);
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO help_requests (
                id, question, customer_phone, customer_context, status,
                answer, supervisor_notes, timeout_at_unix_ms, resolved_at_unix_ms,
                created_unix_ms, updated_unix_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, NULL, ?7, ?7)
            "#,
            params![
                id,
                new_request.question,
                new_request.customer_phone,
                new_request.customer_context,
                RequestStatus::Pending.as_str(),
                new_request.timeout_at_unix_ms,
                now_unix_ms,
            ],
        )?;
        self.fetch_help_request(&connection, &id)
    }

    /// Point read; `RequestNotFound` when absent.
    pub fn get_help_request(&self, id: &str) -> StoreResult<HelpRequest> {
        let connection = self.open_connection()?;
        self.fetch_help_request(&connection, id)
    }

    /// Atomically transitions a pending request to a terminal status.
    ///
    /// The conditional update is the per-id serialization point: of two
    /// racing callers exactly one sees an affected row. The loser gets
    /// `RequestAlreadyClosed` (or `RequestNotFound` when the id never
    /// existed) and must not re-run side effects.
    pub fn claim_transition(
        &self,
        id: &str,
        to_status: RequestStatus,
        answer: Option<&str>,
        supervisor_notes: Option<&str>,
        now_unix_ms: u64,
    ) -> StoreResult<HelpRequest> {
        debug_assert!(to_status.is_terminal());
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        let changed = transaction.execute(
            r#"
            UPDATE help_requests
            SET status = ?2,
                answer = ?3,
                supervisor_notes = ?4,
                resolved_at_unix_ms = ?5,
                updated_unix_ms = ?5
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![id, to_status.as_str(), answer, supervisor_notes, now_unix_ms],
        )?;

        if changed == 0 {
            let current: Option<String> = transaction
                .query_row(
                    "SELECT status FROM help_requests WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            return match current {
                Some(raw_status) => {
                    let status = RequestStatus::parse(&raw_status).ok_or(
                        StoreError::InvalidPersistedValue {
                            field: "status",
                            value: raw_status,
                        },
                    )?;
                    Err(StoreError::RequestAlreadyClosed {
                        id: id.to_string(),
                        status,
                    })
                }
                None => Err(StoreError::RequestNotFound(id.to_string())),
            };
        }

        let request = Self::query_help_request(&transaction, id)?
            .ok_or_else(|| StoreError::RequestNotFound(id.to_string()))?;
        transaction.commit()?;
        Ok(request)
    }

    /// Paginated, sorted listing; returns the page and the total match count.
    pub fn list_help_requests(
        &self,
        query: &HelpRequestListQuery,
    ) -> StoreResult<(Vec<HelpRequest>, u64)> {
        let connection = self.open_connection()?;
        let page = query.page.max(1);
        let page_size = query.page_size.max(1);
        let offset = (page - 1) * page_size;

        let where_clause = match query.status {
            Some(_) => "WHERE status = ?1",
            None => "",
        };
        let order_clause = format!(
            "ORDER BY {} {}",
            query.sort_field.column(),
            query.sort_direction.keyword()
        );

        let select_sql = format!(
            "SELECT {HELP_REQUEST_COLUMNS} FROM help_requests {where_clause} {order_clause} LIMIT {page_size} OFFSET {offset}"
        );
        let count_sql = format!("SELECT COUNT(1) FROM help_requests {where_clause}");

        let mut statement = connection.prepare(&select_sql)?;
        let rows = match query.status {
            Some(status) => statement.query_map(params![status.as_str()], map_help_request_row)?,
            None => statement.query_map([], map_help_request_row)?,
        };
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?.into_request()?);
        }

        let total: u64 = match query.status {
            Some(status) => {
                connection.query_row(&count_sql, params![status.as_str()], |row| row.get(0))?
            }
            None => connection.query_row(&count_sql, [], |row| row.get(0))?,
        };

        Ok((requests, total))
    }

    /// Pending requests whose deadline has passed, oldest deadline first.
    pub fn list_overdue_pending(&self, now_unix_ms: u64) -> StoreResult<Vec<HelpRequest>> {
        self.query_pending_by_timeout_range(None, Some(now_unix_ms))
    }

    /// Pending requests with a deadline inside `[from, to]`, used by the
    /// sweep warning pass.
    pub fn list_pending_in_warning_window(
        &self,
        from_unix_ms: u64,
        to_unix_ms: u64,
    ) -> StoreResult<Vec<HelpRequest>> {
        self.query_pending_by_timeout_range(Some(from_unix_ms), Some(to_unix_ms))
    }

    fn query_pending_by_timeout_range(
        &self,
        from_unix_ms: Option<u64>,
        to_unix_ms: Option<u64>,
    ) -> StoreResult<Vec<HelpRequest>> {
        let connection = self.open_connection()?;
        let sql = format!(
            "SELECT {HELP_REQUEST_COLUMNS} FROM help_requests \
             WHERE status = 'pending' \
               AND (?1 IS NULL OR timeout_at_unix_ms >= ?1) \
               AND (?2 IS NULL OR timeout_at_unix_ms <= ?2) \
             ORDER BY timeout_at_unix_ms ASC"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![from_unix_ms, to_unix_ms], map_help_request_row)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?.into_request()?);
        }
        Ok(requests)
    }

    /// Hard delete; returns whether a row existed.
    pub fn delete_help_request(&self, id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let changed = connection.execute("DELETE FROM help_requests WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Status counters plus the number of requests created since UTC
    /// midnight of `now_unix_ms`.
    pub fn request_stats(&self, now_unix_ms: u64) -> StoreResult<RequestStats> {
        let connection = self.open_connection()?;
        let mut stats = RequestStats::default();

        let mut statement =
            connection.prepare("SELECT status, COUNT(1) FROM help_requests GROUP BY status")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (raw_status, count) = row?;
            match RequestStatus::parse(&raw_status) {
                Some(RequestStatus::Pending) => stats.pending = count,
                Some(RequestStatus::Resolved) => stats.resolved = count,
                Some(RequestStatus::Unresolved) => stats.unresolved = count,
                None => {
                    return Err(StoreError::InvalidPersistedValue {
                        field: "status",
                        value: raw_status,
                    })
                }
            }
        }

        stats.total_today = connection.query_row(
            "SELECT COUNT(1) FROM help_requests WHERE created_unix_ms >= ?1",
            params![start_of_utc_day_ms(now_unix_ms)],
            |row| row.get(0),
        )?;
        Ok(stats)
    }

    /// Resolution durations (resolved - created, in ms) of all resolved
    /// requests, for the dashboard distribution.
    pub fn resolution_durations_ms(&self) -> StoreResult<Vec<u64>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT resolved_at_unix_ms - created_unix_ms FROM help_requests \
             WHERE status = 'resolved' AND resolved_at_unix_ms IS NOT NULL",
        )?;
        let rows = statement.query_map([], |row| row.get::<_, u64>(0))?;
        let mut durations = Vec::new();
        for row in rows {
            durations.push(row?);
        }
        Ok(durations)
    }

    /// All requests created inside `[start, end]`, newest first.
    pub fn list_requests_created_between(
        &self,
        start_unix_ms: u64,
        end_unix_ms: u64,
    ) -> StoreResult<Vec<HelpRequest>> {
        let connection = self.open_connection()?;
        let sql = format!(
            "SELECT {HELP_REQUEST_COLUMNS} FROM help_requests \
             WHERE created_unix_ms >= ?1 AND created_unix_ms <= ?2 \
             ORDER BY created_unix_ms DESC"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![start_unix_ms, end_unix_ms], map_help_request_row)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?.into_request()?);
        }
        Ok(requests)
    }

    /// Per-category counts of knowledge entries promoted from requests
    /// created inside the window.
    pub fn escalation_category_counts(
        &self,
        start_unix_ms: u64,
        end_unix_ms: u64,
    ) -> StoreResult<BTreeMap<String, u64>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT k.category, COUNT(1) FROM knowledge_entries k \
             JOIN help_requests h ON k.source_request_id = h.id \
             WHERE h.created_unix_ms >= ?1 AND h.created_unix_ms <= ?2 \
             GROUP BY k.category",
        )?;
        let rows = statement.query_map(params![start_unix_ms, end_unix_ms], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (category, count) = row?;
            counts.insert(category, count);
        }
        Ok(counts)
    }

    fn fetch_help_request(&self, connection: &Connection, id: &str) -> StoreResult<HelpRequest> {
        Self::query_help_request(connection, id)?
            .ok_or_else(|| StoreError::RequestNotFound(id.to_string()))
    }

    fn query_help_request(
        connection: &Connection,
        id: &str,
    ) -> StoreResult<Option<HelpRequest>> {
        let sql = format!("SELECT {HELP_REQUEST_COLUMNS} FROM help_requests WHERE id = ?1");
        let row = connection
            .query_row(&sql, params![id], map_help_request_row)
            .optional()?;
        row.map(HelpRequestRow::into_request).transpose()
    }

    // --- knowledge entries ---

    /// Inserts a knowledge entry and returns the stored record.
    pub fn insert_knowledge_entry(
        &self,
        new_entry: NewKnowledgeEntry,
        now_unix_ms: u64,
    ) -> StoreResult<KnowledgeEntry> {
        let id = self.next_id("kb", now_unix_ms);
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO knowledge_entries (
                id, question, answer, category, tags_json, source,
                source_request_id, usage_count, memory_state, memory_id,
                is_active, created_unix_ms, updated_unix_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, 1, ?10, ?10)
            "#,
            params![
                id,
                new_entry.question,
                new_entry.answer,
                new_entry.category.as_str(),
                serde_json::to_string(&new_entry.tags)?,
                new_entry.source.as_str(),
                new_entry.source_request_id,
                new_entry.memory_ref.state_str(),
                new_entry.memory_ref.memory_id(),
                now_unix_ms,
            ],
        )?;
        self.fetch_knowledge_entry(&connection, &id)
    }

    /// Point read; `EntryNotFound` when absent.
    pub fn get_knowledge_entry(&self, id: &str) -> StoreResult<KnowledgeEntry> {
        let connection = self.open_connection()?;
        self.fetch_knowledge_entry(&connection, id)
    }

    /// Applies a partial update and returns the updated record.
    pub fn update_knowledge_entry(
        &self,
        id: &str,
        update: &KnowledgeEntryUpdate,
        now_unix_ms: u64,
    ) -> StoreResult<KnowledgeEntry> {
        let connection = self.open_connection()?;
        let existing = self.fetch_knowledge_entry(&connection, id)?;

        let question = update.question.as_deref().unwrap_or(&existing.question);
        let answer = update.answer.as_deref().unwrap_or(&existing.answer);
        let category = update.category.unwrap_or(existing.category);
        let tags = update.tags.as_ref().unwrap_or(&existing.tags);

        connection.execute(
            r#"
            UPDATE knowledge_entries
            SET question = ?2, answer = ?3, category = ?4, tags_json = ?5,
                updated_unix_ms = ?6
            WHERE id = ?1
            "#,
            params![
                id,
                question,
                answer,
                category.as_str(),
                serde_json::to_string(tags)?,
                now_unix_ms,
            ],
        )?;
        self.fetch_knowledge_entry(&connection, id)
    }

    /// Records the index-phase outcome on the durable entry.
    pub fn set_memory_ref(
        &self,
        id: &str,
        memory_ref: &MemoryRef,
        now_unix_ms: u64,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE knowledge_entries SET memory_state = ?2, memory_id = ?3, updated_unix_ms = ?4 \
             WHERE id = ?1",
            params![
                id,
                memory_ref.state_str(),
                memory_ref.memory_id(),
                now_unix_ms
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::EntryNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Soft delete; the entry disappears from all read paths but the row
    /// stays for provenance.
    pub fn deactivate_knowledge_entry(
        &self,
        id: &str,
        now_unix_ms: u64,
    ) -> StoreResult<KnowledgeEntry> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE knowledge_entries SET is_active = 0, updated_unix_ms = ?2 WHERE id = ?1",
            params![id, now_unix_ms],
        )?;
        if changed == 0 {
            return Err(StoreError::EntryNotFound(id.to_string()));
        }
        self.fetch_knowledge_entry(&connection, id)
    }

    /// Cross-references a gateway-native memory id back to the durable
    /// entry carrying it; active entries only.
    pub fn find_by_memory_id(&self, memory_id: &str) -> StoreResult<Option<KnowledgeEntry>> {
        let connection = self.open_connection()?;
        let sql = format!(
            "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_entries \
             WHERE memory_id = ?1 AND is_active = 1"
        );
        let row = connection
            .query_row(&sql, params![memory_id], map_knowledge_row)
            .optional()?;
        row.map(KnowledgeRow::into_entry).transpose()
    }

    /// True when a durable entry carries this memory id but has been
    /// soft-deleted; such hits must not surface from the derived index.
    pub fn memory_id_is_deactivated(&self, memory_id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let is_active: Option<bool> = connection
            .query_row(
                "SELECT is_active FROM knowledge_entries WHERE memory_id = ?1",
                params![memory_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(is_active, Some(false)))
    }

    /// Best-effort usage increment; returns whether a row was touched.
    pub fn increment_usage(&self, id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE knowledge_entries SET usage_count = usage_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Active entries matching the filter, newest first.
    pub fn list_knowledge(&self, filter: &KnowledgeListFilter) -> StoreResult<Vec<KnowledgeEntry>> {
        let connection = self.open_connection()?;
        let limit = filter.limit.map(|value| value.max(1)).unwrap_or(u64::MAX);
        let sql = format!(
            "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_entries \
             WHERE is_active = 1 \
               AND (?1 IS NULL OR category = ?1) \
               AND (?2 IS NULL OR source = ?2) \
             ORDER BY created_unix_ms DESC LIMIT {limit}"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(
            params![
                filter.category.map(|category| category.as_str()),
                filter.source.map(|source| source.as_str()),
            ],
            map_knowledge_row,
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Idempotent-seeding probe: an active initial entry with this exact
    /// question.
    pub fn find_initial_by_question(
        &self,
        question: &str,
    ) -> StoreResult<Option<KnowledgeEntry>> {
        let connection = self.open_connection()?;
        let sql = format!(
            "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_entries \
             WHERE question = ?1 AND source = 'initial' AND is_active = 1"
        );
        let row = connection
            .query_row(&sql, params![question], map_knowledge_row)
            .optional()?;
        row.map(KnowledgeRow::into_entry).transpose()
    }

    /// Aggregate counters over active entries.
    pub fn knowledge_stats(&self) -> StoreResult<KnowledgeStats> {
        let connection = self.open_connection()?;
        let mut stats = KnowledgeStats {
            total_entries: connection.query_row(
                "SELECT COUNT(1) FROM knowledge_entries WHERE is_active = 1",
                [],
                |row| row.get(0),
            )?,
            ..KnowledgeStats::default()
        };

        let mut statement = connection.prepare(
            "SELECT category, COUNT(1) FROM knowledge_entries WHERE is_active = 1 GROUP BY category",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (category, count) = row?;
            stats.by_category.insert(category, count);
        }

        let mut statement = connection.prepare(
            "SELECT source, COUNT(1) FROM knowledge_entries WHERE is_active = 1 GROUP BY source",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (source, count) = row?;
            stats.by_source.insert(source, count);
        }

        let mut statement = connection.prepare(
            "SELECT question, usage_count FROM knowledge_entries WHERE is_active = 1 \
             ORDER BY usage_count DESC LIMIT ?1",
        )?;
        let rows = statement.query_map(params![MOST_USED_LIMIT], |row| {
            Ok(KnowledgeUsageRow {
                question: row.get(0)?,
                usage_count: row.get(1)?,
            })
        })?;
        for row in rows {
            stats.most_used.push(row?);
        }

        Ok(stats)
    }

    fn fetch_knowledge_entry(
        &self,
        connection: &Connection,
        id: &str,
    ) -> StoreResult<KnowledgeEntry> {
        let sql = format!("SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_entries WHERE id = ?1");
        let row = connection
            .query_row(&sql, params![id], map_knowledge_row)
            .optional()?;
        row.map(KnowledgeRow::into_entry)
            .transpose()?
            .ok_or_else(|| StoreError::EntryNotFound(id.to_string()))
    }
}

const HELP_REQUEST_COLUMNS: &str = "id, question, customer_phone, customer_context, status, \
    answer, supervisor_notes, timeout_at_unix_ms, resolved_at_unix_ms, created_unix_ms, \
    updated_unix_ms";

const KNOWLEDGE_COLUMNS: &str = "id, question, answer, category, tags_json, source, \
    source_request_id, usage_count, memory_state, memory_id, is_active, created_unix_ms, \
    updated_unix_ms";

struct HelpRequestRow {
    id: String,
    question: String,
    customer_phone: String,
    customer_context: String,
    status: String,
    answer: Option<String>,
    supervisor_notes: Option<String>,
    timeout_at_unix_ms: u64,
    resolved_at_unix_ms: Option<u64>,
    created_unix_ms: u64,
    updated_unix_ms: u64,
}

impl HelpRequestRow {
    fn into_request(self) -> StoreResult<HelpRequest> {
        let status =
            RequestStatus::parse(&self.status).ok_or(StoreError::InvalidPersistedValue {
                field: "status",
                value: self.status,
            })?;
        Ok(HelpRequest {
            id: self.id,
            question: self.question,
            customer_phone: self.customer_phone,
            customer_context: self.customer_context,
            status,
            answer: self.answer,
            supervisor_notes: self.supervisor_notes,
            timeout_at_unix_ms: self.timeout_at_unix_ms,
            resolved_at_unix_ms: self.resolved_at_unix_ms,
            created_unix_ms: self.created_unix_ms,
            updated_unix_ms: self.updated_unix_ms,
        })
    }
}

fn map_help_request_row(row: &Row<'_>) -> rusqlite::Result<HelpRequestRow> {
    Ok(HelpRequestRow {
        id: row.get(0)?,
        question: row.get(1)?,
        customer_phone: row.get(2)?,
        customer_context: row.get(3)?,
        status: row.get(4)?,
        answer: row.get(5)?,
        supervisor_notes: row.get(6)?,
        timeout_at_unix_ms: row.get(7)?,
        resolved_at_unix_ms: row.get(8)?,
        created_unix_ms: row.get(9)?,
        updated_unix_ms: row.get(10)?,
    })
}

struct KnowledgeRow {
    id: String,
    question: String,
    answer: String,
    category: String,
    tags_json: String,
    source: String,
    source_request_id: Option<String>,
    usage_count: u64,
    memory_state: String,
    memory_id: Option<String>,
    is_active: bool,
    created_unix_ms: u64,
    updated_unix_ms: u64,
}

impl KnowledgeRow {
    fn into_entry(self) -> StoreResult<KnowledgeEntry> {
        let source =
            KnowledgeSource::parse(&self.source).ok_or(StoreError::InvalidPersistedValue {
                field: "source",
                value: self.source,
            })?;
        let memory_ref = MemoryRef::from_columns(&self.memory_state, self.memory_id)?;
        Ok(KnowledgeEntry {
            id: self.id,
            question: self.question,
            answer: self.answer,
            category: KnowledgeCategory::parse_or_default(Some(&self.category)),
            tags: serde_json::from_str(&self.tags_json)?,
            source,
            source_request_id: self.source_request_id,
            usage_count: self.usage_count,
            memory_ref,
            is_active: self.is_active,
            created_unix_ms: self.created_unix_ms,
            updated_unix_ms: self.updated_unix_ms,
        })
    }
}

fn map_knowledge_row(row: &Row<'_>) -> rusqlite::Result<KnowledgeRow> {
    Ok(KnowledgeRow {
        id: row.get(0)?,
        question: row.get(1)?,
        answer: row.get(2)?,
        category: row.get(3)?,
        tags_json: row.get(4)?,
        source: row.get(5)?,
        source_request_id: row.get(6)?,
        usage_count: row.get(7)?,
        memory_state: row.get(8)?,
        memory_id: row.get(9)?,
        is_active: row.get(10)?,
        created_unix_ms: row.get(11)?,
        updated_unix_ms: row.get(12)?,
    })
}
