//! SQLite-backed embedding store with dual-mode similarity search

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use super::rank::{self, Candidate, Filter, Shape};
use super::vector;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::{
    ConversationId, ConversationMatch, EmbeddingKind, EmbeddingRecord, ExchangeId, ExchangeMatch,
    SearchOutcome, Upserted, WorkItem, WorkKey,
};

/// Smallest KNN request; small limits still fetch a little extra
const MIN_KNN_K: usize = 16;

/// How similarity search is currently executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Native,
    LinearScan,
}

/// Persistent embedding storage.
///
/// Writes are transactional; uniqueness per `(kind, conversation_id)` and
/// `(kind, exchange_id)` is enforced by the schema, so concurrent writers and
/// crash-restarts cannot create duplicates.
pub struct EmbeddingStore {
    conn: Arc<Mutex<Connection>>,
    dimensions: usize,
    native: AtomicBool,
}

impl EmbeddingStore {
    /// Open (or create) the store under the configured data directory
    pub fn open(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        if config.native_index {
            vector::register_sqlite_vec();
        }
        let conn = Connection::open(config.sqlite_path())?;
        Self::init(conn, config.embedding_dimensions, config.native_index)
    }

    /// Private in-memory store, for tests and tooling
    pub fn open_in_memory(dimensions: usize, native_index: bool) -> Result<Self> {
        if native_index {
            vector::register_sqlite_vec();
        }
        Self::init(Connection::open_in_memory()?, dimensions, native_index)
    }

    fn init(conn: Connection, dimensions: usize, native_index: bool) -> Result<Self> {
        if dimensions == 0 {
            return Err(Error::config("embedding_dimensions must be at least 1"));
        }

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        let native = native_index && vector::init_index(&conn, dimensions);
        if !native_index {
            debug!("Native vector index disabled by configuration");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dimensions,
            native: AtomicBool::new(native),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn index_mode(&self) -> IndexMode {
        if self.native.load(Ordering::Acquire) {
            IndexMode::Native
        } else {
            IndexMode::LinearScan
        }
    }

    /// Switch to linear scan for the rest of the process lifetime
    fn degrade(&self, reason: &Error) {
        if self.native.swap(false, Ordering::AcqRel) {
            warn!("Vector index failed, falling back to linear scan: {}", reason);
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::invalid_input(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(())
    }

    /// Insert or replace the embedding for a conversation or exchange summary
    pub fn upsert(&self, kind: EmbeddingKind, ref_id: i64, content: &str, vector: &[f32]) -> Result<Upserted> {
        self.check_dimensions(vector)?;

        let blob = vector::to_blob(vector);
        let now = timestamp(Utc::now());
        let (conversation_id, exchange_id) = match kind {
            EmbeddingKind::ConversationSummary => (Some(ref_id), None),
            EmbeddingKind::ExchangeSummary => (None, Some(ref_id)),
        };

        let mut conn = self.lock()?;
        let mut tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                &format!("SELECT id FROM embeddings WHERE kind = ?1 AND {} = ?2", ref_column(kind)),
                params![kind.as_str(), ref_id],
                |row| row.get(0),
            )
            .optional()?;

        let (id, created_at): (i64, String) = tx.query_row(
            &format!(
                r#"
                INSERT INTO embeddings (
                    kind, conversation_id, exchange_id, content, embedding, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(kind, {col}) WHERE {col} IS NOT NULL DO UPDATE SET
                    content = excluded.content,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                RETURNING id, created_at
                "#,
                col = ref_column(kind)
            ),
            params![kind.as_str(), conversation_id, exchange_id, content, blob, now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if self.native.load(Ordering::Acquire) {
            // Savepoint so a broken index cannot take the row write down with it
            let sp = tx.savepoint()?;
            match vector::upsert(&sp, kind, id, &blob) {
                Ok(()) => sp.commit()?,
                Err(e) => {
                    drop(sp);
                    self.degrade(&e);
                }
            }
        }

        tx.commit()?;

        Ok(Upserted {
            record: EmbeddingRecord {
                id,
                kind,
                conversation_id,
                exchange_id,
                content: content.to_string(),
                vector: vector.to_vec(),
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&now)?,
            },
            inserted: existing.is_none(),
        })
    }

    /// Fetch the embedding for a conversation or exchange
    pub fn get(&self, kind: EmbeddingKind, ref_id: i64) -> Result<Option<EmbeddingRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    r#"
                    SELECT id, conversation_id, exchange_id, content, embedding, created_at, updated_at
                    FROM embeddings WHERE kind = ?1 AND {} = ?2
                    "#,
                    ref_column(kind)
                ),
                params![kind.as_str(), ref_id],
                |row| {
                    Ok(RecordRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        exchange_id: row.get(2)?,
                        content: row.get(3)?,
                        embedding: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;

        row.map(|r| r.into_record(kind)).transpose()
    }

    /// Most similar conversation summaries, never including `exclude`
    pub fn search_conversations(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
        exclude: Option<ConversationId>,
    ) -> Result<SearchOutcome<ConversationMatch>> {
        let filter = Filter {
            min_similarity,
            exclude_conversation: exclude,
            only_conversations: None,
        };
        let (candidates, fallback) = self.search(
            EmbeddingKind::ConversationSummary,
            query,
            &filter,
            Shape::Top { limit },
        )?;

        Ok(SearchOutcome {
            matches: candidates
                .into_iter()
                .map(|c| ConversationMatch {
                    conversation_id: c.conversation_id,
                    summary: c.content,
                    similarity: c.similarity,
                    recency: c.recency,
                })
                .collect(),
            fallback,
        })
    }

    /// Most similar exchange summaries.
    ///
    /// With `conversation_ids`, at most `per_conversation` exchanges from each
    /// listed conversation; without, a direct search over all exchanges. The
    /// combined list is capped at `global_cap` either way.
    pub fn search_exchanges(
        &self,
        query: &[f32],
        conversation_ids: Option<&[ConversationId]>,
        per_conversation: usize,
        global_cap: usize,
        min_similarity: f32,
    ) -> Result<SearchOutcome<ExchangeMatch>> {
        let (filter, shape) = match conversation_ids {
            Some(ids) => (
                Filter {
                    min_similarity,
                    exclude_conversation: None,
                    only_conversations: Some(ids.iter().copied().collect()),
                },
                Shape::PerConversation {
                    per_conversation,
                    cap: global_cap,
                },
            ),
            None => (
                Filter {
                    min_similarity,
                    ..Default::default()
                },
                Shape::Top { limit: global_cap },
            ),
        };

        let (candidates, fallback) = self.search(EmbeddingKind::ExchangeSummary, query, &filter, shape)?;

        Ok(SearchOutcome {
            matches: candidates
                .into_iter()
                .map(|c| ExchangeMatch {
                    exchange_id: c.ref_id,
                    conversation_id: c.conversation_id,
                    summary: c.content,
                    similarity: c.similarity,
                    recency: c.recency,
                })
                .collect(),
            fallback,
        })
    }

    fn search(
        &self,
        kind: EmbeddingKind,
        query: &[f32],
        filter: &Filter,
        shape: Shape,
    ) -> Result<(Vec<Candidate>, bool)> {
        self.check_dimensions(query)?;

        let empty_shape = match shape {
            Shape::Top { limit } => limit == 0,
            Shape::PerConversation { per_conversation, cap } => per_conversation == 0 || cap == 0,
        };
        let empty_set = filter.only_conversations.as_ref().is_some_and(|s| s.is_empty());
        if empty_shape || empty_set {
            return Ok((Vec::new(), !self.native.load(Ordering::Acquire)));
        }

        let conn = self.lock()?;

        if self.native.load(Ordering::Acquire) {
            match native_search(&conn, kind, query, filter, shape) {
                Ok(Some(selected)) => return Ok((selected, false)),
                Ok(None) => {
                    debug!("KNN window exhausted for {}, using linear scan for this query", kind);
                }
                Err(e @ Error::IndexUnavailable(_)) => self.degrade(&e),
                Err(e) => return Err(e),
            }
        }

        let candidates = load_candidates(&conn, kind, query, None, filter)?;
        Ok((rank::select(candidates, filter, shape), true))
    }

    /// Delete every embedding of one kind; returns how many were removed
    pub fn clear(&self, kind: EmbeddingKind) -> Result<usize> {
        let mut conn = self.lock()?;
        let mut tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM embeddings WHERE kind = ?1", params![kind.as_str()])?;

        if self.native.load(Ordering::Acquire) {
            let sp = tx.savepoint()?;
            match vector::clear(&sp, kind) {
                Ok(()) => sp.commit()?,
                Err(e) => {
                    drop(sp);
                    self.degrade(&e);
                }
            }
        }

        tx.commit()?;
        Ok(removed)
    }

    /// Number of stored embeddings of one kind
    pub fn count(&self, kind: EmbeddingKind) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Summaries with no embedding, or whose text changed after it was embedded.
    ///
    /// Oldest summaries first. Items in `skip` are left out and do not count
    /// toward `limit`.
    pub fn pending_work(&self, limit: usize, skip: &HashSet<WorkKey>) -> Result<Vec<WorkItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY summary_at ASC, ref_id ASC LIMIT ?1", PENDING_SQL))?;
        let fetch = limit.saturating_add(skip.len());
        let rows = stmt.query_map(params![fetch as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (kind, ref_id, conversation_id, text) = row?;
            let kind: EmbeddingKind = kind.parse()?;
            let item = WorkItem {
                kind,
                ref_id,
                conversation_id,
                text,
            };
            if skip.contains(&item.key()) {
                continue;
            }
            items.push(item);
            if items.len() == limit {
                break;
            }
        }

        Ok(items)
    }

    /// Size of the embedding backlog
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM ({})", PENDING_SQL), [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Write path of the summarizer: create or rewrite a conversation summary
    pub fn save_conversation_summary(&self, id: ConversationId, summary: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let at = timestamp(at);
        conn.execute(
            r#"
            INSERT INTO conversations (id, summary, summary_updated_at, created_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET
                summary = excluded.summary,
                summary_updated_at = excluded.summary_updated_at
            "#,
            params![id, summary, at],
        )?;
        Ok(())
    }

    /// Write path of the summarizer: create or rewrite an exchange summary.
    ///
    /// The owning conversation must exist.
    pub fn save_exchange_summary(
        &self,
        id: ExchangeId,
        conversation_id: ConversationId,
        summary: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let known: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![conversation_id],
            |row| row.get(0),
        )?;
        if !known {
            return Err(Error::not_found(format!("conversation {}", conversation_id)));
        }

        let at = timestamp(at);
        conn.execute(
            r#"
            INSERT INTO exchanges (id, conversation_id, summary, summary_updated_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(id) DO UPDATE SET
                summary = excluded.summary,
                summary_updated_at = excluded.summary_updated_at
            "#,
            params![id, conversation_id, summary, at],
        )?;
        Ok(())
    }

    /// Delete a conversation; its exchanges and all their embeddings cascade
    pub fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        self.delete_with_index(
            "DELETE FROM conversations WHERE id = ?1",
            r#"
            SELECT id, kind FROM embeddings WHERE conversation_id = ?1
            UNION ALL
            SELECT e.id, e.kind FROM embeddings e
            JOIN exchanges x ON x.id = e.exchange_id
            WHERE x.conversation_id = ?1
            "#,
            id,
        )
    }

    /// Delete an exchange; its embedding cascades
    pub fn delete_exchange(&self, id: ExchangeId) -> Result<bool> {
        self.delete_with_index(
            "DELETE FROM exchanges WHERE id = ?1",
            "SELECT id, kind FROM embeddings WHERE exchange_id = ?1",
            id,
        )
    }

    /// Run a cascading delete and drop the index entries of the embeddings it takes along
    fn delete_with_index(&self, delete_sql: &str, embeddings_sql: &str, id: i64) -> Result<bool> {
        let mut conn = self.lock()?;
        let mut tx = conn.transaction()?;

        let doomed: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(embeddings_sql)?;
            let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let deleted = tx.execute(delete_sql, params![id])? > 0;

        if deleted && !doomed.is_empty() && self.native.load(Ordering::Acquire) {
            let sp = tx.savepoint()?;
            let pruned = EmbeddingKind::ALL.into_iter().try_for_each(|kind| {
                let ids: Vec<i64> = doomed
                    .iter()
                    .filter(|(_, k)| k == kind.as_str())
                    .map(|(row_id, _)| *row_id)
                    .collect();
                vector::remove(&sp, kind, &ids)
            });
            match pruned {
                Ok(()) => sp.commit()?,
                Err(e) => {
                    drop(sp);
                    self.degrade(&e);
                }
            }
        }

        tx.commit()?;
        Ok(deleted)
    }
}

/// Both kinds of un-embedded or stale summaries, as (kind, ref_id, conversation_id, text, summary_at).
///
/// An embedding is stale when its text differs from the current summary, so a
/// rewrite that lands while the old text is being embedded stays pending.
const PENDING_SQL: &str = r#"
    SELECT 'conversation_summary' AS kind, c.id AS ref_id, c.id AS conversation_id,
           c.summary AS text, COALESCE(c.summary_updated_at, c.created_at) AS summary_at
    FROM conversations c
    LEFT JOIN embeddings e ON e.kind = 'conversation_summary' AND e.conversation_id = c.id
    WHERE c.summary IS NOT NULL AND c.summary <> ''
      AND (e.id IS NULL OR e.content <> c.summary)
    UNION ALL
    SELECT 'exchange_summary', x.id, x.conversation_id,
           x.summary, COALESCE(x.summary_updated_at, x.created_at)
    FROM exchanges x
    LEFT JOIN embeddings e ON e.kind = 'exchange_summary' AND e.exchange_id = x.id
    WHERE x.summary IS NOT NULL AND x.summary <> ''
      AND (e.id IS NULL OR e.content <> x.summary)
"#;

fn ref_column(kind: EmbeddingKind) -> &'static str {
    match kind {
        EmbeddingKind::ConversationSummary => "conversation_id",
        EmbeddingKind::ExchangeSummary => "exchange_id",
    }
}

/// Candidate rows joined with their summary timestamp, as
/// (row id, ref id, conversation id, content, embedding, recency)
fn candidate_sql(kind: EmbeddingKind) -> &'static str {
    match kind {
        EmbeddingKind::ConversationSummary => {
            r#"
            SELECT e.id, e.conversation_id, e.conversation_id, e.content, e.embedding,
                   COALESCE(c.summary_updated_at, e.updated_at)
            FROM embeddings e
            JOIN conversations c ON c.id = e.conversation_id
            WHERE e.kind = 'conversation_summary'
            "#
        }
        EmbeddingKind::ExchangeSummary => {
            r#"
            SELECT e.id, e.exchange_id, x.conversation_id, e.content, e.embedding,
                   COALESCE(x.summary_updated_at, e.updated_at)
            FROM embeddings e
            JOIN exchanges x ON x.id = e.exchange_id
            WHERE e.kind = 'exchange_summary'
            "#
        }
    }
}

fn conversation_column(kind: EmbeddingKind) -> &'static str {
    match kind {
        EmbeddingKind::ConversationSummary => "e.conversation_id",
        EmbeddingKind::ExchangeSummary => "x.conversation_id",
    }
}

/// Load and score candidate rows.
///
/// `row_ids` restricts to rows the index proposed; `None` scans the whole kind
/// (with the conversation filters pushed into SQL).
fn load_candidates(
    conn: &Connection,
    kind: EmbeddingKind,
    query: &[f32],
    row_ids: Option<&[i64]>,
    filter: &Filter,
) -> Result<Vec<Candidate>> {
    let mut sql = candidate_sql(kind).to_string();
    let mut binds: Vec<i64> = Vec::new();

    if let Some(ids) = row_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sql.push_str(&format!(" AND e.id IN ({})", placeholders(ids.len())));
        binds.extend_from_slice(ids);
    } else {
        if let Some(excluded) = filter.exclude_conversation {
            sql.push_str(&format!(" AND {} <> ?", conversation_column(kind)));
            binds.push(excluded);
        }
        if let Some(only) = &filter.only_conversations {
            sql.push_str(&format!(" AND {} IN ({})", conversation_column(kind), placeholders(only.len())));
            binds.extend(only.iter().copied());
        }
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Vec<u8>>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut candidates = Vec::new();
    for row in rows {
        let (row_id, ref_id, conversation_id, content, blob, recency) = row?;
        candidates.push(Candidate {
            row_id,
            ref_id,
            conversation_id,
            content,
            similarity: vector::cosine_similarity(query, &vector::from_blob(&blob)),
            recency: parse_timestamp(&recency)?,
        });
    }

    Ok(candidates)
}

/// KNN through the vec0 index, widening the window until the rows not yet
/// seen can no longer change the selection.
///
/// `Ok(None)` means the window hit sqlite-vec's `k` ceiling first; the caller
/// answers that query with a linear scan.
fn native_search(
    conn: &Connection,
    kind: EmbeddingKind,
    query: &[f32],
    filter: &Filter,
    shape: Shape,
) -> Result<Option<Vec<Candidate>>> {
    let blob = vector::to_blob(query);
    let groups = filter.only_conversations.as_ref().map_or(1, |s| s.len());
    let mut k = shape.wanted(groups).saturating_mul(2).clamp(MIN_KNN_K, vector::MAX_KNN_K);

    loop {
        let hits = vector::knn(conn, kind, &blob, k)?;
        let exhausted = hits.len() < k;
        let frontier = hits.last().map(|(_, distance)| 1.0 - *distance as f32);

        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let candidates = load_candidates(conn, kind, query, Some(&ids), filter)?;
        let selected = rank::select(candidates, filter, shape);

        let settled = match frontier {
            None => true,
            Some(frontier) => exhausted || rank::is_complete(&selected, frontier, filter, shape),
        };
        if settled {
            return Ok(Some(selected));
        }
        if k >= vector::MAX_KNN_K {
            return Ok(None);
        }
        k = k.saturating_mul(2).min(vector::MAX_KNN_K);
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Fixed-width UTC timestamp so text comparison in SQL orders correctly
pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Bad timestamp {:?}: {}", s, e)))
}

/// Intermediate struct for reading from SQLite
struct RecordRow {
    id: i64,
    conversation_id: Option<i64>,
    exchange_id: Option<i64>,
    content: String,
    embedding: Vec<u8>,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn into_record(self, kind: EmbeddingKind) -> Result<EmbeddingRecord> {
        Ok(EmbeddingRecord {
            id: self.id,
            kind,
            conversation_id: self.conversation_id,
            exchange_id: self.exchange_id,
            content: self.content,
            vector: vector::from_blob(&self.embedding),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}
