//! Embedding records, work items and search matches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of a conversation owned by the conversation store
pub type ConversationId = i64;

/// Identifier of an exchange (one prompt/response turn) within a conversation
pub type ExchangeId = i64;

/// What an embedding row summarizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingKind {
    ConversationSummary,
    ExchangeSummary,
}

impl EmbeddingKind {
    pub const ALL: [EmbeddingKind; 2] = [
        EmbeddingKind::ConversationSummary,
        EmbeddingKind::ExchangeSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingKind::ConversationSummary => "conversation_summary",
            EmbeddingKind::ExchangeSummary => "exchange_summary",
        }
    }
}

impl std::fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmbeddingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conversation_summary" => Ok(EmbeddingKind::ConversationSummary),
            "exchange_summary" => Ok(EmbeddingKind::ExchangeSummary),
            _ => Err(Error::invalid_input(format!("Unknown embedding kind: {}", s))),
        }
    }
}

/// A stored embedding.
///
/// Exactly one of `conversation_id` / `exchange_id` is set, matching `kind`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub kind: EmbeddingKind,
    pub conversation_id: Option<ConversationId>,
    pub exchange_id: Option<ExchangeId>,
    pub content: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    /// The referenced conversation or exchange id
    pub fn ref_id(&self) -> i64 {
        match self.kind {
            EmbeddingKind::ConversationSummary => self.conversation_id.unwrap_or_default(),
            EmbeddingKind::ExchangeSummary => self.exchange_id.unwrap_or_default(),
        }
    }
}

/// Result of an upsert
#[derive(Debug, Clone)]
pub struct Upserted {
    pub record: EmbeddingRecord,

    /// False when an existing row for the same key was replaced
    pub inserted: bool,
}

/// Identity of a unit of embedding work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkKey {
    pub kind: EmbeddingKind,
    pub ref_id: i64,
}

impl std::fmt::Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.ref_id)
    }
}

/// A summary waiting to be embedded.
///
/// The kind is carried explicitly from discovery, never inferred.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub kind: EmbeddingKind,
    pub ref_id: i64,

    /// Conversation the summary belongs to (equal to `ref_id` for conversation summaries)
    pub conversation_id: ConversationId,

    pub text: String,
}

impl WorkItem {
    pub fn conversation(id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            kind: EmbeddingKind::ConversationSummary,
            ref_id: id,
            conversation_id: id,
            text: text.into(),
        }
    }

    pub fn exchange(id: ExchangeId, conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            kind: EmbeddingKind::ExchangeSummary,
            ref_id: id,
            conversation_id,
            text: text.into(),
        }
    }

    pub fn key(&self) -> WorkKey {
        WorkKey {
            kind: self.kind,
            ref_id: self.ref_id,
        }
    }
}

/// A conversation summary matched by similarity search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationMatch {
    pub conversation_id: ConversationId,
    pub summary: String,
    pub similarity: f32,

    /// Timestamp of the summary text, used to break similarity ties
    pub recency: DateTime<Utc>,
}

/// An exchange summary matched by similarity search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeMatch {
    pub exchange_id: ExchangeId,
    pub conversation_id: ConversationId,
    pub summary: String,
    pub similarity: f32,
    pub recency: DateTime<Utc>,
}

/// Search results plus the mode that produced them
#[derive(Debug, Clone)]
pub struct SearchOutcome<T> {
    pub matches: Vec<T>,

    /// True when the linear scan ran instead of the native index
    pub fallback: bool,
}
