//! Candidate filtering and ranking shared by the native index and the linear scan.
//!
//! Both search modes produce the same `Candidate`s (similarity recomputed from
//! the stored vector) and hand them to [`select`], so they rank identically.
//! The native path additionally asks [`is_complete`] whether the rows it has
//! not fetched yet could still change the selection.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::record::ConversationId;

/// Slack between the index's own distance and our recomputed similarity
const SIMILARITY_EPSILON: f32 = 1e-4;

/// A stored embedding scored against the query
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub row_id: i64,
    pub ref_id: i64,
    pub conversation_id: ConversationId,
    pub content: String,
    pub similarity: f32,
    pub recency: DateTime<Utc>,
}

/// Similarity descending, then recency descending, then newest row
pub(crate) fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| b.recency.cmp(&a.recency))
        .then_with(|| b.row_id.cmp(&a.row_id))
}

/// Which candidates are eligible at all
#[derive(Debug, Clone, Default)]
pub(crate) struct Filter {
    pub min_similarity: f32,
    pub exclude_conversation: Option<ConversationId>,
    pub only_conversations: Option<HashSet<ConversationId>>,
}

impl Filter {
    fn admits(&self, c: &Candidate) -> bool {
        if c.similarity < self.min_similarity {
            return false;
        }
        if self.exclude_conversation == Some(c.conversation_id) {
            return false;
        }
        match &self.only_conversations {
            Some(set) => set.contains(&c.conversation_id),
            None => true,
        }
    }
}

/// How many of the eligible candidates to keep
#[derive(Debug, Clone, Copy)]
pub(crate) enum Shape {
    /// Best `limit` overall
    Top { limit: usize },

    /// Best `per_conversation` from each conversation, then best `cap` of those
    PerConversation { per_conversation: usize, cap: usize },
}

impl Shape {
    /// Rough number of index rows needed before the selection can settle
    pub fn wanted(&self, conversations: usize) -> usize {
        match *self {
            Shape::Top { limit } => limit,
            Shape::PerConversation { per_conversation, cap } => {
                cap.max(per_conversation.saturating_mul(conversations.max(1)))
            }
        }
    }
}

/// Filter, rank and cut the candidates
pub(crate) fn select(mut candidates: Vec<Candidate>, filter: &Filter, shape: Shape) -> Vec<Candidate> {
    candidates.retain(|c| filter.admits(c));
    candidates.sort_by(rank_order);

    match shape {
        Shape::Top { limit } => {
            candidates.truncate(limit);
            candidates
        }
        Shape::PerConversation { per_conversation, cap } => {
            let mut taken: HashMap<ConversationId, usize> = HashMap::new();
            let mut selected = Vec::new();
            for c in candidates {
                let count = taken.entry(c.conversation_id).or_insert(0);
                if *count < per_conversation {
                    *count += 1;
                    selected.push(c);
                }
            }
            selected.truncate(cap);
            selected
        }
    }
}

/// Whether rows the index has not returned yet could still enter the selection.
///
/// `frontier` is the similarity of the last row the index returned; every
/// unseen row scores at most that. `selected` is what [`select`] produced from
/// the rows seen so far.
pub(crate) fn is_complete(selected: &[Candidate], frontier: f32, filter: &Filter, shape: Shape) -> bool {
    if frontier < filter.min_similarity - SIMILARITY_EPSILON {
        return true;
    }

    let beats_frontier = |c: &Candidate| c.similarity > frontier + SIMILARITY_EPSILON;

    match shape {
        Shape::Top { limit } => selected.len() >= limit && selected.last().is_some_and(beats_frontier),
        Shape::PerConversation { per_conversation, cap } => {
            if selected.len() >= cap && selected.last().is_some_and(beats_frontier) {
                return true;
            }

            // Otherwise every requested conversation must already be full with
            // rows that an unseen row cannot displace
            let Some(wanted) = &filter.only_conversations else {
                return false;
            };
            wanted.iter().all(|conversation_id| {
                let group: Vec<&Candidate> = selected
                    .iter()
                    .filter(|c| c.conversation_id == *conversation_id)
                    .collect();
                group.len() >= per_conversation && group.last().is_some_and(|c| beats_frontier(c))
            })
        }
    }
}
