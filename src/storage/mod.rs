//! Storage backends for rag-memory

mod jsonl;
mod rank;
mod sqlite;
pub mod vector;

pub use jsonl::JsonlFile;
pub use sqlite::{EmbeddingStore, IndexMode};
pub use vector::cosine_similarity;
