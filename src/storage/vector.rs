//! Native nearest-neighbour index on sqlite-vec `vec0` tables, plus the
//! vector math the linear scan uses

use std::collections::HashSet;
use std::sync::Once;

use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::EmbeddingKind;

/// sqlite-vec refuses KNN queries with a larger `k`
pub(crate) const MAX_KNN_K: usize = 4096;

static VEC_EXTENSION: Once = Once::new();

/// Register sqlite-vec as an auto-extension for every connection opened afterwards.
///
/// Statically linked, so this needs no `load_extension` support.
pub(crate) fn register_sqlite_vec() {
    VEC_EXTENSION.call_once(|| {
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
        debug!("sqlite-vec auto-extension registered");
    });
}

/// vec0 table holding the index for one kind; rowid = `embeddings.id`
pub(crate) fn vector_table(kind: EmbeddingKind) -> &'static str {
    match kind {
        EmbeddingKind::ConversationSummary => "conversation_summary_vectors",
        EmbeddingKind::ExchangeSummary => "exchange_summary_vectors",
    }
}

/// Create the vec0 tables. Fails when the extension is not loaded.
pub(crate) fn ensure_schema(conn: &Connection, dimensions: usize) -> Result<()> {
    for kind in EmbeddingKind::ALL {
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING vec0(
                embedding float[{}] distance_metric=cosine
            );",
            vector_table(kind),
            dimensions
        ))
        .map_err(|e| Error::index_unavailable(e.to_string()))?;
    }
    Ok(())
}

/// Replace the index entry for one row (vec0 has no upsert)
pub(crate) fn upsert(conn: &Connection, kind: EmbeddingKind, row_id: i64, blob: &[u8]) -> Result<()> {
    let table = vector_table(kind);
    conn.execute(&format!("DELETE FROM {} WHERE rowid = ?1", table), params![row_id])?;
    conn.execute(
        &format!("INSERT INTO {}(rowid, embedding) VALUES (?1, ?2)", table),
        params![row_id, blob],
    )?;
    Ok(())
}

/// Drop the index entries for rows that are gone
pub(crate) fn remove(conn: &Connection, kind: EmbeddingKind, row_ids: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare_cached(&format!("DELETE FROM {} WHERE rowid = ?1", vector_table(kind)))?;
    for id in row_ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

pub(crate) fn clear(conn: &Connection, kind: EmbeddingKind) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", vector_table(kind)), [])?;
    Ok(())
}

/// Nearest rows by cosine distance, closest first
pub(crate) fn knn(conn: &Connection, kind: EmbeddingKind, query: &[u8], k: usize) -> Result<Vec<(i64, f64)>> {
    let run = || -> rusqlite::Result<Vec<(i64, f64)>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT rowid, distance FROM {} WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
            vector_table(kind)
        ))?;
        let rows = stmt.query_map(params![query, k as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    };
    run().map_err(|e| Error::index_unavailable(format!("KNN query on {} failed: {}", vector_table(kind), e)))
}

/// Bring the index in line with the embeddings table.
///
/// Rows written while the index was unavailable get indexed; index entries
/// whose embedding row was cascaded away get dropped.
pub(crate) fn reconcile(conn: &Connection, kind: EmbeddingKind) -> Result<(usize, usize)> {
    let table = vector_table(kind);

    let indexed: HashSet<i64> = {
        let mut stmt = conn.prepare(&format!("SELECT rowid FROM {}", table))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let stored: Vec<(i64, Vec<u8>)> = {
        let mut stmt = conn.prepare("SELECT id, embedding FROM embeddings WHERE kind = ?1")?;
        let rows = stmt.query_map(params![kind.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    let mut added = 0;
    let mut live = HashSet::with_capacity(stored.len());
    for (id, blob) in &stored {
        live.insert(*id);
        if !indexed.contains(id) {
            conn.execute(
                &format!("INSERT INTO {}(rowid, embedding) VALUES (?1, ?2)", table),
                params![id, blob],
            )?;
            added += 1;
        }
    }

    let mut pruned = 0;
    for id in indexed.difference(&live) {
        conn.execute(&format!("DELETE FROM {} WHERE rowid = ?1", table), params![id])?;
        pruned += 1;
    }

    if added > 0 || pruned > 0 {
        info!("Reconciled {} index: {} added, {} pruned", kind, added, pruned);
    }
    Ok((added, pruned))
}

/// Try to bring up the native index; false means linear scan from now on
pub(crate) fn init_index(conn: &Connection, dimensions: usize) -> bool {
    if let Err(e) = ensure_schema(conn, dimensions) {
        warn!("Vector index unavailable, falling back to linear scan: {}", e);
        return false;
    }

    for kind in EmbeddingKind::ALL {
        if let Err(e) = reconcile(conn, kind) {
            warn!("Vector index reconcile failed for {}, falling back to linear scan: {}", kind, e);
            return false;
        }
    }

    true
}

/// Convert f32 vector to little-endian bytes
pub(crate) fn to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0e-7, 42.0];
        assert_eq!(from_blob(&to_blob(&v)), v);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        // magnitude does not matter
        assert!((cosine_similarity(&[2.0, 2.0], &[1.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }
}
