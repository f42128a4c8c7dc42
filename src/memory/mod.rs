//! Core memory engine — ingestion, hybrid search, explicit memories,
//! capture state, and status.
//!
//! The write path lives in [`ingest`], the read path in [`search`], explicit
//! facts in [`remember`], hook-based capture progress in [`capture`], and
//! read-only counters in [`status`]. Shared type definitions live in
//! [`types`].

pub mod capture;
pub mod ingest;
pub mod remember;
pub mod search;
pub mod status;
pub mod types;

use anyhow::Result;
use rusqlite::Connection;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Total number of chunks in the store.
pub fn count_chunks(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?)
}
