//! Read-only status counters over the store.

use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Snapshot of the store for status displays.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub chunk_count: i64,
    pub active_memories: i64,
    pub source_files: i64,
    /// Distinct agent ids across chunks and capture state.
    pub agents: Vec<String>,
    pub oldest_chunk: Option<String>,
    pub newest_chunk: Option<String>,
    pub captured_sessions: i64,
    pub last_capture: Option<String>,
    pub embedding_provider: String,
    pub data_dir: String,
}

/// Compute the status snapshot.
pub fn status_snapshot(
    conn: &Connection,
    provider_label: &str,
    data_dir: &Path,
) -> Result<StatusSnapshot> {
    let chunk_count = crate::memory::count_chunks(conn)?;
    let active_memories = crate::memory::remember::count_active(conn)?;

    let source_files: i64 =
        conn.query_row("SELECT COUNT(*) FROM source_files", [], |row| row.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT DISTINCT agent_id FROM chunks WHERE agent_id IS NOT NULL \
         UNION SELECT DISTINCT agent_id FROM capture_state \
         ORDER BY 1",
    )?;
    let agents: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let (oldest_chunk, newest_chunk): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM chunks",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let (captured_sessions, last_capture): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MAX(last_capture) FROM capture_state",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(StatusSnapshot {
        chunk_count,
        active_memories,
        source_files,
        agents,
        oldest_chunk,
        newest_chunk,
        captured_sessions,
        last_capture,
        embedding_provider: provider_label.to_string(),
        data_dir: data_dir.display().to_string(),
    })
}
