//! Explicit facts — remember and forget.
//!
//! A remembered fact gets its own `memories` row plus a mirror chunk
//! (`source_type="manual"`, `source_id="memory:{id}"`) run through the normal
//! ingestion pipeline, so the fact participates in hybrid search like any
//! other text. Forgetting is logical: the status flips to `deprecated` and
//! the mirror chunk stays retrievable.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::embedding::EmbeddingClient;
use crate::memory::ingest;
use crate::memory::types::{CandidateChunk, MemoryCategory, MemoryRecord, MemoryStatus, Role};

/// Store an explicit fact and make it searchable.
///
/// Returns the new memory id. `source_chunk_ids` records which chunks the
/// fact was distilled from, if any.
pub async fn remember(
    conn: &mut Connection,
    embedder: &dyn EmbeddingClient,
    text: &str,
    category: MemoryCategory,
    source_chunk_ids: &[i64],
) -> Result<i64> {
    anyhow::ensure!(!text.trim().is_empty(), "memory text must not be empty");

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO memories (text, category, confidence, source_chunk_ids, status, created_at, updated_at) \
         VALUES (?1, ?2, 1.0, ?3, 'active', ?4, ?4)",
        params![
            text,
            category.as_str(),
            serde_json::to_string(source_chunk_ids)?,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();

    let mirror = CandidateChunk {
        text: text.to_string(),
        role: Role::System,
        source_type: "manual".into(),
        source_id: Some(format!("memory:{id}")),
        agent_id: Some("system".into()),
        created_at: None,
    };
    let outcome = ingest::ingest_chunks(conn, embedder, vec![mirror]).await?;

    tracing::info!(
        id,
        category = %category,
        mirrored = outcome.inserted > 0,
        "memory stored"
    );
    Ok(id)
}

/// Deprecate an explicit fact.
///
/// Conditional `active → deprecated` with a fresh updated-at. Returns whether
/// any row changed; the memory row and its mirror chunk both survive.
pub fn forget(conn: &Connection, id: i64) -> Result<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE memories SET status = 'deprecated', updated_at = ?1 \
         WHERE id = ?2 AND status = 'active'",
        params![now, id],
    )?;

    if changed > 0 {
        tracing::info!(id, "memory deprecated");
    }
    Ok(changed > 0)
}

/// Fetch one memory record by id.
pub fn get_memory(conn: &Connection, id: i64) -> Result<Option<MemoryRecord>> {
    let row = conn
        .query_row(
            "SELECT id, text, category, confidence, source_chunk_ids, status, created_at, updated_at \
             FROM memories WHERE id = ?1",
            params![id],
            |row| {
                let category: String = row.get(2)?;
                let source_ids: String = row.get(4)?;
                let status: String = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    category,
                    row.get::<_, f64>(3)?,
                    source_ids,
                    status,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((id, text, category, confidence, source_ids, status, created_at, updated_at)) = row
    else {
        return Ok(None);
    };

    Ok(Some(MemoryRecord {
        id,
        text,
        category: category
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?,
        confidence,
        source_chunk_ids: serde_json::from_str(&source_ids).unwrap_or_default(),
        status: match status.as_str() {
            "active" => MemoryStatus::Active,
            "deprecated" => MemoryStatus::Deprecated,
            _ => MemoryStatus::Deleted,
        },
        created_at,
        updated_at,
    }))
}

/// Count memories with status `active`.
pub fn count_active(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE status = 'active'",
        [],
        |row| row.get(0),
    )?)
}
