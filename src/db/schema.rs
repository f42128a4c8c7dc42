//! SQL DDL for all Memory Crystal tables.
//!
//! Defines `chunks`, `chunks_fts` (FTS5, populated by trigger), `memories`,
//! `source_collections`, `source_files`, `capture_state`, and `schema_meta`.
//! All DDL uses `IF NOT EXISTS` for idempotent initialization. The `chunks_vec`
//! vec0 table is created lazily at first ingest because its dimensionality is
//! fixed in the DDL and discovered from the embedder.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

/// All schema DDL statements for the core tables.
const SCHEMA_SQL: &str = r#"
-- Immutable text units
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    text_hash TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL CHECK(role IN ('user','assistant','system')),
    source_type TEXT NOT NULL DEFAULT 'conversation',
    source_id TEXT,
    agent_id TEXT,
    token_estimate INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_agent ON chunks(agent_id);
CREATE INDEX IF NOT EXISTS idx_chunks_source_type ON chunks(source_type);
CREATE INDEX IF NOT EXISTS idx_chunks_created ON chunks(created_at);

-- Full-text search (BM25, Porter stemming over Unicode letters/digits)
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    content='chunks',
    content_rowid='id',
    tokenize='porter unicode61'
);

-- The FTS index is populated by a post-insert trigger on the chunk row,
-- so a chunk row and its FTS row always commit together.
CREATE TRIGGER IF NOT EXISTS chunks_fts_after_insert AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
END;

-- Explicit facts, mirrored into chunks so search reaches them
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    category TEXT NOT NULL CHECK(category IN ('fact','preference','event','opinion','skill')),
    confidence REAL NOT NULL DEFAULT 1.0 CHECK(confidence >= 0.0 AND confidence <= 1.0),
    source_chunk_ids TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','deprecated','deleted')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);

-- Named directories under ingestion
CREATE TABLE IF NOT EXISTS source_collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    root_path TEXT NOT NULL,
    include_globs TEXT NOT NULL DEFAULT '[]',
    ignore_globs TEXT NOT NULL DEFAULT '[]',
    file_count INTEGER NOT NULL DEFAULT 0,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    last_sync TEXT
);

-- One row per indexed file within a collection
CREATE TABLE IF NOT EXISTS source_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_id INTEGER NOT NULL REFERENCES source_collections(id) ON DELETE CASCADE,
    rel_path TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    indexed_at TEXT NOT NULL,
    UNIQUE(collection_id, rel_path)
);

-- Per (agent, source) capture progress for hook-based captures
CREATE TABLE IF NOT EXISTS capture_state (
    agent_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    capture_cycles INTEGER NOT NULL DEFAULT 0,
    last_capture TEXT,
    PRIMARY KEY (agent_id, source_id)
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

/// Create the vec0 virtual table with the given dimensionality.
///
/// Called once, at the first ingest, when the embedder's output length is
/// known. `distance_metric=cosine` makes `distance` in KNN queries the cosine
/// distance directly.
pub fn ensure_vec_table(conn: &Connection, dim: usize) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(
            chunk_id INTEGER PRIMARY KEY,
            embedding FLOAT[{dim}] distance_metric=cosine
        );"
    ))?;
    Ok(())
}

/// The store's fixed vector dimensionality, or `None` if no vector has been
/// stored yet.
///
/// Discovered by peeking at the first stored row's byte length ÷ 4; an empty
/// but existing vec table falls back to parsing its DDL.
pub fn vector_dim(conn: &Connection) -> Result<Option<usize>> {
    let table_sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'chunks_vec'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(table_sql) = table_sql else {
        return Ok(None);
    };

    let byte_len: Option<i64> = conn
        .query_row("SELECT length(embedding) FROM chunks_vec LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    if let Some(byte_len) = byte_len {
        return Ok(Some(byte_len as usize / 4));
    }

    Ok(parse_dim_from_ddl(&table_sql))
}

fn parse_dim_from_ddl(sql: &str) -> Option<usize> {
    let upper = sql.to_ascii_uppercase();
    let start = upper.find("FLOAT[")? + "FLOAT[".len();
    let rest = &sql[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn schema_creates_all_tables() {
        let conn = test_conn();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "chunks",
            "memories",
            "source_collections",
            "source_files",
            "capture_state",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = test_conn();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn vector_dim_absent_before_first_ingest() {
        let conn = test_conn();
        assert_eq!(vector_dim(&conn).unwrap(), None);
    }

    #[test]
    fn vector_dim_from_ddl_when_table_empty() {
        let conn = test_conn();
        ensure_vec_table(&conn, 768).unwrap();
        assert_eq!(vector_dim(&conn).unwrap(), Some(768));
    }

    #[test]
    fn vector_dim_from_first_row() {
        let conn = test_conn();
        ensure_vec_table(&conn, 4).unwrap();
        let v: Vec<f32> = vec![0.5, 0.5, 0.5, 0.5];
        let bytes = crate::memory::embedding_to_bytes(&v);
        conn.execute(
            "INSERT INTO chunks_vec (chunk_id, embedding) VALUES (1, ?1)",
            rusqlite::params![bytes],
        )
        .unwrap();
        assert_eq!(vector_dim(&conn).unwrap(), Some(4));
    }

    #[test]
    fn fts_trigger_indexes_inserted_chunks() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO chunks (text, text_hash, role, source_type, created_at) \
             VALUES ('the deployment went smoothly', 'h1', 'user', 'conversation', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        // Porter stemming: 'deploy' prefix reaches 'deployment'
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH '\"deploy\"*'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
