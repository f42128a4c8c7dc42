//! Write path — deduplication, embedding, and transactional dual writes.
//!
//! [`ingest_chunks`] is the single entry point: hash every candidate, skip
//! the ones the store already holds, embed the survivors in one call, then
//! insert chunk rows and vector rows inside one transaction (the FTS index
//! follows via the insert trigger). Any error inside the transaction aborts
//! the entire batch; embedding failure aborts before any write.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::time::Duration;

use crate::chunker::estimate_tokens;
use crate::crypto::sha256_hex;
use crate::db::{migrations, schema};
use crate::embedding::EmbeddingClient;
use crate::memory::types::CandidateChunk;

/// Batch ceiling for capture flows.
pub const CAPTURE_BATCH_SIZE: usize = 200;

const MAX_ATTEMPTS: u32 = 4;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Result of an ingest call.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct IngestOutcome {
    /// Chunks written to the store.
    pub inserted: usize,
    /// Candidates skipped because their hash already existed.
    pub deduplicated: usize,
}

/// Full pipeline: dedup → embed once → transactional dual write.
pub async fn ingest_chunks(
    conn: &mut Connection,
    embedder: &dyn EmbeddingClient,
    candidates: Vec<CandidateChunk>,
) -> Result<IngestOutcome> {
    let (survivors, deduplicated) = dedup_survivors(conn, candidates)?;
    if survivors.is_empty() {
        return Ok(IngestOutcome {
            inserted: 0,
            deduplicated,
        });
    }

    let texts: Vec<String> = survivors.iter().map(|(c, _)| c.text.clone()).collect();
    let vectors = embedder.embed(&texts).await?;

    let inserted = write_survivors(conn, &survivors, &vectors, &embedder.provider_label())?;

    tracing::info!(inserted, deduplicated, "ingest batch committed");
    Ok(IngestOutcome {
        inserted,
        deduplicated,
    })
}

/// Ingest with bounded retry, for capture flows: batches of at most
/// [`CAPTURE_BATCH_SIZE`], each retried up to 4 times with exponential
/// backoff capped at 30 seconds.
pub async fn ingest_with_retry(
    conn: &mut Connection,
    embedder: &dyn EmbeddingClient,
    candidates: Vec<CandidateChunk>,
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();

    for batch in candidates.chunks(CAPTURE_BATCH_SIZE) {
        let mut attempt = 1;
        loop {
            match ingest_chunks(conn, embedder, batch.to_vec()).await {
                Ok(partial) => {
                    outcome.inserted += partial.inserted;
                    outcome.deduplicated += partial.deduplicated;
                    break;
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_secs(1 << (attempt - 1)).min(MAX_BACKOFF);
                    tracing::warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "ingest batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(outcome)
}

/// Hash every candidate and drop the ones whose hash already exists, either
/// in the store or earlier in the same batch. Returns `(survivors_with_hash,
/// deduplicated_count)`.
pub fn dedup_survivors(
    conn: &Connection,
    candidates: Vec<CandidateChunk>,
) -> Result<(Vec<(CandidateChunk, String)>, usize)> {
    let mut survivors = Vec::with_capacity(candidates.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut deduplicated = 0usize;

    let mut stmt = conn.prepare("SELECT 1 FROM chunks WHERE text_hash = ?1")?;

    for candidate in candidates {
        let hash = sha256_hex(candidate.text.as_bytes());
        if seen.contains(&hash) {
            deduplicated += 1;
            continue;
        }
        let exists: Option<i64> = stmt.query_row(params![hash], |row| row.get(0)).optional()?;
        if exists.is_some() {
            deduplicated += 1;
            continue;
        }
        seen.insert(hash.clone());
        survivors.push((candidate, hash));
    }

    Ok((survivors, deduplicated))
}

/// Insert survivors and their vectors in one transaction.
///
/// The store's dimensionality is fixed here on first use; a batch whose
/// vectors disagree with the stored dimension fails without any write.
pub fn write_survivors(
    conn: &mut Connection,
    survivors: &[(CandidateChunk, String)],
    vectors: &[Vec<f32>],
    provider_label: &str,
) -> Result<usize> {
    if survivors.is_empty() {
        return Ok(0);
    }
    if survivors.len() != vectors.len() {
        bail!(
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            survivors.len()
        );
    }

    let dim = vectors[0].len();
    if dim == 0 {
        bail!("embedder returned an empty vector");
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
        bail!(
            "inconsistent embedding dimensions in batch: {} vs {}",
            bad.len(),
            dim
        );
    }

    match schema::vector_dim(conn)? {
        Some(stored) if stored != dim => {
            bail!("embedding dimension {dim} does not match stored dimension {stored}");
        }
        Some(_) => {}
        None => {
            schema::ensure_vec_table(conn, dim)?;
            migrations::set_embedding_provider(conn, provider_label)?;
            tracing::info!(dim, provider = provider_label, "vector dimension fixed");
        }
    }

    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.transaction()?;

    for ((candidate, hash), vector) in survivors.iter().zip(vectors) {
        tx.execute(
            "INSERT INTO chunks (text, text_hash, role, source_type, source_id, agent_id, token_estimate, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                candidate.text,
                hash,
                candidate.role.as_str(),
                candidate.source_type,
                candidate.source_id,
                candidate.agent_id,
                estimate_tokens(&candidate.text) as i64,
                candidate.created_at.as_deref().unwrap_or(&now),
            ],
        )?;
        let chunk_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO chunks_vec (chunk_id, embedding) VALUES (?1, ?2)",
            params![chunk_id, crate::memory::embedding_to_bytes(vector)],
        )?;
    }

    tx.commit()?;
    Ok(survivors.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Role;

    fn test_db() -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        conn
    }

    fn candidate(text: &str) -> CandidateChunk {
        CandidateChunk::new(text, Role::User)
    }

    fn spike(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[at % dim] = 1.0;
        v
    }

    #[test]
    fn write_creates_chunk_vec_and_fts_rows() {
        let mut conn = test_db();
        let survivors = vec![(candidate("hybrid retrieval works"), "h1".to_string())];
        let inserted = write_survivors(&mut conn, &survivors, &[spike(8, 0)], "test/stub").unwrap();
        assert_eq!(inserted, 1);

        let chunks: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
            .unwrap();
        let vecs: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks_vec", [], |r| r.get(0))
            .unwrap();
        let fts: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!((chunks, vecs, fts), (1, 1, 1));
    }

    #[test]
    fn dedup_skips_existing_and_in_batch_duplicates() {
        let mut conn = test_db();
        let survivors = vec![(candidate("already stored"), sha256_hex(b"already stored"))];
        write_survivors(&mut conn, &survivors, &[spike(8, 0)], "test/stub").unwrap();

        let (fresh, deduplicated) = dedup_survivors(
            &conn,
            vec![
                candidate("already stored"),
                candidate("new text"),
                candidate("new text"),
            ],
        )
        .unwrap();

        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].0.text, "new text");
        assert_eq!(deduplicated, 2);
    }

    #[test]
    fn dimension_mismatch_aborts_without_partial_write() {
        let mut conn = test_db();
        write_survivors(
            &mut conn,
            &[(candidate("first"), "h1".to_string())],
            &[spike(8, 0)],
            "test/stub",
        )
        .unwrap();

        let err = write_survivors(
            &mut conn,
            &[(candidate("second"), "h2".to_string())],
            &[spike(16, 0)],
            "test/stub",
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not match stored dimension"));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn mixed_dimensions_in_one_batch_fail() {
        let mut conn = test_db();
        let err = write_survivors(
            &mut conn,
            &[
                (candidate("a"), "ha".to_string()),
                (candidate("b"), "hb".to_string()),
            ],
            &[spike(8, 0), spike(4, 0)],
            "test/stub",
        )
        .unwrap_err();
        assert!(err.to_string().contains("inconsistent embedding dimensions"));
    }

    #[test]
    fn first_write_records_provider() {
        let mut conn = test_db();
        write_survivors(
            &mut conn,
            &[(candidate("first"), "h1".to_string())],
            &[spike(8, 0)],
            "openai/text-embedding-3-small",
        )
        .unwrap();

        assert_eq!(
            migrations::get_embedding_provider(&conn).unwrap().as_deref(),
            Some("openai/text-embedding-3-small")
        );
    }
}
