//! Hybrid query engine — cosine ANN + BM25, fused with Reciprocal Rank
//! Fusion, recency-weighted, rescaled into a human-useful range.
//!
//! The vector index is queried alone and metadata is fetched in a second
//! statement: joining `chunks_vec` against `chunks` in one statement stalls
//! the vec0 index, so the MATCH-then-fetch split is a design rule here, not
//! an optimization. FTS5 has no such restriction, so the lexical side applies
//! the caller's filter inline via a join.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::embedding::EmbeddingClient;

/// RRF rank constant.
pub const RRF_K: usize = 60;
/// Per-list RRF weights: (vector, lexical).
const RRF_WEIGHTS: (f64, f64) = (1.0, 1.0);
/// Fetch breadth floor: at least this many candidates per list.
const MIN_FETCH_BREADTH: usize = 30;
/// Cross-list dedup key length, in characters of chunk text.
const DEDUP_KEY_CHARS: usize = 200;
/// Calibration multiplier bringing RRF scores into roughly [0.3, 1.0] on
/// representative corpora. Changes ordering of nothing.
const SCORE_RESCALE: f64 = 8.0;

/// Optional metadata filter applied to both retrieval sides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    pub agent_id: Option<String>,
    pub source_type: Option<String>,
}

/// One search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub role: String,
    pub source_type: String,
    pub source_id: Option<String>,
    pub agent_id: Option<String>,
    pub created_at: String,
    /// Fused, recency-weighted score in (0, 1].
    pub score: f64,
    /// Age bucket: `fresh` / `recent` / `aging` / `stale`.
    pub freshness: String,
}

/// Chunk metadata carried through fusion.
#[derive(Debug, Clone)]
struct ChunkMeta {
    id: i64,
    text: String,
    role: String,
    source_type: String,
    source_id: Option<String>,
    agent_id: Option<String>,
    created_at: String,
}

/// Embed the query and run the hybrid search.
pub async fn search(
    conn: &Connection,
    embedder: &dyn EmbeddingClient,
    query: &str,
    limit: usize,
    filter: &SearchFilter,
) -> Result<Vec<SearchHit>> {
    if crate::memory::count_chunks(conn)? == 0 {
        return Ok(Vec::new());
    }
    let query_vector = embedder.embed_one(query).await?;
    search_hybrid(conn, Some(&query_vector), query, limit, filter)
}

/// Hybrid search over an already-embedded query.
///
/// `query_vector = None` skips the vector side (lexical-only).
pub fn search_hybrid(
    conn: &Connection,
    query_vector: Option<&[f32]>,
    query: &str,
    limit: usize,
    filter: &SearchFilter,
) -> Result<Vec<SearchHit>> {
    if limit == 0 || crate::memory::count_chunks(conn)? == 0 {
        return Ok(Vec::new());
    }

    let breadth = (3 * limit).max(MIN_FETCH_BREADTH);

    // Vector side: MATCH first, metadata second. Never join.
    let vector_list = match query_vector {
        Some(qv) => {
            let pairs = vector_candidates(conn, qv, breadth)?;
            let metas = fetch_chunks(conn, &pairs.iter().map(|(id, _)| *id).collect::<Vec<_>>(), filter)?;
            let mut list = Vec::new();
            for (id, distance) in &pairs {
                if let Some(meta) = metas.get(id) {
                    tracing::debug!(id, score = 1.0 - distance, "vector candidate");
                    list.push(meta.clone());
                }
            }
            list
        }
        None => Vec::new(),
    };

    // Lexical side: BM25 with the filter inline.
    let lexical_list = match build_fts_expression(query) {
        Some(expr) => lexical_candidates(conn, &expr, breadth, filter)?,
        None => Vec::new(),
    };

    let now = Utc::now();
    let mut fused = fuse(&vector_list, &lexical_list);

    let mut hits: Vec<SearchHit> = fused
        .drain(..)
        .map(|entry| {
            let age = age_days(&entry.meta.created_at, now);
            let score = (entry.score() * recency_weight(age) * SCORE_RESCALE).min(1.0);
            SearchHit {
                text: entry.meta.text,
                role: entry.meta.role,
                source_type: entry.meta.source_type,
                source_id: entry.meta.source_id,
                agent_id: entry.meta.agent_id,
                created_at: entry.meta.created_at,
                score,
                freshness: freshness_label(age).to_string(),
            }
        })
        .collect();

    // Stable sort: ties keep insertion order
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

// ── Retrieval sides ───────────────────────────────────────────────────────────

/// Cosine KNN over the vec0 index. Returns `(chunk_id, cosine_distance)`.
///
/// This statement must not touch any other table.
fn vector_candidates(conn: &Connection, qv: &[f32], k: usize) -> Result<Vec<(i64, f64)>> {
    let table_exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='chunks_vec'",
        [],
        |row| row.get(0),
    )?;
    if table_exists == 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT chunk_id, distance FROM chunks_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(
            params![crate::memory::embedding_to_bytes(qv), k as i64],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Batch-fetch chunk metadata by id, applying the filter here (second
/// statement of the vector side).
fn fetch_chunks(
    conn: &Connection,
    ids: &[i64],
    filter: &SearchFilter,
) -> Result<HashMap<i64, ChunkMeta>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let mut sql = format!(
        "SELECT id, text, role, source_type, source_id, agent_id, created_at \
         FROM chunks WHERE id IN ({})",
        placeholders.join(", ")
    );

    let mut params_vec: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
    let mut next = ids.len() + 1;
    if let Some(agent) = &filter.agent_id {
        sql.push_str(&format!(" AND agent_id = ?{next}"));
        params_vec.push(agent as &dyn ToSql);
        next += 1;
    }
    if let Some(source_type) = &filter.source_type {
        sql.push_str(&format!(" AND source_type = ?{next}"));
        params_vec.push(source_type as &dyn ToSql);
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_vec.as_slice(), |row| {
            Ok(ChunkMeta {
                id: row.get(0)?,
                text: row.get(1)?,
                role: row.get(2)?,
                source_type: row.get(3)?,
                source_id: row.get(4)?,
                agent_id: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(|m| (m.id, m)).collect())
}

/// BM25 search with the filter inline, ordered best-first (`bm25()` is ≤ 0;
/// lower is better).
fn lexical_candidates(
    conn: &Connection,
    fts_expr: &str,
    k: usize,
    filter: &SearchFilter,
) -> Result<Vec<ChunkMeta>> {
    let mut sql = String::from(
        "SELECT c.id, c.text, c.role, c.source_type, c.source_id, c.agent_id, c.created_at, \
         bm25(chunks_fts) \
         FROM chunks_fts JOIN chunks c ON c.id = chunks_fts.rowid \
         WHERE chunks_fts MATCH ?1",
    );

    let mut params_vec: Vec<&dyn ToSql> = vec![&fts_expr as &dyn ToSql];
    let mut next = 2;
    if let Some(agent) = &filter.agent_id {
        sql.push_str(&format!(" AND c.agent_id = ?{next}"));
        params_vec.push(agent as &dyn ToSql);
        next += 1;
    }
    if let Some(source_type) = &filter.source_type {
        sql.push_str(&format!(" AND c.source_type = ?{next}"));
        params_vec.push(source_type as &dyn ToSql);
        next += 1;
    }
    let k = k as i64;
    sql.push_str(&format!(" ORDER BY bm25(chunks_fts) LIMIT ?{next}"));
    params_vec.push(&k as &dyn ToSql);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_vec.as_slice(), |row| {
            let bm25: f64 = row.get(7)?;
            Ok((
                ChunkMeta {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    role: row.get(2)?,
                    source_type: row.get(3)?,
                    source_id: row.get(4)?,
                    agent_id: row.get(5)?,
                    created_at: row.get(6)?,
                },
                bm25,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .map(|(meta, bm25)| {
            tracing::debug!(
                id = meta.id,
                score = bm25.abs() / (1.0 + bm25.abs()),
                "lexical candidate"
            );
            meta
        })
        .collect())
}

/// Build a safe FTS5 expression: keep Unicode letters/digits and apostrophes,
/// lowercase, wrap each term as a quoted prefix, join with AND. `None` when
/// nothing survives (the caller falls back to vector-only).
pub(crate) fn build_fts_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter_map(|word| {
            let clean: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '\'')
                .flat_map(char::to_lowercase)
                .collect();
            if clean.is_empty() {
                None
            } else {
                Some(format!("\"{clean}\"*"))
            }
        })
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

// ── Fusion ────────────────────────────────────────────────────────────────────

struct FusedEntry {
    meta: ChunkMeta,
    rrf: f64,
    best_rank: usize,
}

impl FusedEntry {
    /// RRF sum plus the top-rank bonus.
    fn score(&self) -> f64 {
        let bonus = if self.best_rank == 0 {
            0.05
        } else if self.best_rank <= 2 {
            0.02
        } else {
            0.0
        };
        self.rrf + bonus
    }
}

/// Reciprocal Rank Fusion across the two ranked lists.
///
/// Entries are deduplicated across lists by the first 200 characters of their
/// text; each keeps its best (minimum) rank for the bonus. Insertion order is
/// preserved so later stable sorting breaks ties deterministically.
fn fuse(vector_list: &[ChunkMeta], lexical_list: &[ChunkMeta]) -> Vec<FusedEntry> {
    let mut entries: Vec<FusedEntry> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    let lists: [(&[ChunkMeta], f64); 2] = [
        (vector_list, RRF_WEIGHTS.0),
        (lexical_list, RRF_WEIGHTS.1),
    ];

    for (list, weight) in lists {
        for (rank, meta) in list.iter().enumerate() {
            let contribution = weight / (RRF_K as f64 + rank as f64 + 1.0);
            let key = dedup_key(&meta.text);
            match by_key.get(&key) {
                Some(&idx) => {
                    entries[idx].rrf += contribution;
                    entries[idx].best_rank = entries[idx].best_rank.min(rank);
                }
                None => {
                    by_key.insert(key, entries.len());
                    entries.push(FusedEntry {
                        meta: meta.clone(),
                        rrf: contribution,
                        best_rank: rank,
                    });
                }
            }
        }
    }

    entries
}

/// Cross-list identity is the first 200 characters of text; used only as the
/// dedup key.
fn dedup_key(text: &str) -> String {
    text.chars().take(DEDUP_KEY_CHARS).collect()
}

// ── Recency ───────────────────────────────────────────────────────────────────

fn age_days(created_at: &str, now: DateTime<Utc>) -> f64 {
    match DateTime::parse_from_rfc3339(created_at) {
        Ok(ts) => {
            let secs = (now - ts.with_timezone(&Utc)).num_seconds();
            (secs.max(0) as f64) / 86_400.0
        }
        Err(_) => 0.0,
    }
}

/// Recency multiplier: loses 1% per day, floored at 0.5.
fn recency_weight(age_days: f64) -> f64 {
    (1.0 - age_days * 0.01).max(0.5)
}

/// Age bucket labels at 3/7/14-day thresholds.
fn freshness_label(age_days: f64) -> &'static str {
    if age_days < 3.0 {
        "fresh"
    } else if age_days < 7.0 {
        "recent"
    } else if age_days < 14.0 {
        "aging"
    } else {
        "stale"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: i64, text: &str) -> ChunkMeta {
        ChunkMeta {
            id,
            text: text.to_string(),
            role: "user".into(),
            source_type: "conversation".into(),
            source_id: None,
            agent_id: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn fts_expression_strips_and_prefixes() {
        assert_eq!(
            build_fts_expression("hello world").as_deref(),
            Some("\"hello\"* AND \"world\"*")
        );
        assert_eq!(
            build_fts_expression("Can't-Stop").as_deref(),
            Some("\"can'tstop\"*")
        );
        assert_eq!(build_fts_expression("!!! ???"), None);
        assert_eq!(build_fts_expression(""), None);
    }

    #[test]
    fn fused_scores_stay_within_bound() {
        // Same item at rank 0 of both lists: 2·(1/(k+1)) + 0.05 is the max
        let list = vec![meta(1, "shared text")];
        let fused = fuse(&list, &list);
        assert_eq!(fused.len(), 1);
        let bound = 2.0 * (1.0 / (RRF_K as f64 + 1.0)) + 0.05;
        assert!(fused[0].score() <= bound + 1e-12);
        assert!((fused[0].score() - bound).abs() < 1e-12);
    }

    #[test]
    fn fusion_dedups_by_text_prefix() {
        // Same first 200 chars, different tails → one fused entry
        let a = meta(1, &"z".repeat(250));
        let b = meta(2, &format!("{}{}", "z".repeat(200), "different tail"));

        let fused = fuse(&[a], &[b]);
        assert_eq!(fused.len(), 1);
        assert!(fused[0].rrf > 1.0 / (RRF_K as f64 + 1.0));
    }

    #[test]
    fn top_rank_bonus_tiers() {
        let list: Vec<ChunkMeta> = (0..5).map(|i| meta(i, &format!("text {i}"))).collect();
        let fused = fuse(&list, &[]);
        let base: Vec<f64> = (0..5)
            .map(|r| 1.0 / (RRF_K as f64 + r as f64 + 1.0))
            .collect();
        assert!((fused[0].score() - (base[0] + 0.05)).abs() < 1e-12);
        assert!((fused[1].score() - (base[1] + 0.02)).abs() < 1e-12);
        assert!((fused[2].score() - (base[2] + 0.02)).abs() < 1e-12);
        assert!((fused[3].score() - base[3]).abs() < 1e-12);
    }

    #[test]
    fn recency_weight_is_monotonic_and_floored() {
        assert_eq!(recency_weight(0.0), 1.0);
        assert!(recency_weight(10.0) > recency_weight(20.0));
        assert!((recency_weight(10.0) - 0.9).abs() < 1e-12);
        assert_eq!(recency_weight(80.0), 0.5);
        assert_eq!(recency_weight(800.0), 0.5);
    }

    #[test]
    fn freshness_buckets_at_exact_thresholds() {
        assert_eq!(freshness_label(0.0), "fresh");
        assert_eq!(freshness_label(2.99), "fresh");
        assert_eq!(freshness_label(3.0), "recent");
        assert_eq!(freshness_label(6.99), "recent");
        assert_eq!(freshness_label(7.0), "aging");
        assert_eq!(freshness_label(13.99), "aging");
        assert_eq!(freshness_label(14.0), "stale");
        assert_eq!(freshness_label(100.0), "stale");
    }

    #[test]
    fn age_days_handles_unparseable_timestamps() {
        let now = Utc::now();
        assert_eq!(age_days("not a timestamp", now), 0.0);
        assert!(age_days("2020-01-01T00:00:00Z", now) > 1000.0);
    }

    #[test]
    fn older_results_never_outrank_fresher_with_same_rrf() {
        // Hold the fused score constant and vary only age
        let now = Utc::now();
        let fresh_age = age_days(&(now - chrono::Duration::days(1)).to_rfc3339(), now);
        let stale_age = age_days(&(now - chrono::Duration::days(30)).to_rfc3339(), now);
        let rrf = 0.05;
        assert!(rrf * recency_weight(fresh_age) > rrf * recency_weight(stale_age));
    }
}
