//! Source-collection indexing — named directories whose files are chunked
//! and ingested, with hash-based change detection.
//!
//! The include/ignore glob lists are pre-parsed into plain extension and
//! basename sets so the walk makes set-lookup decisions instead of matching
//! globs per entry. Only the restricted pattern forms the collection schema
//! allows are recognized: `**/*<.ext>`, `**/<name>`, and `**/<name>/**`.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use walkdir::WalkDir;

use crate::chunker;
use crate::crypto::sha256_hex;
use crate::embedding::EmbeddingClient;
use crate::memory::ingest;
use crate::memory::types::{CandidateChunk, Role};

/// Files above this size are treated as data/generated and skipped.
const MAX_FILE_BYTES: u64 = 500 * 1024;
/// Files re-indexed per embed/ingest batch.
const FILE_BATCH_SIZE: usize = 20;

/// A named directory under ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub root_path: String,
    pub include_globs: Vec<String>,
    pub ignore_globs: Vec<String>,
    pub file_count: i64,
    pub chunk_count: i64,
    pub last_sync: Option<String>,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub chunks_indexed: usize,
    pub dry_run: bool,
}

/// Register a collection. The root must be an absolute path.
pub fn add_collection(
    conn: &Connection,
    name: &str,
    root: &Path,
    include_globs: &[String],
    ignore_globs: &[String],
) -> Result<i64> {
    anyhow::ensure!(root.is_absolute(), "collection root must be absolute: {}", root.display());

    conn.execute(
        "INSERT INTO source_collections (name, root_path, include_globs, ignore_globs) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            name,
            root.display().to_string(),
            serde_json::to_string(include_globs)?,
            serde_json::to_string(ignore_globs)?,
        ],
    )
    .with_context(|| format!("failed to register collection {name}"))?;

    Ok(conn.last_insert_rowid())
}

/// List all registered collections.
pub fn list_collections(conn: &Connection) -> Result<Vec<Collection>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, root_path, include_globs, ignore_globs, file_count, chunk_count, last_sync \
         FROM source_collections ORDER BY name",
    )?;
    let rows = stmt
        .query_map([], row_to_collection)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Fetch one collection by name.
pub fn get_collection(conn: &Connection, name: &str) -> Result<Option<Collection>> {
    let row = conn
        .query_row(
            "SELECT id, name, root_path, include_globs, ignore_globs, file_count, chunk_count, last_sync \
             FROM source_collections WHERE name = ?1",
            params![name],
            row_to_collection,
        )
        .optional()?;
    Ok(row)
}

fn row_to_collection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    let include: String = row.get(3)?;
    let ignore: String = row.get(4)?;
    Ok(Collection {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: row.get(2)?,
        include_globs: serde_json::from_str(&include).unwrap_or_default(),
        ignore_globs: serde_json::from_str(&ignore).unwrap_or_default(),
        file_count: row.get(5)?,
        chunk_count: row.get(6)?,
        last_sync: row.get(7)?,
    })
}

// ── Filters ───────────────────────────────────────────────────────────────────

/// Allow/ignore decision sets pre-parsed from the collection's glob lists.
#[derive(Debug, Default)]
struct FileFilter {
    include_suffixes: Vec<String>,
    include_names: HashSet<String>,
    ignore_dirs: HashSet<String>,
    ignore_suffixes: Vec<String>,
    ignore_names: HashSet<String>,
}

impl FileFilter {
    fn from_globs(include: &[String], ignore: &[String]) -> Self {
        let mut filter = Self::default();

        for pattern in include {
            if let Some(suffix) = pattern.strip_prefix("**/*") {
                if suffix.starts_with('.') {
                    filter.include_suffixes.push(suffix.to_string());
                }
            } else if let Some(name) = pattern.strip_prefix("**/") {
                if !name.contains('*') && !name.contains('/') {
                    filter.include_names.insert(name.to_string());
                }
            }
        }

        for pattern in ignore {
            if let Some(dir) = pattern
                .strip_prefix("**/")
                .and_then(|rest| rest.strip_suffix("/**"))
            {
                if !dir.contains('*') && !dir.contains('/') {
                    filter.ignore_dirs.insert(dir.to_string());
                    continue;
                }
            }
            if let Some(suffix) = pattern.strip_prefix("**/*") {
                if suffix.starts_with('.') {
                    filter.ignore_suffixes.push(suffix.to_string());
                    continue;
                }
            }
            if let Some(name) = pattern.strip_prefix("**/") {
                if !name.contains('*') && !name.contains('/') {
                    filter.ignore_names.insert(name.to_string());
                }
            }
        }

        filter
    }

    /// Directories pruned from the walk: ignored names and hidden dirs.
    fn prunes_dir(&self, basename: &str) -> bool {
        basename.starts_with('.') || self.ignore_dirs.contains(basename)
    }

    fn allows_file(&self, basename: &str) -> bool {
        if self.ignore_names.contains(basename)
            || self.ignore_suffixes.iter().any(|s| basename.ends_with(s.as_str()))
        {
            return false;
        }
        if self.include_suffixes.is_empty() && self.include_names.is_empty() {
            return true;
        }
        self.include_names.contains(basename)
            || self.include_suffixes.iter().any(|s| basename.ends_with(s.as_str()))
    }
}

// ── Sync ──────────────────────────────────────────────────────────────────────

/// Walk a collection's root and bring the store up to date with disk.
///
/// Unchanged files (same content hash) do no work. New and changed files are
/// chunked with a `File: <relpath>` header and ingested in batches of 20
/// files. Files whose rows exist but are gone from disk lose their row —
/// their chunks stay in the store. Dry-run computes the same counts without
/// embedding or writing anything.
pub async fn sync_collection(
    conn: &mut Connection,
    embedder: &dyn EmbeddingClient,
    name: &str,
    dry_run: bool,
) -> Result<SyncReport> {
    let Some(collection) = get_collection(conn, name)? else {
        bail!("unknown collection: {name}");
    };

    let root = Path::new(&collection.root_path);
    if !root.exists() {
        bail!("collection root does not exist: {}", collection.root_path);
    }

    let filter = FileFilter::from_globs(&collection.include_globs, &collection.ignore_globs);

    // Stored view of the collection, for change detection
    let mut stored: HashMap<String, String> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT rel_path, file_hash FROM source_files WHERE collection_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![collection.id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        stored.extend(rows);
    }

    let mut report = SyncReport {
        dry_run,
        ..Default::default()
    };
    let mut seen: HashSet<String> = HashSet::new();
    // (rel_path, content, hash, size) for files needing (re)indexing
    let mut pending: Vec<(String, String, String, u64)> = Vec::new();

    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let basename = entry.file_name().to_string_lossy();
            !filter.prunes_dir(&basename)
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let basename = entry.file_name().to_string_lossy();
        if !filter.allows_file(&basename) {
            continue;
        }

        let size = entry.metadata()?.len();
        if size > MAX_FILE_BYTES {
            tracing::debug!(path = %entry.path().display(), size, "skipping oversized file");
            continue;
        }

        let content = match std::fs::read_to_string(entry.path()) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                continue;
            }
        };

        let rel_path = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        seen.insert(rel_path.clone());

        let hash = sha256_hex(content.as_bytes());
        match stored.get(&rel_path) {
            Some(existing) if existing == &hash => report.unchanged += 1,
            Some(_) => {
                report.updated += 1;
                pending.push((rel_path, content, hash, size));
            }
            None => {
                report.added += 1;
                pending.push((rel_path, content, hash, size));
            }
        }
    }

    let removed: Vec<String> = stored
        .keys()
        .filter(|rel| !seen.contains(*rel))
        .cloned()
        .collect();
    report.removed = removed.len();

    if dry_run {
        tracing::info!(
            collection = name,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            "dry run complete"
        );
        return Ok(report);
    }

    // Remove rows for files gone from disk; their chunks stay
    for rel_path in &removed {
        conn.execute(
            "DELETE FROM source_files WHERE collection_id = ?1 AND rel_path = ?2",
            params![collection.id, rel_path],
        )?;
    }

    for batch in pending.chunks(FILE_BATCH_SIZE) {
        let mut candidates = Vec::new();
        let mut per_file_chunks: Vec<(String, String, u64, usize)> = Vec::new();

        for (rel_path, content, hash, size) in batch {
            let headed = format!("File: {rel_path}\n\n{content}");
            let pieces = chunker::chunk_default(&headed);
            let count = pieces.len();
            for piece in pieces {
                candidates.push(CandidateChunk {
                    text: piece,
                    role: Role::System,
                    source_type: "file".into(),
                    source_id: Some(format!("file:{name}:{rel_path}")),
                    agent_id: Some("system".into()),
                    created_at: None,
                });
            }
            per_file_chunks.push((rel_path.clone(), hash.clone(), *size, count));
        }

        let outcome = ingest::ingest_chunks(conn, embedder, candidates).await?;
        report.chunks_indexed += outcome.inserted;

        let now = chrono::Utc::now().to_rfc3339();
        for (rel_path, hash, size, chunk_count) in per_file_chunks {
            conn.execute(
                "INSERT INTO source_files (collection_id, rel_path, file_hash, file_size, chunk_count, indexed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(collection_id, rel_path) DO UPDATE SET \
                     file_hash = excluded.file_hash, \
                     file_size = excluded.file_size, \
                     chunk_count = excluded.chunk_count, \
                     indexed_at = excluded.indexed_at",
                params![collection.id, rel_path, hash, size as i64, chunk_count as i64, now],
            )?;
        }
    }

    // Refresh the cached counters
    let file_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM source_files WHERE collection_id = ?1",
        params![collection.id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE source_collections SET file_count = ?1, \
         chunk_count = chunk_count + ?2, last_sync = ?3 WHERE id = ?4",
        params![
            file_count,
            report.chunks_indexed as i64,
            chrono::Utc::now().to_rfc3339(),
            collection.id
        ],
    )?;

    tracing::info!(
        collection = name,
        added = report.added,
        updated = report.updated,
        removed = report.removed,
        unchanged = report.unchanged,
        chunks = report.chunks_indexed,
        "sync complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globs(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn filter_parses_include_extensions_and_names() {
        let filter = FileFilter::from_globs(
            &globs(&["**/*.rs", "**/*.md", "**/Makefile"]),
            &[],
        );
        assert!(filter.allows_file("main.rs"));
        assert!(filter.allows_file("README.md"));
        assert!(filter.allows_file("Makefile"));
        assert!(!filter.allows_file("image.png"));
    }

    #[test]
    fn filter_parses_ignore_dirs_exts_and_names() {
        let filter = FileFilter::from_globs(
            &globs(&["**/*.rs"]),
            &globs(&["**/node_modules/**", "**/*.lock", "**/generated.rs"]),
        );
        assert!(filter.prunes_dir("node_modules"));
        assert!(!filter.prunes_dir("src"));
        assert!(!filter.allows_file("Cargo.lock"));
        assert!(!filter.allows_file("generated.rs"));
        assert!(filter.allows_file("main.rs"));
    }

    #[test]
    fn hidden_directories_are_always_pruned() {
        let filter = FileFilter::from_globs(&[], &[]);
        assert!(filter.prunes_dir(".git"));
        assert!(filter.prunes_dir(".cache"));
        assert!(!filter.prunes_dir("src"));
    }

    #[test]
    fn empty_include_list_allows_everything_not_ignored() {
        let filter = FileFilter::from_globs(&[], &globs(&["**/*.bin"]));
        assert!(filter.allows_file("notes.txt"));
        assert!(!filter.allows_file("dump.bin"));
    }
}
