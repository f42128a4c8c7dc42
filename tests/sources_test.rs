mod helpers;

use helpers::{test_db, StubEmbedder};
use memory_crystal::sources::{add_collection, get_collection, list_collections, sync_collection};
use std::path::Path;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn seed_tree(root: &Path) {
    write(root, "README.md", "# Project\n\nNotes about the project.");
    write(root, "src/main.rs", "fn main() { println!(\"hi\"); }");
    write(root, "node_modules/pkg/index.md", "should never be seen");
    write(root, ".git/config", "[core]");
    write(root, "image.png", "not text anyway");
}

fn globs(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

#[tokio::test]
async fn dry_run_counts_without_writing() {
    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let dir = tempfile::tempdir().unwrap();
    seed_tree(dir.path());

    add_collection(
        &conn,
        "project",
        dir.path(),
        &globs(&["**/*.md", "**/*.rs"]),
        &globs(&["**/node_modules/**"]),
    )
    .unwrap();

    let report = sync_collection(&mut conn, &embedder, "project", true)
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.added, 2); // README.md + main.rs
    assert_eq!(report.updated, 0);
    assert_eq!(report.removed, 0);
    assert_eq!(report.chunks_indexed, 0);

    let chunks: i64 = conn
        .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
        .unwrap();
    assert_eq!(chunks, 0, "dry run must not write");

    let files: i64 = conn
        .query_row("SELECT COUNT(*) FROM source_files", [], |r| r.get(0))
        .unwrap();
    assert_eq!(files, 0);
}

#[tokio::test]
async fn sync_indexes_changed_files_and_drops_missing_rows() {
    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let dir = tempfile::tempdir().unwrap();
    seed_tree(dir.path());

    add_collection(
        &conn,
        "project",
        dir.path(),
        &globs(&["**/*.md", "**/*.rs"]),
        &globs(&["**/node_modules/**"]),
    )
    .unwrap();

    // First pass: everything is new
    let report = sync_collection(&mut conn, &embedder, "project", false)
        .await
        .unwrap();
    assert_eq!(report.added, 2);
    assert!(report.chunks_indexed >= 2);

    let (source_type, source_id): (String, String) = conn
        .query_row(
            "SELECT source_type, source_id FROM chunks WHERE source_id LIKE 'file:project:%' LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(source_type, "file");
    assert!(source_id.starts_with("file:project:"));

    // Second pass with nothing touched: all unchanged
    let report = sync_collection(&mut conn, &embedder, "project", false)
        .await
        .unwrap();
    assert_eq!(report.unchanged, 2);
    assert_eq!(report.added + report.updated + report.removed, 0);

    // Change one file
    write(dir.path(), "README.md", "# Project\n\nRewritten notes.");
    let report = sync_collection(&mut conn, &embedder, "project", false)
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 1);

    // Remove a file: the row goes, the chunks stay
    let chunks_before: i64 = conn
        .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
        .unwrap();
    std::fs::remove_file(dir.path().join("src/main.rs")).unwrap();

    let report = sync_collection(&mut conn, &embedder, "project", false)
        .await
        .unwrap();
    assert_eq!(report.removed, 1);

    let files: i64 = conn
        .query_row("SELECT COUNT(*) FROM source_files", [], |r| r.get(0))
        .unwrap();
    assert_eq!(files, 1);

    let chunks_after: i64 = conn
        .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
        .unwrap();
    assert_eq!(chunks_after, chunks_before, "removal keeps chunks in the store");
}

#[tokio::test]
async fn oversized_files_are_skipped() {
    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let dir = tempfile::tempdir().unwrap();

    write(dir.path(), "small.md", "fits fine");
    write(dir.path(), "big.md", &"x".repeat(600 * 1024));

    add_collection(&conn, "docs", dir.path(), &globs(&["**/*.md"]), &[]).unwrap();
    let report = sync_collection(&mut conn, &embedder, "docs", false)
        .await
        .unwrap();

    assert_eq!(report.added, 1);
    let files: i64 = conn
        .query_row("SELECT COUNT(*) FROM source_files", [], |r| r.get(0))
        .unwrap();
    assert_eq!(files, 1);
}

#[tokio::test]
async fn collection_counters_update_on_sync() {
    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.md", "alpha document");
    write(dir.path(), "b.md", "beta document");

    add_collection(&conn, "docs", dir.path(), &globs(&["**/*.md"]), &[]).unwrap();
    sync_collection(&mut conn, &embedder, "docs", false)
        .await
        .unwrap();

    let collection = get_collection(&conn, "docs").unwrap().unwrap();
    assert_eq!(collection.file_count, 2);
    assert!(collection.chunk_count >= 2);
    assert!(collection.last_sync.is_some());

    assert_eq!(list_collections(&conn).unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_collection_is_an_error() {
    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);

    let err = sync_collection(&mut conn, &embedder, "nope", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown collection"));
}
