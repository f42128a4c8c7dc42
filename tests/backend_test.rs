mod helpers;

use helpers::{test_db, StubEmbedder};
use memory_crystal::backend::{LocalBackend, MemoryBackend};
use memory_crystal::memory::search::SearchFilter;
use memory_crystal::memory::types::{CandidateChunk, MemoryCategory, Role};
use memory_crystal::private;
use std::sync::Arc;

fn local_backend(dir: &tempfile::TempDir) -> LocalBackend {
    LocalBackend::new(
        test_db(),
        Arc::new(StubEmbedder::new(8)),
        dir.path().to_path_buf(),
    )
}

#[tokio::test]
async fn facade_round_trip_over_the_local_store() {
    let dir = tempfile::tempdir().unwrap();
    let backend = local_backend(&dir);

    let outcome = backend
        .ingest(vec![CandidateChunk::new(
            "the staging cluster lives in eu-west",
            Role::Assistant,
        )])
        .await
        .unwrap();
    assert_eq!(outcome.inserted, 1);

    let id = backend
        .remember("Deploys happen on Thursdays", MemoryCategory::Fact)
        .await
        .unwrap()
        .expect("gate is open");

    let hits = backend
        .search("staging cluster", 5, &SearchFilter::default())
        .await
        .unwrap();
    assert!(!hits.is_empty());

    assert!(backend.forget(id).await.unwrap());
    assert!(!backend.forget(id).await.unwrap());

    let status = backend.status().await.unwrap();
    assert_eq!(status.chunk_count, 2); // ingested chunk + memory mirror
    assert_eq!(status.active_memories, 0); // the one memory was forgotten
    assert_eq!(status.embedding_provider, "stub/test");
}

#[tokio::test]
async fn closed_gate_turns_writes_into_no_ops_but_not_search() {
    let dir = tempfile::tempdir().unwrap();
    let backend = local_backend(&dir);

    backend
        .ingest(vec![CandidateChunk::new("pre-existing chunk", Role::User)])
        .await
        .unwrap();

    private::set_capture_enabled(dir.path(), false).unwrap();

    let remembered = backend
        .remember("should not land", MemoryCategory::Fact)
        .await
        .unwrap();
    assert!(remembered.is_none());

    let outcome = backend
        .ingest(vec![CandidateChunk::new("also should not land", Role::User)])
        .await
        .unwrap();
    assert_eq!(outcome.inserted, 0);

    // Search is unaffected by private mode
    let hits = backend
        .search("pre-existing chunk", 5, &SearchFilter::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    private::set_capture_enabled(dir.path(), true).unwrap();
    let remembered = backend
        .remember("lands after reopening", MemoryCategory::Fact)
        .await
        .unwrap();
    assert!(remembered.is_some());
}

#[test]
fn chunk_text_is_exposed_for_adapters() {
    let dir = tempfile::tempdir().unwrap();
    let backend = local_backend(&dir);

    let chunks = backend.chunk_text(&"sentence goes here. ".repeat(200));
    assert!(chunks.len() > 1);
}
