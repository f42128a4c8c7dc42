mod helpers;

use helpers::{test_db, StubEmbedder};
use memory_crystal::crypto::KEY_LEN;
use memory_crystal::relay::client::RelayClient;
use memory_crystal::relay::poller::poll_once;
use memory_crystal::relay::server::{router, DeadDropConfig};
use memory_crystal::relay::{Channel, ConversationDrop, ConversationMessage};
use std::collections::HashMap;

fn master_key() -> [u8; KEY_LEN] {
    [9u8; KEY_LEN]
}

async fn spawn_dead_drop(dir: &tempfile::TempDir) -> String {
    let mut agents = HashMap::new();
    agents.insert("tok-laptop".to_string(), "laptop".to_string());
    agents.insert("tok-home".to_string(), "home".to_string());

    let app = router(&DeadDropConfig {
        bind: String::new(),
        blob_dir: dir.path().join("blobs"),
        agents,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn sample_drop() -> ConversationDrop {
    ConversationDrop {
        agent_id: "laptop".into(),
        dropped_at: "2026-03-01T12:00:00Z".into(),
        messages: vec![
            ConversationMessage {
                text: "remember to rotate the relay key".into(),
                role: "user".into(),
                timestamp: Some("2026-03-01T11:58:00Z".into()),
                session_id: Some("s-77".into()),
            },
            ConversationMessage {
                text: "noted, rotation scheduled".into(),
                role: "assistant".into(),
                timestamp: Some("2026-03-01T11:58:30Z".into()),
                session_id: Some("s-77".into()),
            },
        ],
    }
}

#[tokio::test]
async fn poll_ingests_sealed_conversations_and_confirms() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;
    let key = master_key();

    let laptop = RelayClient::new(&base, "tok-laptop").unwrap();
    laptop.drop_conversation(&key, &sample_drop()).await.unwrap();

    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let home = RelayClient::new(&base, "tok-home").unwrap();

    let outcome = poll_once(&mut conn, &embedder, &home, &key, dir.path())
        .await
        .unwrap();
    assert_eq!(outcome.blobs, 1);
    assert_eq!(outcome.ingested, 2);
    assert_eq!(outcome.poisoned, 0);

    // The blob is gone after the successful ingest
    let listing = home.list(Channel::Conversations).await.unwrap();
    assert_eq!(listing.count, 0);

    // Chunks carry the drop's provenance and the original timestamps
    let (agent, source_id, created_at): (String, String, String) = conn
        .query_row(
            "SELECT agent_id, source_id, created_at FROM chunks LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(agent, "laptop");
    assert_eq!(source_id, "session:s-77");
    assert_eq!(created_at, "2026-03-01T11:58:00Z");
}

#[tokio::test]
async fn poisoned_blob_is_deleted_and_does_not_block_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;
    let key = master_key();

    let laptop = RelayClient::new(&base, "tok-laptop").unwrap();
    // Garbage that is not even a sealed envelope
    laptop
        .drop_blob(Channel::Conversations, b"not an envelope".to_vec())
        .await
        .unwrap();
    // A real drop behind it
    laptop.drop_conversation(&key, &sample_drop()).await.unwrap();

    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let home = RelayClient::new(&base, "tok-home").unwrap();

    let outcome = poll_once(&mut conn, &embedder, &home, &key, dir.path())
        .await
        .unwrap();
    assert_eq!(outcome.blobs, 2);
    assert_eq!(outcome.poisoned, 1);
    assert_eq!(outcome.ingested, 2);

    // Both blobs are gone: one ingested, one deleted as poison
    let listing = home.list(Channel::Conversations).await.unwrap();
    assert_eq!(listing.count, 0);
}

#[tokio::test]
async fn poll_respects_the_capture_gate() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;
    let key = master_key();

    let laptop = RelayClient::new(&base, "tok-laptop").unwrap();
    laptop.drop_conversation(&key, &sample_drop()).await.unwrap();

    memory_crystal::private::set_capture_enabled(dir.path(), false).unwrap();

    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let home = RelayClient::new(&base, "tok-home").unwrap();

    let outcome = poll_once(&mut conn, &embedder, &home, &key, dir.path())
        .await
        .unwrap();
    assert_eq!(outcome.blobs, 0);
    assert_eq!(outcome.ingested, 0);

    // The blob stays on the drop for later
    let listing = home.list(Channel::Conversations).await.unwrap();
    assert_eq!(listing.count, 1);

    // Search still works while capture is off (nothing in the store yet,
    // but the call itself must not be gated)
    let hits = memory_crystal::memory::search::search(
        &conn,
        &embedder,
        "anything",
        5,
        &memory_crystal::memory::search::SearchFilter::default(),
    )
    .await
    .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn wrong_key_drops_are_poison_not_errors() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;

    let laptop = RelayClient::new(&base, "tok-laptop").unwrap();
    // Sealed under a key the home node does not hold
    laptop
        .drop_conversation(&[1u8; KEY_LEN], &sample_drop())
        .await
        .unwrap();

    let mut conn = test_db();
    let embedder = StubEmbedder::new(8);
    let home = RelayClient::new(&base, "tok-home").unwrap();

    let outcome = poll_once(&mut conn, &embedder, &home, &master_key(), dir.path())
        .await
        .unwrap();
    assert_eq!(outcome.poisoned, 1);
    assert_eq!(outcome.ingested, 0);

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
}
