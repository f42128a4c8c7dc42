use memory_crystal::relay::client::RelayClient;
use memory_crystal::relay::server::{router, DeadDropConfig};
use memory_crystal::relay::{Channel, PickupList};
use std::collections::HashMap;

/// Spin up a dead drop on an ephemeral port. Returns its base URL.
async fn spawn_dead_drop(dir: &tempfile::TempDir) -> String {
    let mut agents = HashMap::new();
    agents.insert("tok-laptop".to_string(), "laptop".to_string());
    agents.insert("tok-home".to_string(), "home".to_string());

    let config = DeadDropConfig {
        bind: String::new(), // unused when serving a router directly
        blob_dir: dir.path().join("blobs"),
        agents,
    };

    let app = router(&config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn blob_lifecycle_drop_list_fetch_confirm() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;
    let http = reqwest::Client::new();

    // Drop ten bytes
    let response = http
        .post(format!("{base}/drop/conversations"))
        .bearer_auth("tok-laptop")
        .header("Content-Type", "application/octet-stream")
        .body(&b"0123456789"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let receipt: serde_json::Value = response.json().await.unwrap();
    assert_eq!(receipt["ok"], true);
    assert_eq!(receipt["size"], 10);
    let id = receipt["id"].as_str().unwrap().to_string();

    // List shows exactly one blob
    let listing: PickupList = http
        .get(format!("{base}/pickup/conversations"))
        .bearer_auth("tok-home")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing.count, 1);
    assert_eq!(listing.blobs[0].id, id);
    assert_eq!(listing.blobs[0].agent_id, "laptop");

    // Fetch returns exactly those bytes; a re-fetch before confirm is identical
    let fetch_url = format!("{base}/pickup/conversations/{id}");
    let first = http
        .get(&fetch_url)
        .bearer_auth("tok-home")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&first[..], b"0123456789");

    let second = http
        .get(&fetch_url)
        .bearer_auth("tok-home")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(first, second);

    // Confirm deletes; the next fetch is a 404
    let confirmed = http
        .delete(format!("{base}/confirm/conversations/{id}"))
        .bearer_auth("tok-home")
        .send()
        .await
        .unwrap();
    assert_eq!(confirmed.status(), 200);
    let body: serde_json::Value = confirmed.json().await.unwrap();
    assert_eq!(body["deleted"], true);

    let gone = http
        .get(&fetch_url)
        .bearer_auth("tok-home")
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn unknown_bearer_token_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{base}/drop/conversations"))
        .bearer_auth("tok-intruder")
        .body(&b"payload"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = http
        .get(format!("{base}/pickup/mirror"))
        .send() // no auth header at all
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn invalid_channels_and_empty_bodies_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{base}/drop/uploads"))
        .bearer_auth("tok-laptop")
        .body(&b"payload"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let response = http
        .post(format!("{base}/drop/conversations"))
        .bearer_auth("tok-laptop")
        .body(Vec::new())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn health_needs_no_auth() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;

    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["mode"], "dead-drop");
}

#[tokio::test]
async fn relay_client_speaks_the_same_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_dead_drop(&dir).await;

    let client = RelayClient::new(&base, "tok-laptop").unwrap();
    let receipt = client
        .drop_blob(Channel::Conversations, b"sealed envelope bytes".to_vec())
        .await
        .unwrap();
    assert!(receipt.ok);

    let listing = client.list(Channel::Conversations).await.unwrap();
    assert_eq!(listing.count, 1);

    let body = client.fetch(Channel::Conversations, &receipt.id).await.unwrap();
    assert_eq!(body, b"sealed envelope bytes");

    client.confirm(Channel::Conversations, &receipt.id).await;
    let listing = client.list(Channel::Conversations).await.unwrap();
    assert_eq!(listing.count, 0);

    // Confirming a gone blob is best-effort and must not error
    client.confirm(Channel::Conversations, &receipt.id).await;
}
