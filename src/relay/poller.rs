//! Home-node poller — drains the `conversations` channel into the store.
//!
//! Each pass lists waiting blobs, fetches them, and attempts the HMAC-gated
//! open. A blob that fails verification is poison: it is deleted from the
//! dead drop so it cannot block the channel, and the pass continues. Good
//! blobs are rehydrated into chunks (one chunk per message, unless a message
//! is long enough to need the chunker) and ingested with bounded retry;
//! only then is the blob confirmed, so a crash simply re-fetches.

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;

use crate::chunker;
use crate::crypto::KEY_LEN;
use crate::embedding::EmbeddingClient;
use crate::memory::ingest;
use crate::memory::types::{CandidateChunk, Role};
use crate::relay::client::{parse_sealed, RelayClient};
use crate::relay::{Channel, ConversationDrop};

/// Messages longer than this (estimated tokens) go through the chunker.
const CHUNK_TOKEN_LIMIT: usize = 2000;

/// Result of one poll pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollOutcome {
    /// Blobs seen on the channel.
    pub blobs: usize,
    /// Chunks written to the store.
    pub ingested: usize,
    /// Blobs deleted because they failed verification or parsing.
    pub poisoned: usize,
}

/// Drain the conversations channel once.
pub async fn poll_once(
    conn: &mut Connection,
    embedder: &dyn EmbeddingClient,
    relay: &RelayClient,
    key: &[u8; KEY_LEN],
    data_dir: &Path,
) -> Result<PollOutcome> {
    let mut outcome = PollOutcome::default();

    if !crate::private::capture_enabled(data_dir) {
        tracing::info!("capture disabled, skipping poll");
        return Ok(outcome);
    }

    let listing = relay.list(Channel::Conversations).await?;
    outcome.blobs = listing.blobs.len();
    if listing.blobs.is_empty() {
        return Ok(outcome);
    }

    for blob in &listing.blobs {
        let bytes = relay.fetch(Channel::Conversations, &blob.id).await?;

        let drop: ConversationDrop = match parse_sealed(&bytes)
            .and_then(|sealed| crate::crypto::open(&sealed, key))
            .and_then(|plain| Ok(serde_json::from_slice(&plain)?))
        {
            Ok(drop) => drop,
            Err(e) => {
                // Poison must not block the channel
                tracing::warn!(id = %blob.id, error = %e, "deleting undecryptable blob");
                relay.confirm(Channel::Conversations, &blob.id).await;
                outcome.poisoned += 1;
                continue;
            }
        };

        let candidates = rehydrate(&drop);
        let written = ingest::ingest_with_retry(conn, embedder, candidates).await?;
        outcome.ingested += written.inserted;

        relay.confirm(Channel::Conversations, &blob.id).await;
        tracing::info!(
            id = %blob.id,
            agent = %drop.agent_id,
            messages = drop.messages.len(),
            inserted = written.inserted,
            "conversation blob ingested"
        );
    }

    Ok(outcome)
}

/// Poll on an interval until ctrl-c.
pub async fn run(
    conn: &mut Connection,
    embedder: &dyn EmbeddingClient,
    relay: &RelayClient,
    key: &[u8; KEY_LEN],
    data_dir: &Path,
    interval_secs: u64,
) -> Result<()> {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match poll_once(conn, embedder, relay, key, data_dir).await {
                    Ok(outcome) if outcome.blobs > 0 => {
                        tracing::info!(?outcome, "poll pass complete");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "poll pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("poller shutting down");
                return Ok(());
            }
        }
    }
}

/// Turn a conversation drop into ingestion candidates: one chunk per message,
/// unless the message is long enough to need windowed chunking.
fn rehydrate(drop: &ConversationDrop) -> Vec<CandidateChunk> {
    let mut candidates = Vec::with_capacity(drop.messages.len());

    for message in &drop.messages {
        let role: Role = message.role.parse().unwrap_or(Role::User);
        let source_id = message
            .session_id
            .as_deref()
            .map(|s| format!("session:{s}"))
            .unwrap_or_else(|| "conversation".to_string());

        let texts = if chunker::estimate_tokens(&message.text) > CHUNK_TOKEN_LIMIT {
            chunker::chunk_default(&message.text)
        } else {
            vec![message.text.clone()]
        };

        for text in texts {
            candidates.push(CandidateChunk {
                text,
                role,
                source_type: "conversation".into(),
                source_id: Some(source_id.clone()),
                agent_id: Some(drop.agent_id.clone()),
                created_at: message.timestamp.clone(),
            });
        }
    }

    candidates
}
