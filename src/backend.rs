//! The capability facade — one surface, two transports.
//!
//! [`MemoryBackend`] is the set of operations every front-end consumes:
//! search, remember, forget, status, ingest, and chunking. [`LocalBackend`]
//! executes them against the embedded store; [`RemoteBackend`] forwards them
//! to a serving instance over HTTPS. Construction picks the variant from
//! configuration.
//!
//! Capture-adjacent operations (`remember`, `ingest`) consult the private
//! gate and turn into polite no-ops while capture is disabled; search never
//! does.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chunker;
use crate::config::CrystalConfig;
use crate::embedding::{self, EmbeddingClient};
use crate::memory::ingest::{self, IngestOutcome};
use crate::memory::remember;
use crate::memory::search::{self, SearchFilter, SearchHit};
use crate::memory::status::{self, StatusSnapshot};
use crate::memory::types::{CandidateChunk, MemoryCategory};

/// The operations a memory front-end needs.
///
/// Futures here are not required to be `Send`: the local variant holds the
/// store connection across awaits, and every caller drives these futures
/// directly on the runtime rather than spawning them.
#[async_trait(?Send)]
pub trait MemoryBackend: Send + Sync {
    /// Hybrid search over the corpus.
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>>;

    /// Store an explicit fact. `None` when the capture gate is closed.
    async fn remember(&self, text: &str, category: MemoryCategory) -> Result<Option<i64>>;

    /// Deprecate a fact. Returns whether anything changed.
    async fn forget(&self, id: i64) -> Result<bool>;

    /// Read-only counters.
    async fn status(&self) -> Result<StatusSnapshot>;

    /// Run candidates through the ingestion pipeline. A closed capture gate
    /// yields an empty outcome.
    async fn ingest(&self, candidates: Vec<CandidateChunk>) -> Result<IngestOutcome>;

    /// Deterministic chunking, exposed for adapters.
    fn chunk_text(&self, text: &str) -> Vec<String>;
}

/// Construct the backend selected by configuration: remote when a remote URL
/// is set, local otherwise.
pub fn create_backend(config: &CrystalConfig) -> Result<Box<dyn MemoryBackend>> {
    match &config.remote_url {
        Some(url) => Ok(Box::new(RemoteBackend::new(
            url.clone(),
            config.remote_token.clone().unwrap_or_default(),
        )?)),
        None => Ok(Box::new(LocalBackend::open(config)?)),
    }
}

// ── Local ─────────────────────────────────────────────────────────────────────

/// Facade over the embedded store.
pub struct LocalBackend {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingClient>,
    data_dir: PathBuf,
}

impl LocalBackend {
    /// Open the store and embedding client from configuration.
    pub fn open(config: &CrystalConfig) -> Result<Self> {
        let conn = crate::db::open_database(config.db_path())?;
        let embedder = embedding::create_client(&config.embedding)?;
        Ok(Self::new(conn, Arc::from(embedder), config.data_dir.clone()))
    }

    pub fn new(
        conn: Connection,
        embedder: Arc<dyn EmbeddingClient>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
            data_dir,
        }
    }

    fn capture_enabled(&self) -> bool {
        crate::private::capture_enabled(&self.data_dir)
    }
}

#[async_trait(?Send)]
impl MemoryBackend for LocalBackend {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.conn.lock().await;
        search::search(&conn, &*self.embedder, query, limit, filter).await
    }

    async fn remember(&self, text: &str, category: MemoryCategory) -> Result<Option<i64>> {
        if !self.capture_enabled() {
            tracing::info!("capture disabled, memory not stored");
            return Ok(None);
        }
        let mut conn = self.conn.lock().await;
        let id = remember::remember(&mut conn, &*self.embedder, text, category, &[]).await?;
        Ok(Some(id))
    }

    async fn forget(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        remember::forget(&conn, id)
    }

    async fn status(&self) -> Result<StatusSnapshot> {
        let conn = self.conn.lock().await;
        status::status_snapshot(&conn, &self.embedder.provider_label(), &self.data_dir)
    }

    async fn ingest(&self, candidates: Vec<CandidateChunk>) -> Result<IngestOutcome> {
        if !self.capture_enabled() {
            tracing::info!("capture disabled, ingest skipped");
            return Ok(IngestOutcome::default());
        }
        let mut conn = self.conn.lock().await;
        ingest::ingest_chunks(&mut conn, &*self.embedder, candidates).await
    }

    fn chunk_text(&self, text: &str) -> Vec<String> {
        chunker::chunk_default(text)
    }
}

// ── Remote ────────────────────────────────────────────────────────────────────

/// Facade over a remote serving instance, JSON over HTTPS.
pub struct RemoteBackend {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct RememberResponse {
    id: Option<i64>,
}

#[derive(Deserialize)]
struct ForgetResponse {
    removed: bool,
}

impl RemoteBackend {
    pub fn new(base_url: String, token: String) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .context("failed to build HTTP client")?,
        })
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("remote request to {path} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("remote {path} returned {status}: {body}");
        }
        Ok(response.json().await?)
    }
}

#[async_trait(?Send)]
impl MemoryBackend for RemoteBackend {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        self.post_json(
            "/api/search",
            json!({
                "query": query,
                "limit": limit,
                "agent_id": filter.agent_id,
                "source_type": filter.source_type,
            }),
        )
        .await
    }

    async fn remember(&self, text: &str, category: MemoryCategory) -> Result<Option<i64>> {
        let response: RememberResponse = self
            .post_json(
                "/api/remember",
                json!({ "text": text, "category": category.as_str() }),
            )
            .await?;
        Ok(response.id)
    }

    async fn forget(&self, id: i64) -> Result<bool> {
        let response: ForgetResponse =
            self.post_json("/api/forget", json!({ "id": id })).await?;
        Ok(response.removed)
    }

    async fn status(&self) -> Result<StatusSnapshot> {
        let response = self
            .http
            .get(format!("{}/api/status", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("remote status request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("remote /api/status returned {status}");
        }
        Ok(response.json().await?)
    }

    async fn ingest(&self, candidates: Vec<CandidateChunk>) -> Result<IngestOutcome> {
        self.post_json("/api/ingest", serde_json::to_value(&candidates)?)
            .await
    }

    fn chunk_text(&self, text: &str) -> Vec<String> {
        chunker::chunk_default(text)
    }
}
