//! Text-to-vector embedding clients.
//!
//! Three HTTP providers are supported, selected by configuration:
//!
//! - **OpenAI** — remote, batched, 1536 dimensions by default
//! - **Ollama** — local HTTP, one request per input, 768 dimensions by default
//! - **Google** — remote, batched, 768 dimensions by default
//!
//! Batched providers split their input so no single request exceeds
//! [`MAX_BATCH_CHARS`] characters; results come back in input order
//! regardless of batching. Transport failures propagate to the caller —
//! retry policy belongs to the ingestion pipeline, not to this client.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::{EmbeddingConfig, ProviderKind};

/// Default dimensionality per provider.
pub const OPENAI_DIM: usize = 1536;
pub const OLLAMA_DIM: usize = 768;
pub const GOOGLE_DIM: usize = 768;

/// Per-request character ceiling for batched providers.
pub const MAX_BATCH_CHARS: usize = 800_000;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(15);

/// A text-to-vector backend.
///
/// `embed` returns one vector per input, in input order. An implementation
/// returning a different count is a bug surfaced by the ingestion pipeline.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Label recorded in the store, e.g. `"openai/text-embedding-3-small"`.
    fn provider_label(&self) -> String;

    /// The vector dimensionality this client produces.
    fn dims(&self) -> usize;

    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }
}

/// Create the configured embedding client.
pub fn create_client(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingClient>> {
    match config.provider {
        ProviderKind::OpenAi => Ok(Box::new(OpenAiClient::new(config)?)),
        ProviderKind::Ollama => Ok(Box::new(OllamaClient::new(config)?)),
        ProviderKind::Google => Ok(Box::new(GoogleClient::new(config)?)),
    }
}

/// Split `texts` into contiguous runs whose combined length stays under
/// `max_chars`. A single oversized text still gets its own run.
fn batch_ranges(texts: &[String], max_chars: usize) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chars = 0usize;

    for (i, text) in texts.iter().enumerate() {
        if i > start && chars + text.len() > max_chars {
            ranges.push(start..i);
            start = i;
            chars = 0;
        }
        chars += text.len();
    }
    if start < texts.len() {
        ranges.push(start..texts.len());
    }
    ranges
}

// ============ OpenAI ============

/// Remote batched client for the OpenAI embeddings API.
pub struct OpenAiClient {
    model: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        Ok(Self {
            model: config.openai_model.clone(),
            api_key,
            http: reqwest::Client::builder()
                .timeout(REMOTE_TIMEOUT)
                .build()
                .context("failed to build HTTP client")?,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });

        let response = self
            .http
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("OpenAI embeddings request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {status}: {body}");
        }

        let payload: serde_json::Value = response.json().await?;
        let data = payload
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid OpenAI response: missing data array"))?;

        // Sort by index so output order matches input order
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow::anyhow!("invalid OpenAI response: missing embedding"))?;
            let vec = embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            indexed.push((index, vec));
        }
        indexed.sort_by_key(|(i, _)| *i);

        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiClient {
    fn provider_label(&self) -> String {
        format!("openai/{}", self.model)
    }

    fn dims(&self) -> usize {
        OPENAI_DIM
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for range in batch_ranges(texts, MAX_BATCH_CHARS) {
            vectors.extend(self.embed_batch(&texts[range]).await?);
        }
        ensure_count(texts.len(), vectors.len())?;
        Ok(vectors)
    }
}

// ============ Ollama ============

/// Local HTTP client for an Ollama instance. One request per input.
pub struct OllamaClient {
    host: String,
    model: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            host: config.ollama_host.trim_end_matches('/').to_string(),
            model: config.ollama_model.clone(),
            http: reqwest::Client::builder()
                .timeout(LOCAL_TIMEOUT)
                .build()
                .context("failed to build HTTP client")?,
        })
    }

    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.model, "prompt": text });

        let response = self
            .http
            .post(format!("{}/api/embeddings", self.host))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Ollama request failed (is Ollama running at {}?)", self.host))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama API error {status}: {body}");
        }

        let payload: serde_json::Value = response.json().await?;
        let embedding = payload
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid Ollama response: missing embedding"))?;

        Ok(embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect())
    }
}

#[async_trait]
impl EmbeddingClient for OllamaClient {
    fn provider_label(&self) -> String {
        format!("ollama/{}", self.model)
    }

    fn dims(&self) -> usize {
        OLLAMA_DIM
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed_single(text).await?);
        }
        ensure_count(texts.len(), vectors.len())?;
        Ok(vectors)
    }
}

// ============ Google ============

/// Remote batched client for the Google Generative Language embeddings API.
pub struct GoogleClient {
    model: String,
    api_key: String,
    http: reqwest::Client,
}

impl GoogleClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .google_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("GOOGLE_API_KEY not set"))?;

        Ok(Self {
            model: config.google_model.clone(),
            api_key,
            http: reqwest::Client::builder()
                .timeout(REMOTE_TIMEOUT)
                .build()
                .context("failed to build HTTP client")?,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] }
                })
            })
            .collect();

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:batchEmbedContents?key={}",
            self.model, self.api_key
        );

        let response = self
            .http
            .post(url)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .context("Google embeddings request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Google API error {status}: {body}");
        }

        let payload: serde_json::Value = response.json().await?;
        let embeddings = payload
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid Google response: missing embeddings array"))?;

        let mut vectors = Vec::with_capacity(embeddings.len());
        for item in embeddings {
            let values = item
                .get("values")
                .and_then(|v| v.as_array())
                .ok_or_else(|| anyhow::anyhow!("invalid Google response: missing values"))?;
            vectors.push(
                values
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingClient for GoogleClient {
    fn provider_label(&self) -> String {
        format!("google/{}", self.model)
    }

    fn dims(&self) -> usize {
        GOOGLE_DIM
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for range in batch_ranges(texts, MAX_BATCH_CHARS) {
            vectors.extend(self.embed_batch(&texts[range]).await?);
        }
        ensure_count(texts.len(), vectors.len())?;
        Ok(vectors)
    }
}

fn ensure_count(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        bail!("embedder returned {got} vectors for {expected} inputs");
    }
    Ok(())
}
