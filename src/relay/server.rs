//! The dead drop — a blind, authenticated blob store.
//!
//! Blobs are addressed by `<channel>/<uuid>` and carry only `{agent_id,
//! dropped_at, size}` metadata. The server never decrypts payloads, never
//! cross-references channels, and persists nothing outside the blob
//! directory. A periodic sweep deletes blobs older than 24 hours as a safety
//! net; normal deletion is the client's confirm.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::relay::{BlobInfo, Channel, PickupList, BLOB_TTL_HOURS, MAX_BLOB_BYTES};

/// Settings for a dead drop instance.
#[derive(Debug, Clone)]
pub struct DeadDropConfig {
    pub bind: String,
    /// Directory holding the blob store.
    pub blob_dir: PathBuf,
    /// Bearer token → agent name.
    pub agents: HashMap<String, String>,
}

/// Filesystem-backed blob store: `<root>/<channel>/<uuid>` plus a
/// `<uuid>.json` metadata sidecar.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn channel_dir(&self, channel: Channel) -> PathBuf {
        self.root.join(channel.as_str())
    }

    /// Store a blob, assigning it a fresh UUID.
    pub fn put(&self, channel: Channel, body: &[u8], agent_id: &str) -> Result<BlobInfo> {
        let dir = self.channel_dir(channel);
        std::fs::create_dir_all(&dir)?;

        let info = BlobInfo {
            id: Uuid::new_v4().to_string(),
            size: body.len() as u64,
            dropped_at: Utc::now().to_rfc3339(),
            agent_id: agent_id.to_string(),
        };

        std::fs::write(dir.join(&info.id), body)?;
        std::fs::write(
            dir.join(format!("{}.json", info.id)),
            serde_json::to_vec(&info)?,
        )?;
        Ok(info)
    }

    /// Enumerate a channel's blobs, oldest first.
    pub fn list(&self, channel: Channel) -> Result<Vec<BlobInfo>> {
        let dir = self.channel_dir(channel);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut blobs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") {
                continue;
            }
            match std::fs::read(entry.path())
                .ok()
                .and_then(|raw| serde_json::from_slice::<BlobInfo>(&raw).ok())
            {
                Some(info) => blobs.push(info),
                None => tracing::warn!(file = %name, "skipping unreadable blob metadata"),
            }
        }
        blobs.sort_by(|a, b| a.dropped_at.cmp(&b.dropped_at));
        Ok(blobs)
    }

    /// Read one blob's body, or `None` if absent.
    pub fn get(&self, channel: Channel, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.channel_dir(channel).join(sanitize_id(id)?);
        match std::fs::read(&path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob and its metadata. Returns whether anything was removed.
    pub fn delete(&self, channel: Channel, id: &str) -> Result<bool> {
        let dir = self.channel_dir(channel);
        let id = sanitize_id(id)?;
        let removed = std::fs::remove_file(dir.join(id)).is_ok();
        std::fs::remove_file(dir.join(format!("{id}.json"))).ok();
        Ok(removed)
    }

    /// Delete blobs dropped before `cutoff` on every channel. Returns the
    /// number removed.
    pub fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for channel in Channel::ALL {
            for info in self.list(channel)? {
                let Ok(dropped_at) = DateTime::parse_from_rfc3339(&info.dropped_at) else {
                    continue;
                };
                if dropped_at.with_timezone(&Utc) < cutoff {
                    if self.delete(channel, &info.id)? {
                        removed += 1;
                        tracing::info!(%channel, id = %info.id, "swept expired blob");
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Blob ids are UUIDs; anything else never touches the filesystem.
fn sanitize_id(id: &str) -> Result<&str> {
    anyhow::ensure!(
        !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
        "invalid blob id"
    );
    Ok(id)
}

// ── HTTP surface ──────────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    store: BlobStore,
    agents: Arc<HashMap<String, String>>,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: "unknown bearer token".into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    fn internal(e: anyhow::Error) -> Self {
        tracing::error!(error = %e, "internal dead drop error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: "internal error".into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({ "error": { "code": self.code, "message": self.message } });
        (self.status, Json(body)).into_response()
    }
}

/// Build the dead drop router.
pub fn router(config: &DeadDropConfig) -> Router {
    let state = AppState {
        store: BlobStore::new(&config.blob_dir),
        agents: Arc::new(config.agents.clone()),
    };

    Router::new()
        .route("/drop/{channel}", post(handle_drop))
        .route("/pickup/{channel}", get(handle_list))
        .route("/pickup/{channel}/{id}", get(handle_fetch))
        .route("/confirm/{channel}/{id}", delete(handle_confirm))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_BLOB_BYTES + 4096))
        .with_state(state)
}

/// Run the dead drop until ctrl-c, with an hourly TTL sweep.
pub async fn serve(config: DeadDropConfig) -> Result<()> {
    let app = router(&config);

    let sweeper = BlobStore::new(&config.blob_dir);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let cutoff = Utc::now() - chrono::Duration::hours(BLOB_TTL_HOURS);
            match sweeper.sweep_expired(cutoff) {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "TTL sweep complete"),
                Err(e) => tracing::warn!(error = %e, "TTL sweep failed"),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "dead drop listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            tracing::info!("shutting down dead drop");
        })
        .await?;

    Ok(())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(AppError::forbidden)?;

    state
        .agents
        .get(token)
        .cloned()
        .ok_or_else(AppError::forbidden)
}

fn parse_channel(raw: &str) -> Result<Channel, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid channel: {raw}")))
}

async fn handle_drop(
    State(state): State<AppState>,
    AxumPath(channel): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let agent = authenticate(&state, &headers)?;
    let channel = parse_channel(&channel)?;

    if body.is_empty() {
        return Err(AppError::bad_request("empty body"));
    }
    if body.len() > MAX_BLOB_BYTES {
        return Err(AppError {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "payload_too_large",
            message: format!("blob exceeds {MAX_BLOB_BYTES} bytes"),
        });
    }

    let info = state
        .store
        .put(channel, &body, &agent)
        .map_err(AppError::internal)?;

    tracing::info!(%channel, id = %info.id, size = info.size, agent, "blob dropped");
    Ok(Json(json!({
        "ok": true,
        "id": info.id,
        "channel": channel.as_str(),
        "size": info.size,
        "dropped_at": info.dropped_at,
    })))
}

async fn handle_list(
    State(state): State<AppState>,
    AxumPath(channel): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Json<PickupList>, AppError> {
    authenticate(&state, &headers)?;
    let channel = parse_channel(&channel)?;

    let blobs = state.store.list(channel).map_err(AppError::internal)?;
    Ok(Json(PickupList {
        channel: channel.as_str().to_string(),
        count: blobs.len(),
        blobs,
    }))
}

async fn handle_fetch(
    State(state): State<AppState>,
    AxumPath((channel, id)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Result<Vec<u8>, AppError> {
    authenticate(&state, &headers)?;
    let channel = parse_channel(&channel)?;

    state
        .store
        .get(channel, &id)
        .map_err(|_| AppError::bad_request("invalid blob id"))?
        .ok_or_else(|| AppError::not_found(format!("no blob {id} on {channel}")))
}

async fn handle_confirm(
    State(state): State<AppState>,
    AxumPath((channel, id)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    authenticate(&state, &headers)?;
    let channel = parse_channel(&channel)?;

    let deleted = state
        .store
        .delete(channel, &id)
        .map_err(|_| AppError::bad_request("invalid blob id"))?;
    if !deleted {
        return Err(AppError::not_found(format!("no blob {id} on {channel}")));
    }

    tracing::info!(%channel, id, "blob confirmed");
    Ok(Json(json!({ "ok": true, "deleted": true })))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": "crystal-relay", "mode": "dead-drop" }))
}
