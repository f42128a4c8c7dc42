//! Mirror protocol — sealed full-store snapshots, applied atomically.
//!
//! The home node seals two payloads with the master key: a small metadata
//! object `{hash, size, pushed_at}` and the raw store bytes, posted together
//! on the `mirror` channel. Devices pull the latest snapshot, verify the
//! SHA-256 of the decrypted bytes against the sealed metadata, and replace
//! their local mirror via a `.tmp` write and rename — an integrity failure
//! leaves the previous mirror intact.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::crypto::{open, seal, sha256_hex, SealedPayload, KEY_LEN};
use crate::relay::client::RelayClient;
use crate::relay::{Channel, DropReceipt};

/// Plaintext of the sealed snapshot metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorMeta {
    pub hash: String,
    pub size: u64,
    pub pushed_at: String,
}

/// Wire format of a mirror blob: two sealed envelopes.
#[derive(Debug, Serialize, Deserialize)]
struct MirrorEnvelope {
    meta: SealedPayload,
    db: SealedPayload,
}

/// Device-local record of the last applied snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorState {
    pub last_applied_hash: Option<String>,
    pub last_pulled_at: Option<String>,
}

impl MirrorState {
    /// Load the state file; absent or corrupt files start empty.
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Outcome of a pull.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    /// True when a new snapshot was written to the destination.
    pub applied: bool,
    /// Hash of the snapshot that was applied or skipped.
    pub hash: Option<String>,
}

/// Home-node push: read, hash, seal, drop.
pub async fn push(
    relay: &RelayClient,
    key: &[u8; KEY_LEN],
    db_path: &Path,
) -> Result<DropReceipt> {
    let db_bytes = std::fs::read(db_path)
        .with_context(|| format!("failed to read store at {}", db_path.display()))?;

    let meta = MirrorMeta {
        hash: sha256_hex(&db_bytes),
        size: db_bytes.len() as u64,
        pushed_at: chrono::Utc::now().to_rfc3339(),
    };

    let envelope = MirrorEnvelope {
        meta: seal(&serde_json::to_vec(&meta)?, key)?,
        db: seal(&db_bytes, key)?,
    };

    let receipt = relay
        .drop_blob(Channel::Mirror, serde_json::to_vec(&envelope)?)
        .await?;
    tracing::info!(hash = %meta.hash, size = meta.size, id = %receipt.id, "mirror pushed");
    Ok(receipt)
}

/// Device pull: fetch the latest snapshot, verify, and replace the local
/// mirror atomically.
pub async fn pull(
    relay: &RelayClient,
    key: &[u8; KEY_LEN],
    dest: &Path,
    state_path: &Path,
    force: bool,
) -> Result<PullOutcome> {
    let listing = relay.list(Channel::Mirror).await?;
    let Some(latest) = listing
        .blobs
        .iter()
        .max_by(|a, b| a.dropped_at.cmp(&b.dropped_at))
    else {
        tracing::info!("no mirror snapshots waiting");
        return Ok(PullOutcome {
            applied: false,
            hash: None,
        });
    };

    let bytes = relay.fetch(Channel::Mirror, &latest.id).await?;
    let envelope: MirrorEnvelope =
        serde_json::from_slice(&bytes).context("mirror blob is not a snapshot envelope")?;

    let meta: MirrorMeta = serde_json::from_slice(&open(&envelope.meta, key)?)
        .context("mirror metadata did not parse")?;

    let mut state = MirrorState::load(state_path);
    if !force && state.last_applied_hash.as_deref() == Some(meta.hash.as_str()) {
        tracing::info!(hash = %meta.hash, "mirror already current");
        return Ok(PullOutcome {
            applied: false,
            hash: Some(meta.hash),
        });
    }

    let db_bytes = open(&envelope.db, key)?;

    // Integrity gate: a snapshot whose bytes do not hash to the sealed
    // metadata never touches the existing mirror.
    let actual = sha256_hex(&db_bytes);
    if actual != meta.hash {
        bail!(
            "mirror integrity failure: snapshot hashes to {actual}, metadata says {}",
            meta.hash
        );
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sibling(dest, "tmp");
    std::fs::write(&tmp, &db_bytes)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    if dest.exists() {
        std::fs::rename(dest, sibling(dest, "bak"))?;
    }
    std::fs::rename(&tmp, dest)
        .with_context(|| format!("failed to move snapshot into {}", dest.display()))?;

    state.last_applied_hash = Some(meta.hash.clone());
    state.last_pulled_at = Some(chrono::Utc::now().to_rfc3339());
    state.save(state_path)?;

    // Best-effort cleanup of everything we listed
    for blob in &listing.blobs {
        relay.confirm(Channel::Mirror, &blob.id).await;
    }

    tracing::info!(hash = %meta.hash, dest = %dest.display(), "mirror applied");
    Ok(PullOutcome {
        applied: true,
        hash: Some(meta.hash),
    })
}

/// `<dest>.tmp` / `<dest>.bak` — appended, not substituted, so the mirror's
/// own extension survives.
fn sibling(dest: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    std::path::PathBuf::from(name)
}
