//! The process-wide capture gate.
//!
//! A single JSON file in the data directory holds `{"enabled": bool}`.
//! Capture paths and explicit memory writes consult it and turn into polite
//! no-ops while capture is disabled; search is never affected. An absent or
//! corrupt file reads as enabled, so absence of configuration means default
//! behaviour.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const GATE_FILE: &str = "private_mode.json";

#[derive(Debug, Serialize, Deserialize)]
struct GateFile {
    enabled: bool,
}

/// Whether capture is currently allowed. Fail-open: anything short of an
/// explicit `{"enabled": false}` means yes.
pub fn capture_enabled(data_dir: &Path) -> bool {
    let path = data_dir.join(GATE_FILE);
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<GateFile>(&raw) {
            Ok(gate) => gate.enabled,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt gate file, defaulting to enabled");
                true
            }
        },
        Err(_) => true,
    }
}

/// Flip the capture gate. `enabled = false` enters private mode.
pub fn set_capture_enabled(data_dir: &Path, enabled: bool) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(GATE_FILE);
    let raw = serde_json::to_string_pretty(&GateFile { enabled })?;
    std::fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))?;

    tracing::info!(enabled, "capture gate updated");
    Ok(())
}
