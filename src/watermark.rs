//! Byte-offset watermarks for append-only transcript files.
//!
//! Transcripts are line-delimited JSON. Per file the watermark records the
//! byte offset of the last-processed tail; a run reads only `[offset, size)`,
//! parses the complete lines in that range, and advances the offset to the
//! file size. On first sight the offset is seeded at the current size so
//! history is skipped. A minimum-token gate suppresses trivial updates
//! without advancing the offset, so small tails accumulate until worth
//! capturing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::chunker::estimate_tokens;

/// Default aggregate-token floor below which a tail is not captured.
pub const MIN_CAPTURE_TOKENS: usize = 500;

/// One file's progress marker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Watermark {
    pub offset: u64,
    pub last_run: Option<String>,
}

/// Watermarks for all transcripts, persisted as one JSON file keyed by
/// absolute transcript path.
#[derive(Debug)]
pub struct WatermarkStore {
    path: PathBuf,
    entries: HashMap<String, Watermark>,
}

/// Result of reading a transcript tail.
#[derive(Debug, Default)]
pub struct TailRead {
    /// Parsed JSON values, one per complete line in the tail.
    pub messages: Vec<serde_json::Value>,
    /// Aggregate token estimate of the tail.
    pub token_estimate: usize,
    /// True when the tail was below the token gate and the offset was left
    /// in place.
    pub suppressed: bool,
    /// True when this was the file's first sighting (history skipped).
    pub first_sight: bool,
}

impl WatermarkStore {
    /// Load the watermark file; absent or corrupt files start empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    /// Persist all watermarks.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Current watermark for a transcript, if one exists.
    pub fn get(&self, transcript: &Path) -> Option<&Watermark> {
        self.entries.get(&key_for(transcript))
    }

    fn set_offset(&mut self, transcript: &Path, offset: u64) {
        let entry = self.entries.entry(key_for(transcript)).or_default();
        entry.offset = offset;
        entry.last_run = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Read the unprocessed tail of a transcript.
    ///
    /// Uses [`MIN_CAPTURE_TOKENS`] as the gate; see [`read_tail_with_gate`].
    pub fn read_tail(&mut self, transcript: &Path) -> Result<TailRead> {
        self.read_tail_with_gate(transcript, MIN_CAPTURE_TOKENS)
    }

    /// Read the unprocessed tail of a transcript with an explicit token gate.
    ///
    /// The offset advances to the file size whenever messages are returned,
    /// and also when the tail parsed to nothing; a gated (suppressed) tail
    /// leaves the offset untouched.
    pub fn read_tail_with_gate(
        &mut self,
        transcript: &Path,
        min_tokens: usize,
    ) -> Result<TailRead> {
        let size = std::fs::metadata(transcript)
            .with_context(|| format!("failed to stat {}", transcript.display()))?
            .len();

        let Some(mark) = self.get(transcript).cloned() else {
            // First sight: skip history, start watching from here
            self.set_offset(transcript, size);
            self.save()?;
            return Ok(TailRead {
                first_sight: true,
                ..Default::default()
            });
        };

        let offset = mark.offset.min(size);
        if offset == size {
            return Ok(TailRead::default());
        }

        let mut file = std::fs::File::open(transcript)
            .with_context(|| format!("failed to open {}", transcript.display()))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut raw = String::new();
        file.take(size - offset).read_to_string(&mut raw)?;

        let mut messages = Vec::new();
        let mut token_estimate = 0usize;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => {
                    token_estimate += estimate_tokens(line);
                    messages.push(value);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unparseable transcript line");
                }
            }
        }

        if !messages.is_empty() && token_estimate < min_tokens {
            tracing::debug!(
                path = %transcript.display(),
                token_estimate,
                min_tokens,
                "tail below capture gate, leaving watermark in place"
            );
            return Ok(TailRead {
                suppressed: true,
                token_estimate,
                ..Default::default()
            });
        }

        self.set_offset(transcript, size);
        self.save()?;

        Ok(TailRead {
            messages,
            token_estimate,
            suppressed: false,
            first_sight: false,
        })
    }
}

fn key_for(transcript: &Path) -> String {
    transcript.display().to_string()
}
