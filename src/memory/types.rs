//! Core type definitions for chunks and explicit memories.

use serde::{Deserialize, Serialize};

/// Speaker role attached to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// Category of an explicit memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Event,
    Opinion,
    Skill,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Event => "event",
            Self::Opinion => "opinion",
            Self::Skill => "skill",
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "event" => Ok(Self::Event),
            "opinion" => Ok(Self::Opinion),
            "skill" => Ok(Self::Skill),
            _ => Err(format!("unknown memory category: {s}")),
        }
    }
}

/// Lifecycle status of an explicit memory. Deprecation is logical only —
/// neither the memory row nor its mirror chunk is ever deleted by [`super::remember::forget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Deprecated,
    Deleted,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Deleted => "deleted",
        }
    }
}

/// A chunk offered to the ingestion pipeline. Deduplication, hashing, and
/// embedding happen inside the pipeline; candidates carry only text and
/// provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateChunk {
    pub text: String,
    pub role: Role,
    pub source_type: String,
    pub source_id: Option<String>,
    pub agent_id: Option<String>,
    /// ISO-8601 UTC creation timestamp. Capture adapters pass the original
    /// message timestamp; `None` stamps the ingest time.
    pub created_at: Option<String>,
}

impl CandidateChunk {
    pub fn new(text: impl Into<String>, role: Role) -> Self {
        Self {
            text: text.into(),
            role,
            source_type: "conversation".into(),
            source_id: None,
            agent_id: None,
            created_at: None,
        }
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub text: String,
    pub category: MemoryCategory,
    pub confidence: f64,
    /// Chunk ids this fact was distilled from.
    pub source_chunk_ids: Vec<i64>,
    pub status: MemoryStatus,
    pub created_at: String,
    pub updated_at: String,
}
