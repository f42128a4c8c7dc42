//! Encrypted relay between machines — client, dead-drop server, poller, and
//! the mirror protocol.
//!
//! Two one-way channels exist: `conversations` carries sealed conversation
//! drops from devices to the home node, and `mirror` carries sealed database
//! snapshots from the home node back to devices. The dead drop itself never
//! decrypts anything.

pub mod client;
pub mod mirror;
pub mod poller;
pub mod server;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Maximum accepted blob size.
pub const MAX_BLOB_BYTES: usize = 100 * 1024 * 1024;

/// Blobs older than this are swept by the dead drop (safety net; normal
/// deletion is via confirm).
pub const BLOB_TTL_HOURS: i64 = 24;

/// The two relay channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Devices → home node.
    Conversations,
    /// Home node → devices.
    Mirror,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Conversations, Channel::Mirror];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversations => "conversations",
            Self::Mirror => "mirror",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "conversations" => Ok(Self::Conversations),
            "mirror" => Ok(Self::Mirror),
            other => bail!("invalid channel: {other}"),
        }
    }
}

/// Metadata for one blob on the dead drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: String,
    pub size: u64,
    pub dropped_at: String,
    pub agent_id: String,
}

/// Response to a pickup listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct PickupList {
    pub channel: String,
    pub count: usize,
    pub blobs: Vec<BlobInfo>,
}

/// Response to a drop.
#[derive(Debug, Serialize, Deserialize)]
pub struct DropReceipt {
    pub ok: bool,
    pub id: String,
    pub channel: String,
    pub size: u64,
    pub dropped_at: String,
}

/// Plaintext of a conversation drop, before sealing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDrop {
    pub agent_id: String,
    pub dropped_at: String,
    pub messages: Vec<ConversationMessage>,
}

/// One captured message inside a conversation drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub text: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(
        default,
        rename = "sessionId",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_strings() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("uploads".parse::<Channel>().is_err());
    }

    #[test]
    fn conversation_payload_uses_wire_field_names() {
        let drop = ConversationDrop {
            agent_id: "laptop".into(),
            dropped_at: "2026-03-01T10:00:00Z".into(),
            messages: vec![ConversationMessage {
                text: "hello".into(),
                role: "user".into(),
                timestamp: None,
                session_id: Some("s-1".into()),
            }],
        };
        let json = serde_json::to_value(&drop).unwrap();
        assert_eq!(json["messages"][0]["sessionId"], "s-1");
    }
}
