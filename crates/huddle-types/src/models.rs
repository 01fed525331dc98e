use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender recorded on messages whose author deleted their account.
pub const TOMBSTONE_SENDER: &str = "[deleted]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub nickname: String,
    pub password_hash: String,
    #[serde(default)]
    pub channels: BTreeSet<String>,
    #[serde(default)]
    pub friends: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    pub self_destruct_at: DateTime<Utc>,
    #[serde(default)]
    pub warned: bool,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub invites: Vec<Invite>,
}

impl User {
    pub fn is_member(&self, channel_id: &str) -> bool {
        self.channels.contains(channel_id)
    }

    pub fn invite_for(&self, channel_id: &str) -> Option<&Invite> {
        self.invites.iter().find(|i| i.channel_id == channel_id)
    }
}

/// A pending invitation carrying the channel secret encrypted under the
/// invitee's public key. The server never sees the plaintext secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub channel_id: String,
    pub from: String,
    pub encrypted_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(name: String, visibility: Visibility) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            visibility,
            created_at: Utc::now(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
}

impl Message {
    pub fn new(sender: String, channel: String, body: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            channel,
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.sender == TOMBSTONE_SENDER
    }
}

/// Which codec produced a file payload. Decoding happens client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Raw,
    Huffman,
    Lzw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    /// Base64 of the encoded (and possibly encrypted) bytes.
    pub payload: String,
    pub encoding: Encoding,
    #[serde(default)]
    pub key_material: Option<String>,
    /// Hex SHA-256 of the decoded payload bytes.
    pub sha256: String,
}
