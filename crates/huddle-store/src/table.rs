use serde::Serialize;
use serde::de::DeserializeOwned;

use huddle_types::models::{Channel, FileAttachment, Message, User};

/// The four durable collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Channels,
    Messages,
    Files,
}

/// How an indexed table derives the partition a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    /// First character of the primary key.
    FirstChar,
    /// The record's channel id.
    Channel,
}

/// Fixed descriptor of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub index: Option<IndexKey>,
}

impl TableSpec {
    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }
}

impl Table {
    pub fn spec(self) -> TableSpec {
        match self {
            Table::Users => TableSpec {
                name: "users",
                primary_key: "email",
                index: Some(IndexKey::FirstChar),
            },
            Table::Channels => TableSpec {
                name: "channels",
                primary_key: "id",
                index: None,
            },
            Table::Messages => TableSpec {
                name: "messages",
                primary_key: "id",
                index: Some(IndexKey::Channel),
            },
            Table::Files => TableSpec {
                name: "files",
                primary_key: "id",
                index: None,
            },
        }
    }
}

/// A record kind stored in exactly one table.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn key(&self) -> &str;

    /// Partition value for indexed tables, `None` otherwise.
    fn partition(&self) -> Option<String>;
}

/// Partition implied by a primary key alone, if the table is indexed by key.
pub fn partition_for_key(table: Table, key: &str) -> Option<String> {
    match table.spec().index {
        Some(IndexKey::FirstChar) => Some(first_char_partition(key)),
        _ => None,
    }
}

fn first_char_partition(key: &str) -> String {
    key.chars()
        .next()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric())
        .map(String::from)
        .unwrap_or_else(|| "_".to_string())
}

/// Map a partition value onto a safe file stem.
pub(crate) fn sanitize_partition(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

impl Record for User {
    const TABLE: Table = Table::Users;

    fn key(&self) -> &str {
        &self.email
    }

    fn partition(&self) -> Option<String> {
        Some(first_char_partition(&self.email))
    }
}

impl Record for Channel {
    const TABLE: Table = Table::Channels;

    fn key(&self) -> &str {
        &self.id
    }

    fn partition(&self) -> Option<String> {
        None
    }
}

impl Record for Message {
    const TABLE: Table = Table::Messages;

    fn key(&self) -> &str {
        &self.id
    }

    fn partition(&self) -> Option<String> {
        Some(self.channel.clone())
    }
}

impl Record for FileAttachment {
    const TABLE: Table = Table::Files;

    fn key(&self) -> &str {
        &self.id
    }

    fn partition(&self) -> Option<String> {
        None
    }
}
