//! Events - coordination store のキー変更通知

use serde::{Deserialize, Serialize};

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEventKind {
    /// A hash field was written.
    HashSet,
    /// A hash field was removed.
    HashDeleted,
    /// The whole key was removed (explicitly or because its last field went away).
    Deleted,
    /// The key's TTL ran out.
    Expired,
}

/// Notification delivered to subscribers of `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub kind: KeyEventKind,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>, kind: KeyEventKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }
}
