//! Change notifications emitted by the remote file store.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Kind of change observed on a remote path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    Add,
    Modify,
    Delete,
}

impl WatchEventKind {
    /// Maps the wire vocabulary (`added`, `modified`, `deleted`) onto event kinds.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "added" => Some(Self::Add),
            "modified" => Some(Self::Modify),
            "deleted" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Immutable fact about a remote change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: WatchEventKind,
    pub path: String,
    /// Monotonic change timestamp in milliseconds.
    pub ctime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_wire_vocabulary() {
        assert_eq!(WatchEventKind::from_wire("added"), Some(WatchEventKind::Add));
        assert_eq!(WatchEventKind::from_wire("modified"), Some(WatchEventKind::Modify));
        assert_eq!(WatchEventKind::from_wire("deleted"), Some(WatchEventKind::Delete));
        assert_eq!(WatchEventKind::from_wire("renamed"), None);
    }
}
