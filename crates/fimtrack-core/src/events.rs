//! File-event domain model
//!
//! Events originate as string-keyed rows from the query engine's
//! `file_events` table and are normalized into [`FileEvent`] before they
//! cross the HTTP or storage boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of file change reported by an event source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Created,
    Modified,
    Removed,
    Renamed,
    Unknown,
}

impl FileOperation {
    /// Map an engine `action` column value onto an operation kind.
    ///
    /// The engine reports inotify-style actions (`CREATED`, `UPDATED`,
    /// `MOVED_TO`, ...); anything unrecognized becomes `Unknown` rather
    /// than an error so a single odd row never poisons a whole batch.
    pub fn from_action(action: &str) -> Self {
        match action.to_ascii_uppercase().as_str() {
            "CREATED" | "CREATE" => FileOperation::Created,
            "UPDATED" | "MODIFIED" | "ATTRIBUTES_MODIFIED" => FileOperation::Modified,
            "DELETED" | "REMOVED" => FileOperation::Removed,
            "MOVED_TO" | "MOVED_FROM" | "RENAMED" => FileOperation::Renamed,
            _ => FileOperation::Unknown,
        }
    }
}

/// A single reported file change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileEvent {
    pub path: String,
    pub operation: FileOperation,
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    /// Build a `FileEvent` from a raw engine row.
    ///
    /// Returns `None` if the row carries no usable path. The `time` column
    /// may arrive as a JSON string or number of unix seconds; an absent or
    /// malformed value maps to the epoch so the event is still preserved.
    pub fn from_row(row: &serde_json::Map<String, Value>) -> Option<Self> {
        let path = row
            .get("target_path")
            .or_else(|| row.get("path"))
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())?
            .to_string();

        let operation = row
            .get("action")
            .and_then(Value::as_str)
            .map(FileOperation::from_action)
            .unwrap_or(FileOperation::Unknown);

        let secs = match row.get("time") {
            Some(Value::String(s)) => s.parse::<i64>().unwrap_or(0),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            _ => 0,
        };
        let timestamp = DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now);

        Some(Self {
            path,
            operation,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().expect("test row is an object")
    }

    #[test]
    fn test_from_action_known_values() {
        assert_eq!(FileOperation::from_action("CREATED"), FileOperation::Created);
        assert_eq!(FileOperation::from_action("UPDATED"), FileOperation::Modified);
        assert_eq!(FileOperation::from_action("DELETED"), FileOperation::Removed);
        assert_eq!(FileOperation::from_action("MOVED_TO"), FileOperation::Renamed);
        assert_eq!(FileOperation::from_action("moved_from"), FileOperation::Renamed);
    }

    #[test]
    fn test_from_action_unknown_value() {
        assert_eq!(FileOperation::from_action("OPENED"), FileOperation::Unknown);
        assert_eq!(FileOperation::from_action(""), FileOperation::Unknown);
    }

    #[test]
    fn test_from_row_full() {
        let row = row(json!({
            "target_path": "/home/user/notes.txt",
            "action": "UPDATED",
            "time": "1700000000"
        }));

        let event = FileEvent::from_row(&row).expect("row has a path");
        assert_eq!(event.path, "/home/user/notes.txt");
        assert_eq!(event.operation, FileOperation::Modified);
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_from_row_numeric_time_and_path_fallback() {
        let row = row(json!({
            "path": "/etc/hosts",
            "action": "CREATED",
            "time": 1700000001
        }));

        let event = FileEvent::from_row(&row).expect("row has a path");
        assert_eq!(event.path, "/etc/hosts");
        assert_eq!(event.operation, FileOperation::Created);
        assert_eq!(event.timestamp.timestamp(), 1_700_000_001);
    }

    #[test]
    fn test_from_row_missing_path() {
        let row = row(json!({ "action": "CREATED", "time": "12" }));
        assert!(FileEvent::from_row(&row).is_none());
    }

    #[test]
    fn test_operation_serializes_lowercase() {
        let op = serde_json::to_string(&FileOperation::Renamed).unwrap();
        assert_eq!(op, "\"renamed\"");
    }
}
