use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Topic exchange carrying row-level change events from the relational store.
///
/// Routing key format: `fieldhub.db.{table}.{operation}`
/// Example: `fieldhub.db.message_notifications.insert`
pub const CHANGE_EXCHANGE: &str = "fieldhub.changes";

/// Row operation reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key a change on `table` is published under.
pub fn change_routing_key(table: &str, operation: ChangeOperation) -> String {
    format!("fieldhub.db.{table}.{}", operation.as_str())
}

/// One row change as delivered by the feed. Consumed once, never stored.
///
/// ```json
/// {
///   "table": "message_notifications",
///   "type":  "INSERT",
///   "new":   { "id": "...", "sender_id": "...", "message_id": "..." }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChangeEvent {
    pub table: String,
    #[serde(rename = "type", alias = "operation")]
    pub operation: ChangeOperation,
    #[serde(rename = "new", default)]
    pub new_row: Map<String, Value>,
}

impl RawChangeEvent {
    pub fn insert(table: impl Into<String>, new_row: Map<String, Value>) -> Self {
        Self {
            table: table.into(),
            operation: ChangeOperation::Insert,
            new_row,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Value> {
        self.new_row.get(name)
    }

    /// Column rendered as text; numbers and booleans are stringified so that
    /// predicates can compare any scalar column against a string value.
    pub fn text_column(&self, name: &str) -> Option<String> {
        match self.column(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Column parsed as a UUID. Missing, null or malformed values yield `None`.
    pub fn uuid_column(&self, name: &str) -> Option<Uuid> {
        self.column(name)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}
