//! Row shapes persisted by the cache store and carried in remote snapshots.
//! Collection fields are typed here and serialised as JSON inside the row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Label that marks a message as read.
pub const SEEN_LABEL: &str = "\\Seen";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub folder: String,
    pub subject: String,
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Derived thread identifier. Starts as the provider thread id (or the
    /// message id) and is rewritten by the thread builder.
    pub thread_id: String,
    #[serde(default)]
    pub provider_thread_id: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Seconds since the previous message in the same thread.
    #[serde(default)]
    pub response_time: Option<f64>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl MessageRecord {
    pub fn sender_address(&self) -> String {
        extract_address(&self.sender)
    }

    pub fn sender_domain(&self) -> Option<String> {
        let addr = self.sender_address();
        addr.rsplit_once('@')
            .map(|(_, domain)| domain.to_string())
            .filter(|d| !d.is_empty())
    }

    pub fn is_read(&self) -> bool {
        self.labels.contains(SEEN_LABEL)
    }
}

/// Pull the bare lower-cased address out of `Name <addr>` forms.
pub fn extract_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed,
    };
    inner.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub subject: String,
    pub participants: BTreeSet<String>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    /// Member ids ordered by (timestamp, id).
    pub message_ids: Vec<String>,
    pub avg_response_time: Option<f64>,
    pub active: bool,
    pub importance: Option<f64>,
    pub category: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

/// One smart-folder rule as stored. Field and operator stay as text so a row
/// written by a newer build still loads; `rules::compile_rule` checks them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub field: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartFolderRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rules: Vec<RuleDef>,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_applied: Option<DateTime<Utc>>,
    #[serde(default)]
    pub match_count: usize,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SmartFolderRecord {
    /// Reference point for expiry and merge ordering.
    pub fn touched_at(&self) -> DateTime<Utc> {
        self.last_applied.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessingState {
    pub folder: String,
    #[serde(default)]
    pub last_message_id: Option<String>,
    #[serde(default)]
    pub last_processed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub sync_token: Option<String>,
}

/// The whole store as one document, rows in key order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    #[serde(default)]
    pub analysis_fingerprint: Option<String>,
    pub messages: Vec<MessageRecord>,
    pub threads: Vec<ThreadRecord>,
    pub smart_folders: Vec<SmartFolderRecord>,
    pub processing_state: Vec<ProcessingState>,
}

pub const SNAPSHOT_VERSION: u32 = 1;

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.threads.is_empty()
            && self.smart_folders.is_empty()
            && self.processing_state.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_address() {
        assert_eq!(extract_address("Boss <Boss@X.com>"), "boss@x.com");
        assert_eq!(extract_address("  plain@example.org "), "plain@example.org");
        assert_eq!(extract_address("\"Weird <name\" <a@b.c>"), "a@b.c");
    }

    #[test]
    fn test_smart_folder_row_defaults() {
        let row = r#"{"name":"vip","rules":[{"field":"from","operator":"contains","value":"boss"}],"created_at":"2025-01-01T00:00:00Z"}"#;
        let folder: SmartFolderRecord = serde_json::from_str(row).unwrap();
        assert!(folder.active);
        assert_eq!(folder.match_count, 0);
        assert_eq!(folder.touched_at(), folder.created_at);
    }
}
