//! Data models for the shared memory pool

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Committed pool entry
///
/// Entries are replaced whole on every write; a reader holding an older
/// `Arc<PoolEntry>` keeps a consistent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub key: String,
    pub content: String,
    /// Starts at 1, +1 per committed write
    pub version: u64,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Pool-wide commit order, breaks `updated_at` ties
    pub sequence: u64,
}

impl PoolEntry {
    pub(crate) fn first(
        key: &str,
        content: String,
        writer_id: &str,
        metadata: HashMap<String, Value>,
        sequence: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            content,
            version: 1,
            created_by: writer_id.to_string(),
            updated_by: writer_id.to_string(),
            created_at: now,
            updated_at: now,
            metadata,
            sequence,
        }
    }

    /// Next version of this entry; metadata is shallow-merged
    pub(crate) fn successor(
        &self,
        content: String,
        writer_id: &str,
        metadata: HashMap<String, Value>,
        sequence: u64,
    ) -> Self {
        let mut merged = self.metadata.clone();
        merged.extend(metadata);
        Self {
            key: self.key.clone(),
            content,
            version: self.version + 1,
            created_by: self.created_by.clone(),
            updated_by: writer_id.to_string(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            metadata: merged,
            sequence,
        }
    }
}

/// Shared pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Version conflict on '{key}': expected version {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_successor_preserves_origin_and_merges_metadata() {
        let mut first_meta = HashMap::new();
        first_meta.insert("lang".to_string(), json!("rust"));
        first_meta.insert("status".to_string(), json!("draft"));
        let first = PoolEntry::first("plan", "v1".to_string(), "agent-a", first_meta, 1);

        let mut update = HashMap::new();
        update.insert("status".to_string(), json!("final"));
        let second = first.successor("v2".to_string(), "agent-b", update, 2);

        assert_eq!(second.version, 2);
        assert_eq!(second.created_by, "agent-a");
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.updated_by, "agent-b");
        assert_eq!(second.metadata["lang"], "rust");
        assert_eq!(second.metadata["status"], "final");
        assert_eq!(first.content, "v1");
    }
}
