//! Working memory: the agent's task-scoped scratchpad
//!
//! An owned arena of keyed notes with a fixed capacity. Inserting into a full
//! arena evicts the least recently used entry; reading through `touch` or
//! overwriting an entry marks it as recently used.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One working memory note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemoryEntry {
    pub key: String,
    pub content: String,
    /// Importance (0.0-1.0), used as block priority
    pub importance: f64,
    pub touched_at: DateTime<Utc>,
}

/// Fixed-capacity LRU arena
///
/// Recency is the position in the map: the back is most recent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    entries: IndexMap<String, WorkingMemoryEntry>,
    capacity: usize,
}

impl WorkingMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert or replace a note, returning the evicted entry if any
    pub fn put(
        &mut self,
        key: impl Into<String>,
        content: impl Into<String>,
        importance: f64,
    ) -> Option<WorkingMemoryEntry> {
        let key = key.into();
        let entry = WorkingMemoryEntry {
            key: key.clone(),
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
            touched_at: Utc::now(),
        };

        self.entries.shift_remove(&key);
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0).map(|(_, e)| e)
        } else {
            None
        };
        self.entries.insert(key, entry);
        evicted
    }

    /// Mark a note as used and return it
    pub fn touch(&mut self, key: &str) -> Option<&WorkingMemoryEntry> {
        let mut entry = self.entries.shift_remove(key)?;
        entry.touched_at = Utc::now();
        self.entries.insert(key.to_string(), entry);
        self.entries.get(key)
    }

    /// Read a note without affecting recency
    pub fn get(&self, key: &str) -> Option<&WorkingMemoryEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<WorkingMemoryEntry> {
        self.entries.shift_remove(key)
    }

    /// All notes, most recently used first
    pub fn snapshot(&self) -> Vec<WorkingMemoryEntry> {
        self.entries.values().rev().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(64)
    }
}
