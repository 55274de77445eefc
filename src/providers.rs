//! External collaborator interfaces consumed by context sources
//!
//! Only the call shapes live here; storage, retrieval and registries are
//! implemented elsewhere and injected at construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Collaborator failure
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

/// One knowledge base retrieval hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub id: String,
    pub content: String,
    pub source: String,
    /// Retrieval relevance (0.0-1.0)
    pub relevance: f64,
}

/// Retrieval-augmented knowledge base
#[async_trait]
pub trait KnowledgeBaseProvider: Send + Sync {
    async fn query(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeHit>, ProviderError>;
}

/// Long-term memory record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    /// Stored importance (nominally 0.0-1.0)
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistent memory backend
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn query_by_text(
        &self,
        query: &str,
        limit: usize,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>, ProviderError>;

    async fn query_by_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryRecord>, ProviderError>;

    async fn save(&self, record: MemoryRecord) -> Result<String, ProviderError>;

    async fn delete(&self, id: &str) -> Result<bool, ProviderError>;

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<MemoryRecord>, ProviderError>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MemoryRecord>, ProviderError>;
}

/// Full skill definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub id: String,
    pub name: String,
    pub instructions: String,
}

/// Skill lookup
#[async_trait]
pub trait SkillRegistry: Send + Sync {
    async fn get_skill(&self, id: &str) -> Result<Option<SkillDefinition>, ProviderError>;
}

/// Skill lookup for registries without async I/O
pub trait BlockingSkillRegistry: Send + Sync {
    fn get_skill(&self, id: &str) -> Result<Option<SkillDefinition>, ProviderError>;
}

/// Presents a [`BlockingSkillRegistry`] as a [`SkillRegistry`]
pub struct SyncSkillRegistryAdapter<R> {
    inner: Arc<R>,
}

impl<R: BlockingSkillRegistry + 'static> SyncSkillRegistryAdapter<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl<R: BlockingSkillRegistry + 'static> SkillRegistry for SyncSkillRegistryAdapter<R> {
    /// Runs the lookup on the blocking pool so sibling sources keep making progress
    async fn get_skill(&self, id: &str) -> Result<Option<SkillDefinition>, ProviderError> {
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || inner.get_skill(&id))
            .await
            .map_err(|e| ProviderError::Upstream(format!("Skill lookup task failed: {}", e)))?
    }
}

/// Tool metadata exposed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Tool catalog
#[async_trait]
pub trait ToolManager: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ProviderError>;
}

/// Event published to an [`EventBus`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Best-effort event sink
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<(), ProviderError>;
}
