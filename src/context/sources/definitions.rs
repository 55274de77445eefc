//! Tool and skill definition sources

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::{call_collaborator, names, pack_greedy, Candidate, ContextSource, SourceError};
use crate::context::accountant::TokenAccountant;
use crate::context::models::{ContextBlock, Role};
use crate::providers::{SkillRegistry, ToolManager, ToolSpec};

/// Tool definitions relevant to the query
///
/// Relevance is the share of query words that also appear in the tool's name
/// or description; tools with no overlap are left out.
pub struct ToolDefinitionSource {
    manager: Arc<dyn ToolManager>,
    timeout: Option<Duration>,
}

impl ToolDefinitionSource {
    pub const PRIORITY_SCALE: f64 = 0.8;

    pub fn new(manager: Arc<dyn ToolManager>) -> Self {
        Self {
            manager,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of query words found in the tool's name and description
pub(crate) fn keyword_overlap(query: &str, tool: &ToolSpec) -> f64 {
    let query_words = words(query);
    if query_words.is_empty() {
        return 0.0;
    }
    let tool_words = words(&format!("{} {}", tool.name, tool.description));
    let overlap = query_words.intersection(&tool_words).count();
    overlap as f64 / query_words.len() as f64
}

fn render_tool(tool: &ToolSpec) -> String {
    let mut text = format!("Tool: {}\nDescription: {}", tool.name, tool.description);
    if !tool.input_schema.is_null() {
        text.push_str(&format!("\nInput schema: {}", tool.input_schema));
    }
    text
}

#[async_trait]
impl ContextSource for ToolDefinitionSource {
    fn name(&self) -> &str {
        names::TOOLS
    }

    async fn collect(
        &self,
        query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let tools = call_collaborator(self.timeout, self.manager.list_tools()).await?;

        let mut scored: Vec<(f64, ToolSpec)> = tools
            .into_iter()
            .map(|tool| (keyword_overlap(query, &tool), tool))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let candidates = scored.into_iter().map(|(score, tool)| {
            Candidate::new(render_tool(&tool), Role::System, Self::PRIORITY_SCALE * score)
                .meta("tool", tool.name)
                .meta("overlap", score)
        });
        pack_greedy(names::TOOLS, candidates, token_budget, accountant, false)
    }
}

/// Instructions of explicitly activated skills
pub struct SkillDefinitionSource {
    registry: Arc<dyn SkillRegistry>,
    active: RwLock<Vec<String>>,
    timeout: Option<Duration>,
}

impl SkillDefinitionSource {
    pub const PRIORITY: f64 = 0.85;

    pub fn new(registry: Arc<dyn SkillRegistry>, active: Vec<String>) -> Self {
        Self {
            registry,
            active: RwLock::new(active),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn activate(&self, skill_id: impl Into<String>) {
        let skill_id = skill_id.into();
        let mut active = self.active.write().await;
        if !active.contains(&skill_id) {
            active.push(skill_id);
        }
    }

    pub async fn deactivate(&self, skill_id: &str) {
        self.active.write().await.retain(|id| id != skill_id);
    }
}

#[async_trait]
impl ContextSource for SkillDefinitionSource {
    fn name(&self) -> &str {
        names::SKILLS
    }

    async fn collect(
        &self,
        _query: &str,
        token_budget: usize,
        accountant: &TokenAccountant,
        _min_relevance: f64,
    ) -> Result<Vec<ContextBlock>, SourceError> {
        let active = self.active.read().await.clone();

        let mut candidates = Vec::with_capacity(active.len());
        for skill_id in &active {
            match call_collaborator(self.timeout, self.registry.get_skill(skill_id)).await? {
                Some(skill) => candidates.push(
                    Candidate::new(
                        format!("Skill: {}\n{}", skill.name, skill.instructions),
                        Role::System,
                        Self::PRIORITY,
                    )
                    .meta("skill_id", skill.id),
                ),
                None => debug!("Active skill {} not found in registry", skill_id),
            }
        }

        pack_greedy(names::SKILLS, candidates, token_budget, accountant, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderError, SkillDefinition};
    use serde_json::json;

    struct FixedTools(Vec<ToolSpec>);

    #[async_trait]
    impl ToolManager for FixedTools {
        async fn list_tools(&self) -> Result<Vec<ToolSpec>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    struct OneSkill;

    #[async_trait]
    impl SkillRegistry for OneSkill {
        async fn get_skill(&self, id: &str) -> Result<Option<SkillDefinition>, ProviderError> {
            Ok((id == "review").then(|| SkillDefinition {
                id: "review".to_string(),
                name: "Code review".to_string(),
                instructions: "Check error handling first.".to_string(),
            }))
        }
    }

    fn tool(name: &str, description: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_keyword_overlap() {
        let grep = tool("grep_files", "Search files for a pattern");
        assert_eq!(keyword_overlap("search files", &grep), 1.0);
        assert_eq!(keyword_overlap("search the web", &grep), 1.0 / 3.0);
        assert_eq!(keyword_overlap("", &grep), 0.0);
    }

    #[tokio::test]
    async fn test_tools_scored_and_filtered() {
        let manager = Arc::new(FixedTools(vec![
            tool("weather", "Look up the weather forecast"),
            tool("grep_files", "Search files for a pattern"),
            tool("shell", "Run a shell command"),
        ]));
        let source = ToolDefinitionSource::new(manager);
        let accountant = TokenAccountant::estimating(100);

        let blocks = source.collect("search files", 1000, &accountant, 0.0).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].metadata()["tool"], "grep_files");
        assert!((blocks[0].priority() - 0.8).abs() < 1e-9);
        assert!(!blocks[0].is_compressible());
        assert!(blocks[0].content().contains("Input schema"));
    }

    #[tokio::test]
    async fn test_skills_fixed_priority_and_activation() {
        let source = SkillDefinitionSource::new(Arc::new(OneSkill), vec!["review".to_string()]);
        source.activate("unknown").await;
        let accountant = TokenAccountant::estimating(100);

        let blocks = source.collect("anything", 1000, &accountant, 0.99).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].priority(), 0.85);
        assert!(!blocks[0].is_compressible());
        assert!(blocks[0].content().starts_with("Skill: Code review"));

        source.deactivate("review").await;
        assert!(source.collect("q", 1000, &accountant, 0.0).await.unwrap().is_empty());
    }
}
