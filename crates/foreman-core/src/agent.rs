use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Static description of one unit of work in the pipeline.
///
/// Definitions are loaded once into a registry and are immutable for the
/// duration of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent id within the registry.
    pub id: String,
    /// The build phase this agent belongs to.
    pub phase: Phase,
    /// Ids of agents that must resolve before this one may start.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional agents may fail (or be skipped) without blocking phase or
    /// build completion.
    #[serde(default)]
    pub optional: bool,
    /// Per-invocation timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry budget owned by the execution collaborator, not the scheduler.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    2
}

impl AgentDefinition {
    /// Creates a required agent with no dependencies and default limits.
    pub fn new(id: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: id.into(),
            phase,
            dependencies: Vec::new(),
            optional: false,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    /// Sets the dependency list.
    pub fn with_dependencies(mut self, deps: Vec<impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Marks this agent as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the per-invocation timeout.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Sets the collaborator-owned retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// The per-invocation timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Lookup contract over registered agent definitions.
///
/// The scheduler and planner only ever see this trait; concrete storage is
/// the caller's concern.
pub trait AgentRegistry: Send + Sync {
    /// Look up one agent by id.
    fn get(&self, id: &str) -> Option<&AgentDefinition>;
    /// All registered agents, in registration order.
    fn all(&self) -> &[AgentDefinition];
}

/// In-memory registry preserving registration order.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    agents: Vec<AgentDefinition>,
    index: HashMap<String, usize>,
}

impl StaticRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent definition. A duplicate id replaces the earlier
    /// definition in place, keeping its registration position.
    pub fn register(&mut self, agent: AgentDefinition) {
        match self.index.get(&agent.id).copied() {
            Some(pos) => {
                warn!(agent_id = %agent.id, "Replacing existing agent definition");
                self.agents[pos] = agent;
            }
            None => {
                info!(agent_id = %agent.id, phase = %agent.phase, "Registered agent");
                self.index.insert(agent.id.clone(), self.agents.len());
                self.agents.push(agent);
            }
        }
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl AgentRegistry for StaticRegistry {
    fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.index.get(id).map(|&pos| &self.agents[pos])
    }

    fn all(&self) -> &[AgentDefinition] {
        &self.agents
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_builder() {
        let agent = AgentDefinition::new("copywriter", Phase::Content)
            .with_dependencies(vec!["sitemap"])
            .optional()
            .with_timeout_ms(5_000)
            .with_max_retries(1);

        assert_eq!(agent.id, "copywriter");
        assert_eq!(agent.phase, Phase::Content);
        assert_eq!(agent.dependencies, vec!["sitemap".to_string()]);
        assert!(agent.optional);
        assert_eq!(agent.timeout(), Duration::from_millis(5_000));
        assert_eq!(agent.max_retries, 1);
    }

    #[test]
    fn test_registry_preserves_registration_order() {
        let mut registry = StaticRegistry::new();
        registry.register(AgentDefinition::new("b", Phase::Content));
        registry.register(AgentDefinition::new("a", Phase::Content));
        registry.register(AgentDefinition::new("c", Phase::Assembly));

        let ids: Vec<&str> = registry.all().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = StaticRegistry::new();
        registry.register(AgentDefinition::new("hero", Phase::Content));

        assert!(registry.get("hero").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_id_replaces_in_place() {
        let mut registry = StaticRegistry::new();
        registry.register(AgentDefinition::new("x", Phase::Content));
        registry.register(AgentDefinition::new("y", Phase::Content));
        registry.register(AgentDefinition::new("x", Phase::Review));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("x").unwrap().phase, Phase::Review);
        // Registration order unchanged by the replacement.
        assert_eq!(registry.all()[0].id, "x");
    }

    #[test]
    fn test_definition_serde_defaults() {
        let json = r#"{"id": "seo", "phase": "enhancement"}"#;
        let agent: AgentDefinition = serde_json::from_str(json).unwrap();
        assert!(!agent.optional);
        assert!(agent.dependencies.is_empty());
        assert_eq!(agent.timeout_ms, 60_000);
        assert_eq!(agent.max_retries, 2);
    }
}
