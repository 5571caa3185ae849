use foreman_core::{AgentRegistry, ForemanError, ForemanResult, Phase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// One phase of a build plan: its member agent ids in registration order
/// and whether they may be dispatched concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    /// The phase.
    pub phase: Phase,
    /// Member agent ids, in registration order.
    pub agent_ids: Vec<String>,
    /// Whether members may run concurrently.
    pub parallel: bool,
}

/// The ordered execution blueprint for one build. Created once by the
/// [`Planner`], read-only afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Non-empty phases in [`Phase::ORDER`] order.
    pub phases: Vec<PhasePlan>,
}

impl BuildPlan {
    /// Total number of agents across all phases.
    pub fn agent_count(&self) -> usize {
        self.phases.iter().map(|p| p.agent_ids.len()).sum()
    }

    /// The plan for one phase, if it has members.
    pub fn phase(&self, phase: Phase) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Converts an agent registry into a [`BuildPlan`].
///
/// Pure transform, no execution. Configuration problems (unknown or cyclic
/// dependencies, dependencies on later phases) are rejected here, before
/// any scheduling begins.
pub struct Planner;

impl Planner {
    /// Build the plan for the given registry.
    pub fn build_plan(registry: &dyn AgentRegistry) -> ForemanResult<BuildPlan> {
        Self::validate(registry)?;

        let mut phases = Vec::new();
        for phase in Phase::ORDER {
            let agent_ids: Vec<String> = registry
                .all()
                .iter()
                .filter(|a| a.phase == phase)
                .map(|a| a.id.clone())
                .collect();
            if agent_ids.is_empty() {
                continue;
            }
            phases.push(PhasePlan {
                phase,
                agent_ids,
                parallel: phase.is_parallel(),
            });
        }

        let plan = BuildPlan { phases };
        info!(
            phases = plan.phases.len(),
            agents = plan.agent_count(),
            "build plan created"
        );
        Ok(plan)
    }

    fn validate(registry: &dyn AgentRegistry) -> ForemanResult<()> {
        for agent in registry.all() {
            for dep in &agent.dependencies {
                let Some(dep_agent) = registry.get(dep) else {
                    return Err(ForemanError::Configuration(format!(
                        "agent '{}' depends on unknown agent '{dep}'",
                        agent.id
                    )));
                };
                if dep_agent.phase.position() > agent.phase.position() {
                    return Err(ForemanError::Configuration(format!(
                        "agent '{}' in phase {} depends on '{dep}' in later phase {}",
                        agent.id, agent.phase, dep_agent.phase
                    )));
                }
            }
        }

        // Cycle check over the dependency graph.
        let mut visited: HashMap<&str, u8> = HashMap::new();
        for agent in registry.all() {
            if let Some(cycle_member) = Self::dfs_cycle(registry, &agent.id, &mut visited) {
                return Err(ForemanError::Configuration(format!(
                    "dependency cycle involving agent '{cycle_member}'"
                )));
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        registry: &'a dyn AgentRegistry,
        id: &'a str,
        visited: &mut HashMap<&'a str, u8>,
    ) -> Option<String> {
        match visited.get(id) {
            Some(1) => return Some(id.to_string()), // back edge
            Some(2) => return None,                 // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(agent) = registry.get(id) {
            for dep in &agent.dependencies {
                if let Some(found) = Self::dfs_cycle(registry, dep, visited) {
                    return Some(found);
                }
            }
        }
        visited.insert(id, 2);
        None
    }
}
