use crate::planner::BuildPlan;
use foreman_core::{
    AgentRegistry, ForemanError, ForemanResult, Phase, SchedulerConfig, TelemetryEvent,
    TelemetrySink,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Live status of one queued agent. Transitions are forward-only:
/// `Queued → Running → {Completed, Failed}` (plus `Queued → Completed` via
/// [`BuildScheduler::skip_optional_agents`] and `Queued → Failed` via the
/// blocked-agent scan). There is no reuse without a full
/// [`BuildScheduler::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Waiting for capacity and dependencies.
    Queued,
    /// Dispatched to a worker.
    Running,
    /// Finished successfully (or skipped as optional).
    Completed,
    /// Terminal failure.
    Failed,
}

/// The scheduler's live record of one agent within a build.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    /// The agent this item tracks.
    pub agent_id: String,
    /// The phase it is scheduled in.
    pub phase: Phase,
    /// Dispatch priority: position in the plan (registration order).
    pub priority: usize,
    /// Ids this agent waits on.
    pub dependencies: Vec<String>,
    /// Whether failure of this agent is tolerated.
    pub optional: bool,
    /// Current status.
    pub status: AgentStatus,
    /// Why the agent failed, when it did.
    pub failure_reason: Option<String>,
}

/// Snapshot of queue-wide status counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Items still waiting.
    pub queued: usize,
    /// Items dispatched and not yet terminal.
    pub running: usize,
    /// Items finished successfully.
    pub completed: usize,
    /// Items terminally failed.
    pub failed: usize,
}

/// Dependency-aware execution queue for one build.
///
/// Owned aggregate: all mutation goes through explicit methods and the
/// caller provides the outer synchronization (the pipeline engine wraps
/// the scheduler in `Arc<RwLock<…>>`).
pub struct BuildScheduler {
    plan: BuildPlan,
    config: SchedulerConfig,
    items: HashMap<String, QueueItem>,
    order: Vec<String>,
    active_phase: Option<Phase>,
    running: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for BuildScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildScheduler")
            .field("plan", &self.plan)
            .field("config", &self.config)
            .field("items", &self.items)
            .field("order", &self.order)
            .field("active_phase", &self.active_phase)
            .field("running", &self.running)
            .field("completed", &self.completed)
            .field("failed", &self.failed)
            .finish()
    }
}

impl BuildScheduler {
    /// Build the live queue from a plan.
    ///
    /// Every plan member must resolve in the registry; a missing entry is a
    /// configuration error raised here, before anything runs.
    pub fn new(
        plan: BuildPlan,
        registry: &dyn AgentRegistry,
        config: SchedulerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> ForemanResult<Self> {
        let mut items = HashMap::new();
        let mut order = Vec::new();
        let mut priority = 0usize;

        for phase_plan in &plan.phases {
            for agent_id in &phase_plan.agent_ids {
                let agent = registry.get(agent_id).ok_or_else(|| {
                    ForemanError::Configuration(format!(
                        "plan references agent '{agent_id}' missing from the registry"
                    ))
                })?;
                items.insert(
                    agent_id.clone(),
                    QueueItem {
                        agent_id: agent_id.clone(),
                        phase: phase_plan.phase,
                        priority,
                        dependencies: agent.dependencies.clone(),
                        optional: agent.optional,
                        status: AgentStatus::Queued,
                        failure_reason: None,
                    },
                );
                order.push(agent_id.clone());
                priority += 1;
            }
        }

        Ok(Self {
            plan,
            config,
            items,
            order,
            active_phase: None,
            running: HashSet::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            telemetry,
        })
    }

    /// Select the phase dispatch considers.
    pub fn set_phase(&mut self, phase: Phase) {
        info!(phase = %phase, "scheduler phase set");
        self.active_phase = Some(phase);
    }

    /// The currently active phase.
    pub fn active_phase(&self) -> Option<Phase> {
        self.active_phase
    }

    /// The plan this queue was built from.
    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    /// Ids of agents that may start now: in the active phase, not yet
    /// started, dependencies resolved, within free capacity. For a
    /// non-parallel phase at most one id is returned, and none while a
    /// member of that phase is running.
    pub fn get_next_agents(&self) -> Vec<String> {
        let Some(phase) = self.active_phase else {
            return Vec::new();
        };
        let capacity = self
            .config
            .concurrency_limit
            .saturating_sub(self.running.len());
        if capacity == 0 {
            return Vec::new();
        }

        let parallel = self.plan.phase(phase).map_or(true, |p| p.parallel);
        if !parallel {
            let phase_running = self
                .running
                .iter()
                .filter(|id| self.items.get(*id).is_some_and(|i| i.phase == phase))
                .count();
            if phase_running > 0 {
                return Vec::new();
            }
        }

        let mut ready: Vec<&QueueItem> = self
            .items
            .values()
            .filter(|item| {
                item.phase == phase
                    && item.status == AgentStatus::Queued
                    && self.dependencies_resolved(item)
            })
            .collect();
        ready.sort_by_key(|item| item.priority);

        let take = if parallel { capacity } else { 1 };
        ready
            .into_iter()
            .take(take)
            .map(|item| item.agent_id.clone())
            .collect()
    }

    fn dependencies_resolved(&self, item: &QueueItem) -> bool {
        item.dependencies.iter().all(|dep| {
            match self.items.get(dep).map(|d| d.status) {
                Some(AgentStatus::Completed) => true,
                // Liveness over strictness: a crashed dependency unblocks
                // its dependents unless configured otherwise.
                Some(AgentStatus::Failed) => self.config.unblock_on_dependency_failure,
                _ => false,
            }
        })
    }

    /// Mark an agent as dispatched.
    pub fn start_agent(&mut self, agent_id: &str) -> ForemanResult<()> {
        if self.running.len() >= self.config.concurrency_limit {
            return Err(ForemanError::Scheduler(format!(
                "cannot start '{agent_id}': concurrency limit {} reached",
                self.config.concurrency_limit
            )));
        }
        let item = self.item_mut(agent_id)?;
        if item.status != AgentStatus::Queued {
            return Err(ForemanError::Scheduler(format!(
                "cannot start '{agent_id}' from status {:?}",
                item.status
            )));
        }
        item.status = AgentStatus::Running;
        self.running.insert(agent_id.to_string());
        Ok(())
    }

    /// Mark a running agent as completed.
    pub fn complete_agent(&mut self, agent_id: &str) -> ForemanResult<()> {
        let item = self.item_mut(agent_id)?;
        if item.status != AgentStatus::Running {
            return Err(ForemanError::Scheduler(format!(
                "cannot complete '{agent_id}' from status {:?}",
                item.status
            )));
        }
        item.status = AgentStatus::Completed;
        self.running.remove(agent_id);
        self.completed.insert(agent_id.to_string());
        Ok(())
    }

    /// Mark a running agent as terminally failed.
    pub fn fail_agent(&mut self, agent_id: &str, reason: impl Into<String>) -> ForemanResult<()> {
        let reason = reason.into();
        let item = self.item_mut(agent_id)?;
        if item.status != AgentStatus::Running {
            return Err(ForemanError::Scheduler(format!(
                "cannot fail '{agent_id}' from status {:?}",
                item.status
            )));
        }
        item.status = AgentStatus::Failed;
        item.failure_reason = Some(reason.clone());
        let optional = item.optional;
        self.running.remove(agent_id);
        self.failed.insert(agent_id.to_string());
        warn!(agent_id = %agent_id, optional, reason = %reason, "agent failed");
        Ok(())
    }

    /// True iff every agent in the active phase is completed, or failed
    /// while optional. A failed required agent keeps the phase incomplete.
    pub fn is_phase_complete(&self) -> bool {
        let Some(phase) = self.active_phase else {
            return true;
        };
        self.items
            .values()
            .filter(|item| item.phase == phase)
            .all(|item| match item.status {
                AgentStatus::Completed => true,
                AgentStatus::Failed => item.optional,
                _ => false,
            })
    }

    /// True iff every non-optional agent in the whole plan has completed.
    pub fn is_complete(&self) -> bool {
        let required_total = self.items.values().filter(|i| !i.optional).count();
        let required_completed = self
            .items
            .values()
            .filter(|i| !i.optional && i.status == AgentStatus::Completed)
            .count();
        required_completed >= required_total
    }

    /// True iff any non-optional agent has failed.
    pub fn has_critical_failure(&self) -> bool {
        self.failed
            .iter()
            .any(|id| self.items.get(id).is_some_and(|i| !i.optional))
    }

    /// Agents in the active phase that can never become ready: a transitive
    /// dependency of theirs was never enqueued (pruned from the plan) and
    /// so will never complete nor fail.
    pub fn get_blocked_agents(&self) -> Vec<String> {
        let Some(phase) = self.active_phase else {
            return Vec::new();
        };
        let mut blocked: Vec<&QueueItem> = self
            .items
            .values()
            .filter(|item| {
                item.phase == phase
                    && item.status == AgentStatus::Queued
                    && self
                        .find_missing_dependency(&item.agent_id, &mut HashSet::new())
                        .is_some()
            })
            .collect();
        blocked.sort_by_key(|item| item.priority);
        blocked.into_iter().map(|i| i.agent_id.clone()).collect()
    }

    fn find_missing_dependency(
        &self,
        agent_id: &str,
        seen: &mut HashSet<String>,
    ) -> Option<String> {
        if !seen.insert(agent_id.to_string()) {
            return None;
        }
        let item = self.items.get(agent_id)?;
        for dep in &item.dependencies {
            match self.items.get(dep) {
                None => return Some(dep.clone()),
                Some(dep_item) => match dep_item.status {
                    AgentStatus::Completed | AgentStatus::Failed => {}
                    _ => {
                        if let Some(missing) = self.find_missing_dependency(dep, seen) {
                            return Some(missing);
                        }
                    }
                },
            }
        }
        None
    }

    /// Force-fail every blocked agent so the phase can resolve. Each forced
    /// failure is logged and emitted as a telemetry event. Returns the
    /// force-failed ids.
    pub fn mark_blocked_as_failed(&mut self) -> Vec<String> {
        // Resolve the culprit dependency for every blocked agent before any
        // forced failure mutates the statuses the scan walks.
        let blocked: Vec<(String, String)> = self
            .get_blocked_agents()
            .into_iter()
            .map(|agent_id| {
                let missing = self
                    .find_missing_dependency(&agent_id, &mut HashSet::new())
                    .unwrap_or_else(|| "unknown".to_string());
                (agent_id, missing)
            })
            .collect();
        for (agent_id, missing) in &blocked {
            let reason = format!("dependency '{missing}' will never be scheduled");
            if let Some(item) = self.items.get_mut(agent_id) {
                item.status = AgentStatus::Failed;
                item.failure_reason = Some(reason.clone());
                self.failed.insert(agent_id.clone());
                warn!(
                    agent_id = %agent_id,
                    phase = %item.phase,
                    reason = %reason,
                    "force-failing blocked agent"
                );
                self.telemetry.emit(TelemetryEvent::DeadlockFailure {
                    agent_id: agent_id.clone(),
                    phase: item.phase.to_string(),
                    reason,
                });
            }
        }
        blocked.into_iter().map(|(agent_id, _)| agent_id).collect()
    }

    /// Coarse progress: completed items over total items, as a percentage.
    /// Not cost-weighted.
    pub fn get_progress(&self) -> f64 {
        if self.items.is_empty() {
            return 100.0;
        }
        (self.completed.len() as f64 / self.items.len() as f64) * 100.0
    }

    /// Bulk-complete every queued optional agent, fast-forwarding
    /// non-critical stages. Returns how many were skipped.
    pub fn skip_optional_agents(&mut self) -> usize {
        let mut skipped = 0;
        for agent_id in &self.order {
            if let Some(item) = self.items.get_mut(agent_id) {
                if item.optional && item.status == AgentStatus::Queued {
                    item.status = AgentStatus::Completed;
                    self.completed.insert(agent_id.clone());
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            info!(skipped, "skipped optional agents");
        }
        skipped
    }

    /// Clear all live state and rebuild the queue from the plan.
    pub fn reset(&mut self) {
        for item in self.items.values_mut() {
            item.status = AgentStatus::Queued;
            item.failure_reason = None;
        }
        self.running.clear();
        self.completed.clear();
        self.failed.clear();
        self.active_phase = None;
        info!("scheduler reset");
    }

    /// Status counts across the whole queue.
    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            queued: self
                .items
                .values()
                .filter(|i| i.status == AgentStatus::Queued)
                .count(),
            running: self.running.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
        }
    }

    /// One item by agent id.
    pub fn item(&self, agent_id: &str) -> Option<&QueueItem> {
        self.items.get(agent_id)
    }

    /// Ids of failed agents, in plan order.
    pub fn failed_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.failed.contains(*id))
            .cloned()
            .collect()
    }

    fn item_mut(&mut self, agent_id: &str) -> ForemanResult<&mut QueueItem> {
        self.items
            .get_mut(agent_id)
            .ok_or_else(|| ForemanError::Scheduler(format!("unknown agent '{agent_id}'")))
    }
}
