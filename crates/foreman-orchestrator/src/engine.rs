use crate::monitor::AgentMonitor;
use crate::planner::BuildPlan;
use crate::scheduler::BuildScheduler;
use async_trait::async_trait;
use foreman_core::{
    AgentDefinition, AgentRegistry, ForemanConfig, ForemanError, ForemanResult, Phase,
    TelemetrySink,
};
use foreman_resilience::CircuitBreaker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Execution collaborator for agent bodies.
///
/// Implementations own the agent's retry budget (`max_retries`): by the
/// time a call returns, transient errors have been retried and the engine
/// only ever sees success or terminal failure.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run one agent against the build context.
    async fn execute(&self, agent: &AgentDefinition, context: Value) -> ForemanResult<Value>;
}

/// Result of a full pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// Unique id of this run.
    pub build_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// One-line human summary.
    pub summary: String,
    /// Queue size across all phases.
    pub total_agents: usize,
    /// Agents that finished successfully.
    pub completed_agents: usize,
    /// Failed agent ids, in plan order.
    pub failed_agents: Vec<String>,
    /// Coarse completion percentage.
    pub progress_percent: f64,
    /// Whether every non-optional agent completed.
    pub complete: bool,
    /// Whether any non-optional agent failed.
    pub has_critical_failure: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Output payload per completed agent.
    pub outputs: HashMap<String, Value>,
}

struct Completion {
    agent_id: String,
    duration_ms: u64,
    outcome: Outcome,
}

enum Outcome {
    Success(Value),
    Failure(String),
    TimedOut { timeout_ms: u64 },
    Cancelled,
}

/// The pipeline coordinator: drives the scheduler phase by phase,
/// dispatching ready agents to workers up to the concurrency limit and
/// folding completions back into the queue.
///
/// The coordinator itself is single-owner; worker completions arrive over
/// a channel and are applied one at a time, so scheduler state never races.
pub struct PipelineEngine {
    scheduler: Arc<RwLock<BuildScheduler>>,
    registry: Arc<dyn AgentRegistry>,
    executor: Arc<dyn AgentExecutor>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<AgentMonitor>,
    cancel: CancellationToken,
}

impl PipelineEngine {
    /// Create an engine for one build.
    ///
    /// Builds the live queue up front; a plan member missing from the
    /// registry is a configuration error raised here.
    pub fn new(
        plan: BuildPlan,
        registry: Arc<dyn AgentRegistry>,
        config: &ForemanConfig,
        executor: Arc<dyn AgentExecutor>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> ForemanResult<Self> {
        let scheduler = BuildScheduler::new(
            plan,
            registry.as_ref(),
            config.scheduler.clone(),
            Arc::clone(&telemetry),
        )?;
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), telemetry));
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            registry,
            executor,
            breaker,
            monitor: Arc::new(AgentMonitor::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Share a circuit breaker with other components (e.g. the handoff
    /// router) instead of the engine-private one.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// The live scheduler.
    pub fn scheduler(&self) -> &Arc<RwLock<BuildScheduler>> {
        &self.scheduler
    }

    /// The circuit breaker used for invocation accounting.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Per-agent execution metrics.
    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    /// A handle for cooperative cancellation of the run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline to completion (or cancellation).
    ///
    /// Phases execute in plan order. Inside a phase, ready agents are
    /// dispatched up to the concurrency limit; a phase that cannot make
    /// progress has its blocked agents force-failed, and is abandoned with
    /// a warning when only failed required agents remain. The run itself
    /// only errors on internal misuse; degraded builds are reported through
    /// [`BuildReport`].
    pub async fn run(&self, context: Value) -> ForemanResult<BuildReport> {
        let build_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let phases: Vec<Phase> = {
            let scheduler = self.scheduler.read().await;
            scheduler.plan().phases.iter().map(|p| p.phase).collect()
        };

        info!(build_id = %build_id, phases = phases.len(), "pipeline started");

        let mut outputs = HashMap::new();
        let mut cancelled = false;
        for phase in phases {
            if self.cancel.is_cancelled() {
                warn!(phase = %phase, "pipeline cancelled before phase");
                cancelled = true;
                break;
            }
            self.scheduler.write().await.set_phase(phase);
            info!(phase = %phase, "phase started");
            self.run_phase(phase, &context, &mut outputs).await?;
        }
        let cancelled = cancelled || self.cancel.is_cancelled();

        let scheduler = self.scheduler.read().await;
        let counts = scheduler.counts();
        let total = counts.queued + counts.running + counts.completed + counts.failed;
        let failed_agents = scheduler.failed_ids();
        let report = BuildReport {
            build_id,
            started_at,
            summary: format!(
                "Pipeline finished: {}/{total} agents completed, {} failed",
                counts.completed,
                failed_agents.len()
            ),
            total_agents: total,
            completed_agents: counts.completed,
            failed_agents,
            progress_percent: scheduler.get_progress(),
            complete: scheduler.is_complete(),
            has_critical_failure: scheduler.has_critical_failure(),
            cancelled,
            duration_ms: started.elapsed().as_millis() as u64,
            outputs,
        };

        info!(
            build_id = %build_id,
            completed = report.completed_agents,
            failed = report.failed_agents.len(),
            critical = report.has_critical_failure,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "pipeline finished"
        );
        Ok(report)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        context: &Value,
        outputs: &mut HashMap<String, Value>,
    ) -> ForemanResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight = 0usize;

        loop {
            if !self.cancel.is_cancelled() {
                let ready = {
                    let mut scheduler = self.scheduler.write().await;
                    let ids = scheduler.get_next_agents();
                    for id in &ids {
                        scheduler.start_agent(id)?;
                    }
                    ids
                };
                for agent_id in ready {
                    let agent = self.registry.get(&agent_id).cloned().ok_or_else(|| {
                        ForemanError::Configuration(format!(
                            "agent '{agent_id}' vanished from the registry mid-build"
                        ))
                    })?;
                    self.monitor.record_run(&agent_id).await;
                    in_flight += 1;
                    self.spawn_worker(agent, context.clone(), tx.clone());
                }
            }

            if in_flight == 0 {
                if self.cancel.is_cancelled() {
                    break;
                }
                let mut scheduler = self.scheduler.write().await;
                if scheduler.is_phase_complete() {
                    break;
                }
                if !scheduler.get_next_agents().is_empty() {
                    continue;
                }
                let forced = scheduler.mark_blocked_as_failed();
                if !forced.is_empty() {
                    // Forced failures count as resolved dependencies and may
                    // release dependents on the next pass.
                    let resolved = ForemanError::DependencyUnsatisfiable { agents: forced };
                    warn!(phase = %phase, error = %resolved, "deadlock resolved by forced failure");
                    continue;
                }
                warn!(phase = %phase, "phase cannot make progress, abandoning");
                break;
            }

            let Some(completion) = rx.recv().await else {
                break;
            };
            in_flight -= 1;
            self.apply_completion(completion, outputs).await?;
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        agent: AgentDefinition,
        context: Value,
        tx: mpsc::UnboundedSender<Completion>,
    ) {
        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let timeout_ms = agent.timeout_ms;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Outcome::Cancelled,
                result = tokio::time::timeout(agent.timeout(), executor.execute(&agent, context)) => {
                    match result {
                        Ok(Ok(output)) => Outcome::Success(output),
                        Ok(Err(e)) => Outcome::Failure(e.to_string()),
                        Err(_) => Outcome::TimedOut { timeout_ms },
                    }
                }
            };
            // The receiver going away just means the run is over.
            let _ = tx.send(Completion {
                agent_id: agent.id,
                duration_ms: started.elapsed().as_millis() as u64,
                outcome,
            });
        });
    }

    async fn apply_completion(
        &self,
        completion: Completion,
        outputs: &mut HashMap<String, Value>,
    ) -> ForemanResult<()> {
        let Completion {
            agent_id,
            duration_ms,
            outcome,
        } = completion;
        self.monitor.record_duration(&agent_id, duration_ms).await;

        match outcome {
            Outcome::Success(output) => {
                self.scheduler.write().await.complete_agent(&agent_id)?;
                self.breaker.record_success(&agent_id);
                info!(agent_id = %agent_id, duration_ms, "agent completed");
                outputs.insert(agent_id, output);
            }
            Outcome::Failure(reason) => {
                self.scheduler
                    .write()
                    .await
                    .fail_agent(&agent_id, reason.as_str())?;
                self.breaker.record_failure(&agent_id);
                self.monitor.record_error(&agent_id).await;
                error!(agent_id = %agent_id, reason = %reason, "agent failed");
            }
            Outcome::TimedOut { timeout_ms } => {
                self.scheduler
                    .write()
                    .await
                    .fail_agent(&agent_id, format!("timed out after {timeout_ms}ms"))?;
                // Timeouts count toward the circuit like any failure.
                self.breaker.record_failure(&agent_id);
                self.monitor.record_error(&agent_id).await;
                error!(agent_id = %agent_id, timeout_ms, "agent timed out");
            }
            Outcome::Cancelled => {
                self.scheduler
                    .write()
                    .await
                    .fail_agent(&agent_id, "cancelled")?;
                // Cancellation is not the agent's fault; no breaker record.
                warn!(agent_id = %agent_id, "agent cancelled");
            }
        }
        Ok(())
    }
}
