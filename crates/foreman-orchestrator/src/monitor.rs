use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Metrics tracked per agent id across a build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMetrics {
    /// Invocations dispatched.
    pub runs: u32,
    /// Invocations that ended in failure (including timeouts).
    pub errors: u32,
    /// Total wall-clock time spent executing.
    pub duration_ms: u64,
}

/// Tracks per-agent execution metrics for the pipeline.
pub struct AgentMonitor {
    metrics: Arc<RwLock<HashMap<String, AgentMetrics>>>,
}

impl AgentMonitor {
    /// Creates an empty monitor.
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record a dispatched invocation.
    pub async fn record_run(&self, agent_id: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(agent_id.to_string()).or_default().runs += 1;
    }

    /// Record a failed invocation.
    pub async fn record_error(&self, agent_id: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(agent_id.to_string()).or_default().errors += 1;
    }

    /// Record execution duration for an invocation.
    pub async fn record_duration(&self, agent_id: &str, duration_ms: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(agent_id.to_string()).or_default().duration_ms += duration_ms;
    }

    /// Metrics for a single agent.
    pub async fn get(&self, agent_id: &str) -> Option<AgentMetrics> {
        let metrics = self.metrics.read().await;
        metrics.get(agent_id).cloned()
    }

    /// Snapshot of all tracked agents.
    pub async fn snapshot(&self) -> HashMap<String, AgentMetrics> {
        self.metrics.read().await.clone()
    }

    /// Serialize the current metrics as JSON (for dashboards).
    pub async fn to_json(&self) -> serde_json::Value {
        let snapshot = self.snapshot().await;
        serde_json::json!({ "agents": snapshot })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
