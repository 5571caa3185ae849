use crate::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};

/// Workspace-wide configuration for the orchestration core.
///
/// Every field has a default so partial TOML files are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// Scheduler tunables.
    pub scheduler: SchedulerConfig,
    /// Circuit breaker tunables.
    pub breaker: BreakerConfig,
    /// Handoff routing tunables.
    pub routing: RoutingConfig,
}

impl ForemanConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(raw: &str) -> ForemanResult<Self> {
        let config: ForemanConfig = toml::from_str(raw)
            .map_err(|e| ForemanError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.scheduler.concurrency_limit == 0 {
            return Err(ForemanError::Configuration(
                "scheduler.concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(ForemanError::Configuration(
                "breaker thresholds must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.routing.confidence_threshold) {
            return Err(ForemanError::Configuration(format!(
                "routing.confidence_threshold must be within 0.0..=1.0, got {}",
                self.routing.confidence_threshold
            )));
        }
        if self.routing.max_chain_depth == 0 {
            return Err(ForemanError::Configuration(
                "routing.max_chain_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of agents running at once.
    pub concurrency_limit: usize,
    /// When true (the default, preserving the original pipeline's
    /// behavior), a failed dependency counts as resolved for unblocking its
    /// dependents: liveness over strictness. When false, dependents of a
    /// failed required agent stay queued until the blocked-agent scan
    /// force-fails them.
    pub unblock_on_dependency_failure: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            unblock_on_dependency_failure: true,
        }
    }
}

/// Circuit breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures while closed before the circuit opens.
    pub failure_threshold: u32,
    /// Successes while half-open before the circuit closes again.
    pub success_threshold: u32,
    /// How long an open circuit refuses calls before probing.
    pub reset_timeout_ms: u64,
    /// Interval between staleness sweep passes.
    pub sweep_interval_secs: u64,
    /// Closed, failure-free entries untouched for this long are evicted.
    pub stale_after_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
            sweep_interval_secs: 3_600,
            stale_after_secs: 86_400,
        }
    }
}

/// Handoff routing tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Minimum confidence for a handoff to be proposed without `force`.
    pub confidence_threshold: f64,
    /// Maximum hops in one handoff chain.
    pub max_chain_depth: u32,
    /// Byte budget handoff contexts are compressed down to.
    pub max_context_bytes: usize,
    /// Context keys copied through compression untouched.
    pub preserve_keys: Vec<String>,
    /// Target proposed when no strategy can decide.
    pub fallback_agent: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_chain_depth: 5,
            max_context_bytes: 16_384,
            preserve_keys: vec!["request_id".to_string()],
            fallback_agent: None,
        }
    }
}
