use crate::chain::{ChainStatus, HandoffChain, HandoffHop};
use crate::compressor::{CompressedContext, ContextCompressor};
use crate::strategy::{
    fallback_verdict, rules_verdict, RoutingDecision, RoutingMethod, RoutingModel, RoutingVerdict,
};
use async_trait::async_trait;
use foreman_core::{
    ForemanError, ForemanResult, RoutingConfig, TelemetryEvent, TelemetrySink,
};
use foreman_resilience::CircuitBreaker;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A registered handoff target: its capabilities, trigger keywords, and
/// concurrency budget.
#[derive(Debug, Clone, Serialize)]
pub struct RoutableAgent {
    /// Unique agent id.
    pub agent_id: String,
    /// What the agent can do; matched against output/context.
    pub capabilities: Vec<String>,
    /// Keywords whose appearance suggests routing here.
    pub trigger_keywords: Vec<String>,
    /// How many handoffs the agent accepts at once.
    pub max_concurrent: u32,
}

impl RoutableAgent {
    /// Creates a routable agent with no capabilities and a concurrency
    /// budget of one.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: Vec::new(),
            trigger_keywords: Vec::new(),
            max_concurrent: 1,
        }
    }

    /// Sets the capability list.
    pub fn with_capabilities(mut self, capabilities: Vec<impl Into<String>>) -> Self {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the trigger keyword list.
    pub fn with_trigger_keywords(mut self, keywords: Vec<impl Into<String>>) -> Self {
        self.trigger_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the concurrency budget.
    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }
}

struct AgentSlot {
    agent: RoutableAgent,
    current_load: u32,
}

/// Execution collaborator for handoff targets.
#[async_trait]
pub trait HandoffExecutor: Send + Sync {
    /// Run the target agent against the handed-over context.
    async fn invoke(&self, agent_id: &str, context: Value) -> ForemanResult<Value>;
}

/// Per-handoff execution options.
#[derive(Debug, Clone)]
pub struct HandoffOptions {
    /// Bypass the circuit breaker gate.
    pub skip_circuit_breaker: bool,
    /// Timeout for the target execution.
    pub timeout_ms: u64,
    /// Preserve-list override; the routing config's list applies when
    /// `None`.
    pub preserve_keys: Option<Vec<String>>,
}

impl Default for HandoffOptions {
    fn default() -> Self {
        Self {
            skip_circuit_breaker: false,
            timeout_ms: 30_000,
            preserve_keys: None,
        }
    }
}

/// Result of a successfully executed handoff.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffExecutionResult {
    /// The chain this hop was appended to.
    pub chain_id: String,
    /// The agent that received control.
    pub target_agent: String,
    /// The target's output.
    pub output: Value,
    /// How the context was reduced before the transfer.
    pub compression: CompressedContext,
    /// Position of the appended hop.
    pub hop_number: u32,
    /// How long the target execution took.
    pub duration_ms: u64,
}

/// Evaluates and executes control transfer between agents mid-build.
///
/// Routing strategies are tried in order (model, rules, hardcoded
/// fallback) until one decides. Execution is gated by the chain depth
/// bound and the target's circuit breaker, and every transfer compresses
/// its context and appends one hop to the request's chain.
pub struct HandoffRouter {
    config: RoutingConfig,
    agents: RwLock<HashMap<String, AgentSlot>>,
    chains: RwLock<HashMap<Uuid, HandoffChain>>,
    model: Option<Arc<dyn RoutingModel>>,
    executor: Arc<dyn HandoffExecutor>,
    breaker: Arc<CircuitBreaker>,
    compressor: ContextCompressor,
    telemetry: Arc<dyn TelemetrySink>,
}

impl HandoffRouter {
    /// Create a router sharing the given circuit breaker.
    pub fn new(
        config: RoutingConfig,
        breaker: Arc<CircuitBreaker>,
        executor: Arc<dyn HandoffExecutor>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
            chains: RwLock::new(HashMap::new()),
            model: None,
            executor,
            breaker,
            compressor: ContextCompressor,
            telemetry,
        }
    }

    /// Attach the model-based routing collaborator (primary strategy).
    pub fn with_model(mut self, model: Arc<dyn RoutingModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Register (or replace) a handoff target.
    pub async fn register_agent(&self, agent: RoutableAgent) {
        let mut agents = self.agents.write().await;
        info!(agent_id = %agent.agent_id, "registered routable agent");
        agents.insert(
            agent.agent_id.clone(),
            AgentSlot {
                agent,
                current_load: 0,
            },
        );
    }

    /// Remove a handoff target.
    pub async fn unregister_agent(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if agents.remove(agent_id).is_some() {
            info!(agent_id = %agent_id, "unregistered routable agent");
        }
    }

    /// Number of registered targets.
    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Handoffs currently in flight to one agent.
    pub async fn current_load(&self, agent_id: &str) -> Option<u32> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|slot| slot.current_load)
    }

    /// Evaluate whether (and where) to hand control away from
    /// `current_agent`, given its output and the original input.
    ///
    /// Agents already at their concurrency budget are excluded from
    /// consideration. Returns `None` when no strategy can decide.
    pub async fn evaluate(
        &self,
        context: &Value,
        current_agent: &str,
        output: &str,
        input: &str,
    ) -> Option<RoutingDecision> {
        let candidates: Vec<RoutableAgent> = {
            let agents = self.agents.read().await;
            agents
                .values()
                .filter(|slot| {
                    slot.agent.agent_id != current_agent
                        && slot.current_load < slot.agent.max_concurrent
                })
                .map(|slot| slot.agent.clone())
                .collect()
        };
        if candidates.is_empty() {
            debug!(current_agent, "no routable candidates available");
            return None;
        }

        if let Some(model) = &self.model {
            match model
                .propose(current_agent, output, input, context, &candidates)
                .await
            {
                Ok(RoutingVerdict::Decided(mut decision))
                    if decision.confidence >= self.config.confidence_threshold =>
                {
                    decision.method = RoutingMethod::Llm;
                    decision.from_agent = current_agent.to_string();
                    return Some(decision);
                }
                Ok(RoutingVerdict::Decided(decision)) => {
                    debug!(
                        confidence = decision.confidence,
                        "model decision below threshold, trying rules"
                    );
                }
                Ok(RoutingVerdict::Undecided) => {
                    debug!("model undecided, trying rules");
                }
                Err(e) => {
                    warn!(error = %e, "model routing failed, trying rules");
                }
            }
        }

        if let RoutingVerdict::Decided(decision) =
            rules_verdict(current_agent, output, input, &candidates)
        {
            return Some(decision);
        }

        match fallback_verdict(current_agent, self.config.fallback_agent.as_deref(), &candidates)
        {
            RoutingVerdict::Decided(decision) => Some(decision),
            RoutingVerdict::Undecided => None,
        }
    }

    /// Whether a decision clears the confidence gate.
    pub fn should_handoff(&self, decision: &RoutingDecision, force: bool) -> bool {
        force || decision.confidence >= self.config.confidence_threshold
    }

    /// Execute a proposed handoff for the request identified by
    /// `request_id`.
    ///
    /// Gates, in order: the chain depth bound (a refusal terminates the
    /// chain as `DepthExceeded`), then the target's circuit breaker (unless
    /// `skip_circuit_breaker`). The context is compressed to the configured
    /// byte budget before the transfer; preserve-listed keys pass through
    /// untouched. Success appends one hop and feeds the breaker; failure or
    /// timeout feeds the breaker and terminates the chain as `Failed`.
    pub async fn execute(
        &self,
        decision: &RoutingDecision,
        request_id: Uuid,
        context: &Value,
        options: HandoffOptions,
    ) -> ForemanResult<HandoffExecutionResult> {
        let target = decision.target_agent.as_str();

        // Depth gate.
        let chain_id = {
            let mut chains = self.chains.write().await;
            let chain = chains.entry(request_id).or_insert_with(|| {
                HandoffChain::new(request_id, self.config.max_chain_depth)
            });
            if chain.status.is_terminal() {
                return Err(ForemanError::Routing(format!(
                    "chain '{}' is already {}",
                    chain.chain_id, chain.status
                )));
            }
            if chain.would_exceed_depth() {
                chain.terminate(ChainStatus::DepthExceeded);
                warn!(
                    chain_id = %chain.chain_id,
                    target_agent = %target,
                    max_depth = chain.max_depth,
                    "handoff refused: chain depth exhausted"
                );
                self.telemetry.emit(TelemetryEvent::HandoffRefused {
                    chain_id: chain.chain_id.clone(),
                    target_agent: target.to_string(),
                    reason: format!("chain depth {} exhausted", chain.max_depth),
                });
                self.telemetry.counter("router.refused.depth", 1);
                return Err(ForemanError::ChainDepthExceeded {
                    chain_id: chain.chain_id.clone(),
                    max_depth: chain.max_depth,
                });
            }
            chain.chain_id.clone()
        };

        // Circuit gate.
        if !options.skip_circuit_breaker && !self.breaker.can_execute(target) {
            let state = self
                .breaker
                .get_state(target)
                .map(|snapshot| snapshot.state.to_string())
                .unwrap_or_else(|| "open".to_string());
            warn!(
                chain_id = %chain_id,
                target_agent = %target,
                state = %state,
                "handoff refused: circuit not accepting calls"
            );
            self.telemetry.emit(TelemetryEvent::HandoffRefused {
                chain_id: chain_id.clone(),
                target_agent: target.to_string(),
                reason: format!("circuit {state}"),
            });
            self.telemetry.counter("router.refused.circuit", 1);
            return Err(ForemanError::CircuitOpen {
                agent_id: target.to_string(),
                state,
            });
        }

        // Compression never fails the handoff.
        let preserve_keys = options
            .preserve_keys
            .as_deref()
            .unwrap_or(&self.config.preserve_keys);
        let compression =
            self.compressor
                .compress(context, self.config.max_context_bytes, preserve_keys);

        self.adjust_load(target, 1).await;
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_millis(options.timeout_ms),
            self.executor.invoke(target, compression.content.clone()),
        )
        .await;
        self.adjust_load(target, -1).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                self.breaker.record_success(target);
                let hop_number = {
                    let mut chains = self.chains.write().await;
                    // The entry exists; it was created by the depth gate.
                    let Some(chain) = chains.get_mut(&request_id) else {
                        return Err(ForemanError::Routing(format!(
                            "chain for request {request_id} disappeared mid-handoff"
                        )));
                    };
                    let hop_number = chain.depth + 1;
                    chain.record_hop(HandoffHop {
                        hop_number,
                        from_agent: decision.from_agent.clone(),
                        to_agent: target.to_string(),
                        confidence: decision.confidence,
                        reason: decision.reason.clone(),
                        duration_ms,
                        context_size: compression.compressed_size,
                    });
                    hop_number
                };
                info!(
                    chain_id = %chain_id,
                    from_agent = %decision.from_agent,
                    target_agent = %target,
                    hop_number,
                    duration_ms,
                    method = %decision.method,
                    "handoff executed"
                );
                Ok(HandoffExecutionResult {
                    chain_id,
                    target_agent: target.to_string(),
                    output,
                    compression,
                    hop_number,
                    duration_ms,
                })
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(target);
                self.terminate_chain(request_id, ChainStatus::Failed).await;
                Err(ForemanError::Routing(format!(
                    "handoff to '{target}' in chain '{chain_id}' failed: {e}"
                )))
            }
            Err(_) => {
                self.breaker.record_failure(target);
                self.terminate_chain(request_id, ChainStatus::Failed).await;
                Err(ForemanError::Routing(format!(
                    "handoff to '{target}' in chain '{chain_id}' timed out after {}ms",
                    options.timeout_ms
                )))
            }
        }
    }

    /// The chain for a request, if one exists.
    pub async fn get_chain(&self, request_id: Uuid) -> Option<HandoffChain> {
        let chains = self.chains.read().await;
        chains.get(&request_id).cloned()
    }

    /// Mark a request's routing episode as completed.
    pub async fn complete_chain(&self, request_id: Uuid) {
        let mut chains = self.chains.write().await;
        if let Some(chain) = chains.get_mut(&request_id) {
            if !chain.status.is_terminal() {
                chain.terminate(ChainStatus::Completed);
                info!(chain_id = %chain.chain_id, hops = chain.hops.len(), "chain completed");
            }
        }
    }

    async fn terminate_chain(&self, request_id: Uuid, status: ChainStatus) {
        let mut chains = self.chains.write().await;
        if let Some(chain) = chains.get_mut(&request_id) {
            if !chain.status.is_terminal() {
                chain.terminate(status);
            }
        }
    }

    async fn adjust_load(&self, agent_id: &str, delta: i32) {
        let mut agents = self.agents.write().await;
        if let Some(slot) = agents.get_mut(agent_id) {
            slot.current_load = if delta >= 0 {
                slot.current_load.saturating_add(delta as u32)
            } else {
                slot.current_load.saturating_sub(delta.unsigned_abs())
            };
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_core::{BreakerConfig, NullSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Target executor returning canned results per agent id.
    struct MockTarget {
        fail_agents: Vec<String>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl MockTarget {
        fn new() -> Self {
            Self {
                fail_agents: Vec::new(),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(mut self, ids: &[&str]) -> Self {
            self.fail_agents = ids.iter().map(|s| (*s).to_string()).collect();
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl HandoffExecutor for MockTarget {
        async fn invoke(&self, agent_id: &str, context: Value) -> ForemanResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_agents.iter().any(|a| a == agent_id) {
                return Err(ForemanError::Execution {
                    agent_id: agent_id.to_string(),
                    reason: "mock target failure".to_string(),
                });
            }
            Ok(json!({ "handled_by": agent_id, "context": context }))
        }
    }

    /// Model collaborator returning a fixed verdict.
    struct FixedModel(ForemanResult<Option<(String, f64)>>);

    #[async_trait]
    impl RoutingModel for FixedModel {
        async fn propose(
            &self,
            current_agent: &str,
            _output: &str,
            _input: &str,
            _context: &Value,
            _candidates: &[RoutableAgent],
        ) -> ForemanResult<RoutingVerdict> {
            match &self.0 {
                Ok(Some((target, confidence))) => {
                    Ok(RoutingVerdict::Decided(RoutingDecision {
                        from_agent: current_agent.to_string(),
                        target_agent: target.clone(),
                        confidence: *confidence,
                        reason: "model proposal".to_string(),
                        alternatives: Vec::new(),
                        method: RoutingMethod::Llm,
                    }))
                }
                Ok(None) => Ok(RoutingVerdict::Undecided),
                Err(_) => Err(ForemanError::Routing("model unavailable".to_string())),
            }
        }
    }

    fn router(executor: Arc<dyn HandoffExecutor>) -> HandoffRouter {
        router_with_config(executor, RoutingConfig::default())
    }

    fn router_with_config(
        executor: Arc<dyn HandoffExecutor>,
        config: RoutingConfig,
    ) -> HandoffRouter {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            Arc::new(NullSink),
        ));
        HandoffRouter::new(config, breaker, executor, Arc::new(NullSink))
    }

    async fn register_defaults(router: &HandoffRouter) {
        router
            .register_agent(
                RoutableAgent::new("pricing")
                    .with_trigger_keywords(vec!["price", "plan", "tier"])
                    .with_max_concurrent(2),
            )
            .await;
        router
            .register_agent(RoutableAgent::new("seo").with_trigger_keywords(vec!["meta", "ranking"]))
            .await;
    }

    fn decision_for(target: &str, confidence: f64) -> RoutingDecision {
        RoutingDecision {
            from_agent: "copywriter".to_string(),
            target_agent: target.to_string(),
            confidence,
            reason: "test".to_string(),
            alternatives: Vec::new(),
            method: RoutingMethod::Rules,
        }
    }

    #[tokio::test]
    async fn test_evaluate_uses_rules_without_model() {
        let router = router(Arc::new(MockTarget::new()));
        register_defaults(&router).await;

        let decision = router
            .evaluate(&json!({}), "copywriter", "fix the price plan tier table", "")
            .await
            .unwrap();

        assert_eq!(decision.target_agent, "pricing");
        assert_eq!(decision.method, RoutingMethod::Rules);
        assert_eq!(decision.from_agent, "copywriter");
    }

    #[tokio::test]
    async fn test_evaluate_prefers_confident_model() {
        let router = router(Arc::new(MockTarget::new()))
            .with_model(Arc::new(FixedModel(Ok(Some(("seo".to_string(), 0.95))))));
        register_defaults(&router).await;

        let decision = router
            .evaluate(&json!({}), "copywriter", "price plan tier", "")
            .await
            .unwrap();

        assert_eq!(decision.target_agent, "seo");
        assert_eq!(decision.method, RoutingMethod::Llm);
    }

    #[tokio::test]
    async fn test_model_error_falls_back_to_rules() {
        let router = router(Arc::new(MockTarget::new())).with_model(Arc::new(FixedModel(Err(
            ForemanError::Routing("down".to_string()),
        ))));
        register_defaults(&router).await;

        let decision = router
            .evaluate(&json!({}), "copywriter", "price plan tier", "")
            .await
            .unwrap();

        assert_eq!(decision.method, RoutingMethod::Rules);
    }

    #[tokio::test]
    async fn test_low_confidence_model_falls_back_to_rules() {
        let router = router(Arc::new(MockTarget::new()))
            .with_model(Arc::new(FixedModel(Ok(Some(("seo".to_string(), 0.2))))));
        register_defaults(&router).await;

        let decision = router
            .evaluate(&json!({}), "copywriter", "price plan tier", "")
            .await
            .unwrap();

        assert_eq!(decision.method, RoutingMethod::Rules);
        assert_eq!(decision.target_agent, "pricing");
    }

    #[tokio::test]
    async fn test_fallback_agent_when_nothing_matches() {
        let config = RoutingConfig {
            fallback_agent: Some("seo".to_string()),
            ..RoutingConfig::default()
        };
        let router = router_with_config(Arc::new(MockTarget::new()), config);
        register_defaults(&router).await;

        let decision = router
            .evaluate(&json!({}), "copywriter", "nothing matches here", "")
            .await
            .unwrap();

        assert_eq!(decision.method, RoutingMethod::Fallback);
        assert_eq!(decision.target_agent, "seo");
        // Fallback confidence sits below the gate: proposed only on force.
        assert!(!router.should_handoff(&decision, false));
        assert!(router.should_handoff(&decision, true));
    }

    #[tokio::test]
    async fn test_evaluate_returns_none_without_any_strategy() {
        let router = router(Arc::new(MockTarget::new()));
        register_defaults(&router).await;

        let decision = router
            .evaluate(&json!({}), "copywriter", "nothing matches here", "")
            .await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_current_agent_is_never_a_candidate() {
        let router = router(Arc::new(MockTarget::new()));
        register_defaults(&router).await;

        let decision = router
            .evaluate(&json!({}), "pricing", "price plan tier", "")
            .await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_execute_appends_hop_and_reports_compression() {
        let router = router(Arc::new(MockTarget::new()));
        register_defaults(&router).await;
        let request_id = Uuid::new_v4();

        let result = router
            .execute(
                &decision_for("pricing", 0.9),
                request_id,
                &json!({ "request_id": "r-1", "page": "home" }),
                HandoffOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.hop_number, 1);
        assert_eq!(result.target_agent, "pricing");
        assert_eq!(result.output["handled_by"], "pricing");
        assert_eq!(result.compression.preserved_keys, vec!["request_id"]);

        let chain = router.get_chain(request_id).await.unwrap();
        assert_eq!(chain.depth, 1);
        assert_eq!(chain.status, ChainStatus::Active);
        assert_eq!(chain.last_hop().unwrap().from_agent, "copywriter");
    }

    #[tokio::test]
    async fn test_depth_bound_refuses_and_terminates_chain() {
        let config = RoutingConfig {
            max_chain_depth: 2,
            ..RoutingConfig::default()
        };
        let executor = Arc::new(MockTarget::new());
        let router = router_with_config(executor.clone(), config);
        register_defaults(&router).await;
        let request_id = Uuid::new_v4();

        for _ in 0..2 {
            router
                .execute(
                    &decision_for("pricing", 0.9),
                    request_id,
                    &json!({}),
                    HandoffOptions::default(),
                )
                .await
                .unwrap();
        }

        let err = router
            .execute(
                &decision_for("pricing", 0.9),
                request_id,
                &json!({}),
                HandoffOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ForemanError::ChainDepthExceeded { max_depth: 2, .. }));
        let chain = router.get_chain(request_id).await.unwrap();
        assert_eq!(chain.status, ChainStatus::DepthExceeded);
        assert_eq!(chain.depth, 2);
        // The refused hop never reached the target.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_circuit_open_refuses_unless_skipped() {
        let executor = Arc::new(MockTarget::new());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            Arc::new(NullSink),
        ));
        let router = HandoffRouter::new(
            RoutingConfig::default(),
            Arc::clone(&breaker),
            executor.clone(),
            Arc::new(NullSink),
        );
        register_defaults(&router).await;
        breaker.record_failure("pricing");

        let err = router
            .execute(
                &decision_for("pricing", 0.9),
                Uuid::new_v4(),
                &json!({}),
                HandoffOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::CircuitOpen { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let result = router
            .execute(
                &decision_for("pricing", 0.9),
                Uuid::new_v4(),
                &json!({}),
                HandoffOptions {
                    skip_circuit_breaker: true,
                    ..HandoffOptions::default()
                },
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_target_failure_feeds_breaker_and_fails_chain() {
        let router = router(Arc::new(MockTarget::new().failing(&["pricing"])));
        register_defaults(&router).await;
        let request_id = Uuid::new_v4();

        let err = router
            .execute(
                &decision_for("pricing", 0.9),
                request_id,
                &json!({}),
                HandoffOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("pricing"));
        let chain = router.get_chain(request_id).await.unwrap();
        assert_eq!(chain.status, ChainStatus::Failed);
        assert_eq!(chain.depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let router = router(Arc::new(
            MockTarget::new().with_delay(Duration::from_secs(60)),
        ));
        register_defaults(&router).await;
        let request_id = Uuid::new_v4();

        let err = router
            .execute(
                &decision_for("pricing", 0.9),
                request_id,
                &json!({}),
                HandoffOptions {
                    timeout_ms: 100,
                    ..HandoffOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert_eq!(
            router.get_chain(request_id).await.unwrap().status,
            ChainStatus::Failed
        );
        // Load was released despite the timeout.
        assert_eq!(router.current_load("pricing").await, Some(0));
    }

    #[tokio::test]
    async fn test_terminal_chain_refuses_further_handoffs() {
        let router = router(Arc::new(MockTarget::new()));
        register_defaults(&router).await;
        let request_id = Uuid::new_v4();

        router
            .execute(
                &decision_for("pricing", 0.9),
                request_id,
                &json!({}),
                HandoffOptions::default(),
            )
            .await
            .unwrap();
        router.complete_chain(request_id).await;

        let err = router
            .execute(
                &decision_for("pricing", 0.9),
                request_id,
                &json!({}),
                HandoffOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("completed"));
    }

    #[tokio::test]
    async fn test_agents_at_capacity_are_excluded() {
        let router = router(Arc::new(MockTarget::new()));
        router
            .register_agent(
                RoutableAgent::new("pricing")
                    .with_trigger_keywords(vec!["price"])
                    .with_max_concurrent(1),
            )
            .await;
        router.adjust_load("pricing", 1).await;

        let decision = router.evaluate(&json!({}), "copywriter", "price", "").await;
        assert!(decision.is_none());

        router.adjust_load("pricing", -1).await;
        let decision = router.evaluate(&json!({}), "copywriter", "price", "").await;
        assert!(decision.is_some());
    }

    #[tokio::test]
    async fn test_unregister_removes_candidate() {
        let router = router(Arc::new(MockTarget::new()));
        register_defaults(&router).await;
        assert_eq!(router.agent_count().await, 2);

        router.unregister_agent("pricing").await;
        assert_eq!(router.agent_count().await, 1);
        let decision = router
            .evaluate(&json!({}), "copywriter", "price plan tier", "")
            .await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_low_confidence_proposal_without_force_never_hops() {
        let router = router(Arc::new(MockTarget::new()));
        register_defaults(&router).await;
        let request_id = Uuid::new_v4();

        // One keyword of two: score 0.4, below the 0.7 gate.
        let decision = router
            .evaluate(&json!({}), "copywriter", "the meta description", "")
            .await
            .unwrap();
        assert!(!router.should_handoff(&decision, false));

        // The caller respects the gate, so no chain ever exists.
        assert!(router.get_chain(request_id).await.is_none());
    }
}
