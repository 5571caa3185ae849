use foreman_core::{BreakerConfig, TelemetryEvent, TelemetrySink, TracingSink};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of one agent's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow normally; failures are counted.
    Closed,
    /// Calls are refused until the reset timeout elapses.
    Open,
    /// Probe window: calls flow, successes are counted toward closing.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Read-only view of one agent's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// The agent this circuit belongs to.
    pub agent_id: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failure count (closed) or failures at open time.
    pub failures: u32,
    /// Successes accumulated in the current half-open window.
    pub successes: u32,
    /// Milliseconds until an open circuit allows a probe; `None` unless
    /// open.
    pub next_retry_in_ms: Option<u64>,
}

/// Notification sent to subscribers on every state transition.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    /// The agent whose circuit transitioned.
    pub agent_id: String,
    /// State before.
    pub from: CircuitState,
    /// State after.
    pub to: CircuitState,
    /// Failure count at transition time.
    pub failures: u32,
}

struct BreakerEntry {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<Instant>,
    last_state_change_at: Instant,
    next_retry_at: Option<Instant>,
}

impl BreakerEntry {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_at: None,
            last_state_change_at: now,
            next_retry_at: None,
        }
    }
}

/// Per-agent-id circuit breaker.
///
/// Entries are created lazily on first check and evicted again by the
/// staleness sweep once they have been closed, failure-free, and untouched
/// for the configured window, bounding memory growth from ephemeral agent
/// ids. All mutation happens under one lock; the critical sections contain
/// no awaits.
pub struct CircuitBreaker {
    config: BreakerConfig,
    entries: Mutex<HashMap<String, BreakerEntry>>,
    events: broadcast::Sender<TransitionEvent>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration and telemetry sink.
    pub fn new(config: BreakerConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            events,
            telemetry,
        }
    }

    /// Create a breaker with default configuration, logging to `tracing`.
    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default(), Arc::new(TracingSink))
    }

    /// Subscribe to state transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Whether a call to `agent_id` is currently allowed.
    ///
    /// This is deliberately a read-modify-write, not a pure read: an open
    /// circuit whose reset timeout has elapsed transitions to half-open as
    /// a side effect of this check, so that the single source-of-truth read
    /// also opens the probe window. The flip happens under the same lock as
    /// every other mutation.
    pub fn can_execute(&self, agent_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries
            .entry(agent_id.to_string())
            .or_insert_with(|| BreakerEntry::new(now));

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let retry_due = entry.next_retry_at.is_some_and(|at| now >= at);
                if retry_due {
                    self.transition(agent_id, entry, CircuitState::HalfOpen, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call to `agent_id`.
    pub fn record_success(&self, agent_id: &str) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries
            .entry(agent_id.to_string())
            .or_insert_with(|| BreakerEntry::new(now));

        match entry.state {
            CircuitState::Closed => {
                entry.failures = 0;
            }
            CircuitState::HalfOpen => {
                entry.successes += 1;
                if entry.successes >= self.config.success_threshold {
                    self.transition(agent_id, entry, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {
                // Not expected: nothing should be executing while open.
                debug!(agent_id = %agent_id, "success recorded while circuit open, ignoring");
            }
        }
    }

    /// Record a failed (or timed-out) call to `agent_id`.
    pub fn record_failure(&self, agent_id: &str) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries
            .entry(agent_id.to_string())
            .or_insert_with(|| BreakerEntry::new(now));
        entry.last_failure_at = Some(now);

        match entry.state {
            CircuitState::Closed => {
                entry.failures += 1;
                if entry.failures >= self.config.failure_threshold {
                    self.transition(agent_id, entry, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                // One failure during the probe window reopens immediately;
                // accumulated successes are discarded.
                self.transition(agent_id, entry, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Snapshot of one agent's circuit, if it is being tracked.
    pub fn get_state(&self, agent_id: &str) -> Option<CircuitSnapshot> {
        let entries = self.entries.lock();
        let now = Instant::now();
        entries.get(agent_id).map(|entry| CircuitSnapshot {
            agent_id: agent_id.to_string(),
            state: entry.state,
            failures: entry.failures,
            successes: entry.successes,
            next_retry_in_ms: entry
                .next_retry_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        })
    }

    /// Operator escape hatch: force the circuit back to closed with zeroed
    /// counters, regardless of its current state.
    pub fn reset(&self, agent_id: &str) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if let Some(entry) = entries.get_mut(agent_id) {
            if entry.state != CircuitState::Closed {
                warn!(agent_id = %agent_id, from = %entry.state, "operator reset of circuit");
                self.transition(agent_id, entry, CircuitState::Closed, now);
            }
            entry.failures = 0;
            entry.successes = 0;
            entry.next_retry_at = None;
        }
    }

    /// Number of agent ids currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Evict entries that are closed, failure-free, and have had no state
    /// change for the staleness window. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let stale_after = Duration::from_secs(self.config.stale_after_secs);
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| {
            !(entry.state == CircuitState::Closed
                && entry.failures == 0
                && now.saturating_duration_since(entry.last_state_change_at) >= stale_after)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "breaker sweep evicted stale entries");
            self.telemetry.counter("breaker.evictions", evicted as u64);
        }
        evicted
    }

    /// Start the periodic staleness sweep.
    ///
    /// Returns the [`tokio::task::JoinHandle`] so the caller can abort it
    /// on shutdown.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    /// Apply a state transition to `entry` and publish it. Must be called
    /// with the entries lock held.
    fn transition(
        &self,
        agent_id: &str,
        entry: &mut BreakerEntry,
        to: CircuitState,
        now: Instant,
    ) {
        let from = entry.state;
        entry.state = to;
        entry.last_state_change_at = now;

        match to {
            CircuitState::Open => {
                entry.next_retry_at =
                    Some(now + Duration::from_millis(self.config.reset_timeout_ms));
                entry.successes = 0;
            }
            CircuitState::HalfOpen => {
                entry.successes = 0;
                entry.next_retry_at = None;
            }
            CircuitState::Closed => {
                entry.failures = 0;
                entry.successes = 0;
                entry.next_retry_at = None;
            }
        }

        let next_retry_in_ms = entry
            .next_retry_at
            .map(|at| at.saturating_duration_since(now).as_millis() as u64);

        info!(
            agent_id = %agent_id,
            from = %from,
            to = %to,
            failures = entry.failures,
            next_retry_in_ms = ?next_retry_in_ms,
            "circuit transition"
        );
        self.telemetry.emit(TelemetryEvent::CircuitTransition {
            agent_id: agent_id.to_string(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            failures: entry.failures,
            next_retry_in_ms,
        });
        self.telemetry.counter("breaker.transitions", 1);
        // No subscribers is fine.
        let _ = self.events.send(TransitionEvent {
            agent_id: agent_id.to_string(),
            from,
            to,
            failures: entry.failures,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_core::NullSink;

    fn test_breaker(failure_threshold: u32, success_threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                failure_threshold,
                success_threshold,
                reset_timeout_ms: reset_ms,
                ..BreakerConfig::default()
            },
            Arc::new(NullSink),
        )
    }

    #[tokio::test]
    async fn test_closed_allows_and_counts_failures() {
        let breaker = test_breaker(3, 1, 1_000);
        assert!(breaker.can_execute("hero"));

        breaker.record_failure("hero");
        breaker.record_failure("hero");
        assert!(breaker.can_execute("hero"));
        let snap = breaker.get_state("hero").unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failures, 2);
    }

    #[tokio::test]
    async fn test_success_resets_closed_failure_count() {
        let breaker = test_breaker(3, 1, 1_000);
        breaker.record_failure("hero");
        breaker.record_failure("hero");
        breaker.record_success("hero");
        assert_eq!(breaker.get_state("hero").unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_opens_and_reset_timeout_half_opens() {
        let breaker = test_breaker(3, 1, 1_000);

        breaker.record_failure("hero");
        breaker.record_failure("hero");
        breaker.record_failure("hero");

        // Open: refused immediately.
        assert!(!breaker.can_execute("hero"));
        assert_eq!(breaker.get_state("hero").unwrap().state, CircuitState::Open);

        // After the reset timeout, the check itself flips to half-open.
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(breaker.can_execute("hero"));
        assert_eq!(
            breaker.get_state("hero").unwrap().state,
            CircuitState::HalfOpen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_refuses_before_deadline() {
        let breaker = test_breaker(1, 1, 1_000);
        breaker.record_failure("hero");

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!breaker.can_execute("hero"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.can_execute("hero"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_discards_successes() {
        let breaker = test_breaker(1, 3, 500);
        breaker.record_failure("hero");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(breaker.can_execute("hero"));

        breaker.record_success("hero");
        breaker.record_success("hero");
        assert_eq!(breaker.get_state("hero").unwrap().successes, 2);

        breaker.record_failure("hero");
        let snap = breaker.get_state("hero").unwrap();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.successes, 0);
        assert!(!breaker.can_execute("hero"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_threshold_closes() {
        let breaker = test_breaker(1, 2, 500);
        breaker.record_failure("hero");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(breaker.can_execute("hero"));

        breaker.record_success("hero");
        breaker.record_success("hero");

        let snap = breaker.get_state("hero").unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.successes, 0);
    }

    #[tokio::test]
    async fn test_breakers_are_independent_per_agent() {
        let breaker = test_breaker(1, 1, 1_000);
        breaker.record_failure("hero");
        assert!(!breaker.can_execute("hero"));
        assert!(breaker.can_execute("gallery"));
    }

    #[tokio::test]
    async fn test_operator_reset_forces_closed() {
        let breaker = test_breaker(1, 1, 60_000);
        breaker.record_failure("hero");
        assert!(!breaker.can_execute("hero"));

        breaker.reset("hero");
        let snap = breaker.get_state("hero").unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failures, 0);
        assert!(breaker.can_execute("hero"));
    }

    #[tokio::test]
    async fn test_get_state_is_lazy() {
        let breaker = test_breaker(1, 1, 1_000);
        assert!(breaker.get_state("never-checked").is_none());
        assert!(breaker.can_execute("checked"));
        assert!(breaker.get_state("checked").is_some());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let breaker = test_breaker(2, 1, 1_000);
        let mut events = breaker.subscribe();

        breaker.record_failure("hero");
        breaker.record_failure("hero");

        let event = events.try_recv().unwrap();
        assert_eq!(event.agent_id, "hero");
        assert_eq!(event.from, CircuitState::Closed);
        assert_eq!(event.to, CircuitState::Open);
        assert_eq!(event.failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_stale_clean_closed() {
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 5,
                stale_after_secs: 10,
                ..BreakerConfig::default()
            },
            Arc::new(NullSink),
        );

        assert!(breaker.can_execute("idle"));
        breaker.record_failure("flaky");
        assert_eq!(breaker.tracked_count(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        let evicted = breaker.sweep();

        // "idle" is closed with zero failures and stale; "flaky" has a
        // failure count and must survive.
        assert_eq!(evicted, 1);
        assert!(breaker.get_state("idle").is_none());
        assert!(breaker.get_state("flaky").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_recently_touched_entries() {
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                stale_after_secs: 10,
                ..BreakerConfig::default()
            },
            Arc::new(NullSink),
        );

        assert!(breaker.can_execute("fresh"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.sweep(), 0);
        assert!(breaker.get_state("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_closed_open_half_open_closed() {
        let breaker = test_breaker(3, 1, 1_000);

        breaker.record_failure("pricing");
        breaker.record_failure("pricing");
        breaker.record_failure("pricing");
        assert!(!breaker.can_execute("pricing"));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(breaker.can_execute("pricing"));
        assert_eq!(
            breaker.get_state("pricing").unwrap().state,
            CircuitState::HalfOpen
        );

        breaker.record_success("pricing");
        assert_eq!(
            breaker.get_state("pricing").unwrap().state,
            CircuitState::Closed
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = CircuitSnapshot {
            agent_id: "hero".to_string(),
            state: CircuitState::HalfOpen,
            failures: 1,
            successes: 0,
            next_retry_in_ms: None,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "half-open");
    }
}
