use serde::Serialize;
use tracing::{debug, warn};

/// A structured operability event emitted by the core.
///
/// Every circuit transition, forced deadlock failure, and handoff refusal
/// produces exactly one event, in addition to its tracing log line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A circuit breaker changed state.
    CircuitTransition {
        /// The agent whose circuit transitioned.
        agent_id: String,
        /// State before the transition.
        from_state: String,
        /// State after the transition.
        to_state: String,
        /// Failure count at transition time.
        failures: u32,
        /// Milliseconds until the next probe is allowed, if the circuit
        /// is now open.
        next_retry_in_ms: Option<u64>,
    },
    /// The scheduler force-failed an agent that could never become ready.
    DeadlockFailure {
        /// The force-failed agent.
        agent_id: String,
        /// The phase it was queued in.
        phase: String,
        /// Which dependency made it unsatisfiable.
        reason: String,
    },
    /// The router refused a handoff.
    HandoffRefused {
        /// The chain the refusal belongs to.
        chain_id: String,
        /// The refused target agent.
        target_agent: String,
        /// Why the handoff was refused.
        reason: String,
    },
}

/// Sink contract for structured events and counters.
///
/// The core emits; installing a subscriber or shipping counters somewhere
/// is the embedding application's concern.
pub trait TelemetrySink: Send + Sync {
    /// Record one structured event.
    fn emit(&self, event: TelemetryEvent);
    /// Increment a named counter.
    fn counter(&self, name: &str, value: u64);
}

/// Default sink that forwards everything to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::CircuitTransition {
                agent_id,
                from_state,
                to_state,
                failures,
                ..
            } => debug!(
                agent_id = %agent_id,
                from = %from_state,
                to = %to_state,
                failures,
                "circuit transition"
            ),
            TelemetryEvent::DeadlockFailure {
                agent_id,
                phase,
                reason,
            } => warn!(agent_id = %agent_id, phase = %phase, reason = %reason, "deadlock failure"),
            TelemetryEvent::HandoffRefused {
                chain_id,
                target_agent,
                reason,
            } => warn!(
                chain_id = %chain_id,
                target_agent = %target_agent,
                reason = %reason,
                "handoff refused"
            ),
        }
    }

    fn counter(&self, name: &str, value: u64) {
        debug!(counter = name, value, "counter");
    }
}

/// Sink that drops everything. Useful in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: TelemetryEvent) {}
    fn counter(&self, _name: &str, _value: u64) {}
}
