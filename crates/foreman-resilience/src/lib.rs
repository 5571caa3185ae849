//! Per-agent circuit breaking for the Foreman pipeline.
//!
//! Shields the pipeline from cascading failures: once an agent fails
//! repeatedly its circuit opens and callers are refused until a reset
//! timeout elapses, after which a limited probe window (half-open) decides
//! whether to close the circuit again.
//!
//! # Main types
//!
//! - [`CircuitBreaker`] — Per-agent-id three-state machine with a
//!   background staleness sweep.
//! - [`CircuitState`] — `Closed`, `Open`, or `HalfOpen`.
//! - [`CircuitSnapshot`] — Read-only view of one agent's circuit.
//! - [`TransitionEvent`] — Broadcast to subscribers on every transition.

/// The circuit breaker state machine.
pub mod breaker;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, TransitionEvent};
