//! Core types and error definitions for the Foreman orchestration core.
//!
//! This crate provides the foundational types shared across all Foreman
//! crates: the unified error enum, the agent registry, the build phase
//! sequence, configuration, and the telemetry sink contract.
//!
//! # Main types
//!
//! - [`ForemanError`] — Unified error enum for all Foreman subsystems.
//! - [`ForemanResult`] — Convenience alias for `Result<T, ForemanError>`.
//! - [`AgentDefinition`] — Static description of one unit of work.
//! - [`AgentRegistry`] — Lookup contract over registered agent definitions.
//! - [`Phase`] — The fixed build phase sequence.
//! - [`ForemanConfig`] — Workspace-wide configuration with TOML loading.
//! - [`TelemetrySink`] — Structured event/counter sink contract.

/// Agent definitions and the registry contract.
pub mod agent;
/// Configuration structs and TOML loading.
pub mod config;
/// The fixed build phase sequence.
pub mod phase;
/// Structured telemetry events and sinks.
pub mod telemetry;

pub use agent::{AgentDefinition, AgentRegistry, StaticRegistry};
pub use config::{BreakerConfig, ForemanConfig, RoutingConfig, SchedulerConfig};
pub use phase::Phase;
pub use telemetry::{NullSink, TelemetryEvent, TelemetrySink, TracingSink};

// --- Error types ---

/// Top-level error type for the Foreman orchestration core.
///
/// Structural errors carry enough context (which agents, which dependency,
/// which chain) for a caller to report *why* progress stalled rather than a
/// bare failure.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// A bad build plan or invalid configuration. Fatal; raised before
    /// scheduling begins, never at runtime.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Agents whose required dependencies can never be satisfied, detected
    /// by the blocked-agent scan. Resolved automatically by forced failure;
    /// non-fatal to the overall pipeline.
    #[error("Unsatisfiable dependencies for agents: {agents:?}")]
    DependencyUnsatisfiable {
        /// The blocked agent ids.
        agents: Vec<String>,
    },

    /// Terminal failure of one agent invocation. Retries are owned by the
    /// execution collaborator; the scheduler only ever sees this.
    #[error("Agent '{agent_id}' execution failed: {reason}")]
    Execution {
        /// The agent that failed.
        agent_id: String,
        /// Why the collaborator gave up.
        reason: String,
    },

    /// A handoff was refused because the target agent's circuit is not
    /// accepting calls. Non-fatal.
    #[error("Circuit is {state} for agent '{agent_id}', handoff refused")]
    CircuitOpen {
        /// The refused target agent.
        agent_id: String,
        /// The circuit state observed at refusal time.
        state: String,
    },

    /// A handoff would push its chain past the configured depth bound.
    /// Terminates that chain; does not abort the build.
    #[error("Handoff chain '{chain_id}' reached maximum depth {max_depth}")]
    ChainDepthExceeded {
        /// The chain that hit the bound.
        chain_id: String,
        /// The configured bound.
        max_depth: u32,
    },

    /// An internal compression failure. Never escapes a handoff — the
    /// compressor degrades to an uncompressed payload instead.
    #[error("Compression error: {0}")]
    Compression(String),

    /// An error from the handoff routing layer.
    #[error("Routing error: {0}")]
    Routing(String),

    /// An error from the scheduler.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;
