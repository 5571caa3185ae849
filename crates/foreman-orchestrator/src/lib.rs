//! Dependency-aware scheduling and pipeline execution for Foreman.
//!
//! Turns a declarative build plan into a live execution queue, enforces
//! concurrency limits, detects and resolves deadlock, and drives agent
//! workers to completion with timeouts and cooperative cancellation.
//!
//! # Main types
//!
//! - [`Planner`] — Converts an agent registry into an ordered [`BuildPlan`].
//! - [`BuildScheduler`] — Live queue state: ready-set computation, status
//!   transitions, blocked-agent resolution, progress.
//! - [`PipelineEngine`] — The coordinator loop dispatching ready agents to
//!   an [`AgentExecutor`] collaborator.
//! - [`AgentMonitor`] — Per-agent execution metrics.

/// The pipeline coordinator loop.
pub mod engine;
/// Per-agent execution metrics.
pub mod monitor;
/// Build plan construction and validation.
pub mod planner;
/// The live execution queue.
pub mod scheduler;

pub use engine::{AgentExecutor, BuildReport, PipelineEngine};
pub use monitor::{AgentMetrics, AgentMonitor};
pub use planner::{BuildPlan, PhasePlan, Planner};
pub use scheduler::{AgentStatus, BuildScheduler, QueueCounts, QueueItem};
