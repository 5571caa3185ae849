//! Loop-safe control transfer between agents for Foreman.
//!
//! One agent may hand control to another mid-build under a confidence
//! threshold. Routing strategies (model, rules, hardcoded fallback) are
//! tried in order; execution is gated by the target's circuit breaker and
//! a per-request chain depth bound, and handoff contexts are compressed to
//! a byte budget with a preserve-list passed through untouched.
//!
//! # Main types
//!
//! - [`HandoffRouter`] — Evaluates and executes handoffs.
//! - [`RoutableAgent`] — A registered target with capabilities, trigger
//!   keywords, and a concurrency budget.
//! - [`RoutingDecision`] / [`RoutingVerdict`] — Strategy outputs.
//! - [`HandoffChain`] / [`HandoffHop`] — The per-request routing episode.
//! - [`ContextCompressor`] — Byte-budget context reduction.

/// Handoff chains and hops.
pub mod chain;
/// Context compression.
pub mod compressor;
/// The handoff router.
pub mod router;
/// Routing strategies and the model collaborator contract.
pub mod strategy;

pub use chain::{ChainStatus, HandoffChain, HandoffHop};
pub use compressor::{CompressedContext, CompressionStrategy, ContextCompressor};
pub use router::{
    HandoffExecutionResult, HandoffExecutor, HandoffOptions, HandoffRouter, RoutableAgent,
};
pub use strategy::{RankedTarget, RoutingDecision, RoutingMethod, RoutingModel, RoutingVerdict};
