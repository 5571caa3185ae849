use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Status of a handoff chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// The routing episode is still in progress.
    Active,
    /// Ended normally.
    Completed,
    /// A handoff in the chain failed terminally.
    Failed,
    /// Refused for exceeding the depth bound.
    DepthExceeded,
}

impl ChainStatus {
    /// Whether the chain accepts further hops.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChainStatus::Active)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStatus::Active => write!(f, "active"),
            ChainStatus::Completed => write!(f, "completed"),
            ChainStatus::Failed => write!(f, "failed"),
            ChainStatus::DepthExceeded => write!(f, "depth_exceeded"),
        }
    }
}

/// One control transfer within a chain. Appended, never mutated afterward.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffHop {
    /// 1-based position in the chain.
    pub hop_number: u32,
    /// The agent that handed control away.
    pub from_agent: String,
    /// The agent that received control.
    pub to_agent: String,
    /// Routing confidence behind the transfer.
    pub confidence: f64,
    /// Routing reason behind the transfer.
    pub reason: String,
    /// How long the target execution took.
    pub duration_ms: u64,
    /// Size in bytes of the (compressed) context handed over.
    pub context_size: usize,
}

/// One routing episode: the ordered hops for a single originating request,
/// with a depth bound that is the primary defense against agent ping-pong
/// loops.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffChain {
    /// Stable id derived from the originating request.
    pub chain_id: String,
    /// The originating request.
    pub request_id: Uuid,
    /// Hops so far, in order.
    pub hops: Vec<HandoffHop>,
    /// Number of hops taken. Monotonically non-decreasing.
    pub depth: u32,
    /// Bound on `depth`.
    pub max_depth: u32,
    /// Lifecycle status.
    pub status: ChainStatus,
    /// When the chain was created.
    pub created_at: DateTime<Utc>,
    /// When the chain last changed.
    pub updated_at: DateTime<Utc>,
}

impl HandoffChain {
    /// Create an active chain for a request.
    pub fn new(request_id: Uuid, max_depth: u32) -> Self {
        let now = Utc::now();
        Self {
            chain_id: format!("chain-{request_id}"),
            request_id,
            hops: Vec::new(),
            depth: 0,
            max_depth,
            status: ChainStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether taking one more hop would pass the depth bound.
    pub fn would_exceed_depth(&self) -> bool {
        self.depth + 1 > self.max_depth
    }

    /// The most recent hop, if any.
    pub fn last_hop(&self) -> Option<&HandoffHop> {
        self.hops.last()
    }

    pub(crate) fn record_hop(&mut self, hop: HandoffHop) {
        self.depth += 1;
        self.hops.push(hop);
        self.updated_at = Utc::now();
    }

    pub(crate) fn terminate(&mut self, status: ChainStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
