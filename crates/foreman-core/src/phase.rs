use serde::{Deserialize, Serialize};
use std::fmt;

/// A named stage of the build. Phases execute sequentially relative to each
/// other in the order of [`Phase::ORDER`]; agents inside a phase may run
/// concurrently when the phase is marked parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Requirements gathering and analysis.
    Discovery,
    /// Structural planning (sitemap, sections, data shapes).
    Blueprint,
    /// Primary content production. Parallel.
    Content,
    /// Secondary enrichment on top of produced content. Parallel.
    Enhancement,
    /// Combining all produced pieces into the final output.
    Assembly,
    /// Final quality checks.
    Review,
}

impl Phase {
    /// The fixed, product-defined phase sequence.
    pub const ORDER: [Phase; 6] = [
        Phase::Discovery,
        Phase::Blueprint,
        Phase::Content,
        Phase::Enhancement,
        Phase::Assembly,
        Phase::Review,
    ];

    /// Whether agents in this phase may be dispatched concurrently.
    pub fn is_parallel(&self) -> bool {
        matches!(self, Phase::Content | Phase::Enhancement)
    }

    /// Zero-based position of this phase in [`Phase::ORDER`].
    pub fn position(&self) -> usize {
        match self {
            Phase::Discovery => 0,
            Phase::Blueprint => 1,
            Phase::Content => 2,
            Phase::Enhancement => 3,
            Phase::Assembly => 4,
            Phase::Review => 5,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Discovery => write!(f, "discovery"),
            Phase::Blueprint => write!(f, "blueprint"),
            Phase::Content => write!(f, "content"),
            Phase::Enhancement => write!(f, "enhancement"),
            Phase::Assembly => write!(f, "assembly"),
            Phase::Review => write!(f, "review"),
        }
    }
}
