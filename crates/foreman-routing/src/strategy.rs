use crate::router::RoutableAgent;
use async_trait::async_trait;
use foreman_core::ForemanResult;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Confidence attached to a hardcoded fallback decision.
const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Which strategy produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMethod {
    /// The model-based collaborator decided.
    Llm,
    /// Keyword/capability rule matching decided.
    Rules,
    /// The configured hardcoded fallback target.
    Fallback,
}

impl fmt::Display for RoutingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMethod::Llm => write!(f, "llm"),
            RoutingMethod::Rules => write!(f, "rules"),
            RoutingMethod::Fallback => write!(f, "fallback"),
        }
    }
}

/// A candidate target with its relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct RankedTarget {
    /// The candidate agent.
    pub agent_id: String,
    /// Relevance score in `0.0..=1.0`.
    pub score: f64,
}

/// A proposed control transfer.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// The agent handing control away.
    pub from_agent: String,
    /// The proposed target.
    pub target_agent: String,
    /// Confidence in the proposal, `0.0..=1.0`.
    pub confidence: f64,
    /// Human-readable rationale.
    pub reason: String,
    /// Ranked alternative targets.
    pub alternatives: Vec<RankedTarget>,
    /// Which strategy produced this decision.
    pub method: RoutingMethod,
}

/// Outcome of one routing strategy: a decision, or an explicit
/// could-not-decide that sends evaluation to the next strategy. Strategies
/// signal indecision through this type, not through errors.
#[derive(Debug)]
pub enum RoutingVerdict {
    /// The strategy proposes this transfer.
    Decided(RoutingDecision),
    /// The strategy cannot decide; try the next one.
    Undecided,
}

/// Model-backed routing collaborator (the primary strategy).
///
/// Implementations may return [`RoutingVerdict::Undecided`] or fail; both
/// send evaluation to the rule-based strategy.
#[async_trait]
pub trait RoutingModel: Send + Sync {
    /// Propose a target for the current output, or decline.
    async fn propose(
        &self,
        current_agent: &str,
        output: &str,
        input: &str,
        context: &Value,
        candidates: &[RoutableAgent],
    ) -> ForemanResult<RoutingVerdict>;
}

/// Rule-based strategy: scores candidates by trigger keyword and
/// capability mentions in the agent output and original input.
pub(crate) fn rules_verdict(
    current_agent: &str,
    output: &str,
    input: &str,
    candidates: &[RoutableAgent],
) -> RoutingVerdict {
    let haystack = format!("{output}\n{input}");
    let mut ranked: Vec<RankedTarget> = candidates
        .iter()
        .filter_map(|agent| {
            let score = keyword_score(agent, &haystack);
            (score > 0.0).then(|| RankedTarget {
                agent_id: agent.agent_id.clone(),
                score,
            })
        })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let Some(best) = ranked.first().cloned() else {
        debug!(current_agent, "rule-based routing found no keyword match");
        return RoutingVerdict::Undecided;
    };

    RoutingVerdict::Decided(RoutingDecision {
        from_agent: current_agent.to_string(),
        target_agent: best.agent_id.clone(),
        confidence: best.score,
        reason: format!("trigger keywords matched for '{}'", best.agent_id),
        alternatives: ranked.into_iter().skip(1).collect(),
        method: RoutingMethod::Rules,
    })
}

/// Final strategy: the configured hardcoded fallback target, if any.
pub(crate) fn fallback_verdict(
    current_agent: &str,
    fallback_agent: Option<&str>,
    candidates: &[RoutableAgent],
) -> RoutingVerdict {
    let Some(target) = fallback_agent else {
        return RoutingVerdict::Undecided;
    };
    if !candidates.iter().any(|a| a.agent_id == target) {
        debug!(target, "fallback target is not an available candidate");
        return RoutingVerdict::Undecided;
    }
    RoutingVerdict::Decided(RoutingDecision {
        from_agent: current_agent.to_string(),
        target_agent: target.to_string(),
        confidence: FALLBACK_CONFIDENCE,
        reason: "configured fallback target".to_string(),
        alternatives: Vec::new(),
        method: RoutingMethod::Fallback,
    })
}

/// Fraction of an agent's trigger keywords and capabilities that appear in
/// the haystack, weighted toward keywords.
fn keyword_score(agent: &RoutableAgent, haystack: &str) -> f64 {
    let keyword_hits = count_matches(&agent.trigger_keywords, haystack);
    let capability_hits = count_matches(&agent.capabilities, haystack);

    let keyword_part = if agent.trigger_keywords.is_empty() {
        0.0
    } else {
        keyword_hits as f64 / agent.trigger_keywords.len() as f64
    };
    let capability_part = if agent.capabilities.is_empty() {
        0.0
    } else {
        capability_hits as f64 / agent.capabilities.len() as f64
    };

    (keyword_part * 0.8 + capability_part * 0.2).min(1.0)
}

fn count_matches(terms: &[String], haystack: &str) -> usize {
    terms
        .iter()
        .filter(|term| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term)))
                .map(|re| re.is_match(haystack))
                .unwrap_or(false)
        })
        .count()
}
