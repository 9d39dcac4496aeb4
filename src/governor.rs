//! The routing/filtering fan-out: where does this query go, which
//! retrieved memories survive, which facts match. The three tasks have no
//! ordering dependency and run concurrently; the result exists only once
//! all three complete.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ai::{self, AiConfig, ModelTier};
use crate::config::HmlrConfig;
use crate::db::{BlockMetadata, Fact};
use crate::db_call;
use crate::error::HmlrError;
use crate::prompts;
use crate::retrieval::{self, ScoredMemory};
use crate::shift;
use crate::thresholds::{
    GOVERNOR_CANDIDATE_LIMIT, GOVERNOR_FALLBACK_TOP, MAX_FACT_KEY_CANDIDATES,
};
use crate::util::clip_chars;
use crate::SharedDB;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub matched_block_id: Option<String>,
    pub is_new_topic: bool,
    pub reasoning: String,
    pub suggested_label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GovernResult {
    pub routing: RoutingDecision,
    pub memories: Vec<ScoredMemory>,
    pub facts: Vec<Fact>,
}

/// The four ways a routed query lands in the day ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "block_id")]
pub enum RouteScenario {
    /// Matched the last-active block; it stays ACTIVE.
    Continuation(String),
    /// Matched a paused block; pause the last-active, reactivate this one.
    Resumption(String),
    /// New topic and nothing was active; open a fresh block.
    NewBlock,
    /// New topic while a block was active; pause it, open a fresh block.
    TopicShift { paused: String },
}

/// Map a routing decision onto a scenario given the day's last-active
/// block. Inconsistent combinations fall back to opening a new block.
pub fn resolve_scenario(
    routing: &RoutingDecision,
    last_active: Option<&str>,
) -> RouteScenario {
    match (&routing.matched_block_id, last_active) {
        (Some(m), Some(last)) if m == last => RouteScenario::Continuation(m.clone()),
        (Some(m), _) if !routing.is_new_topic => RouteScenario::Resumption(m.clone()),
        _ if routing.is_new_topic => match last_active {
            Some(last) => RouteScenario::TopicShift { paused: last.to_string() },
            None => RouteScenario::NewBlock,
        },
        // matched nothing, not a new topic — inconsistent input
        _ => RouteScenario::NewBlock,
    }
}

fn acronym_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][A-Z0-9_]+\b").expect("acronym pattern"))
}

/// Candidate fact keys: capitalized acronyms first (matched verbatim),
/// then plain content words, deduped in order, capped at ten.
pub fn extract_fact_keys(query: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut keys: Vec<String> = Vec::new();
    for m in acronym_pattern().find_iter(query) {
        let k = m.as_str().to_string();
        if seen.insert(k.to_lowercase()) {
            keys.push(k);
        }
    }
    for term in retrieval::extract_terms(query) {
        if seen.insert(term.to_lowercase()) {
            keys.push(term);
        }
    }
    keys.truncate(MAX_FACT_KEY_CANDIDATES);
    keys
}

/// Render the day ledger for the router prompt: one line per block with
/// label, status, last-active marker, clipped summary, leading keywords,
/// and turn count.
fn render_ledger(blocks: &[BlockMetadata]) -> String {
    blocks
        .iter()
        .map(|b| {
            let marker = if b.is_last_active { " [LAST-ACTIVE]" } else { "" };
            let keywords: Vec<&str> =
                b.keywords.iter().take(5).map(String::as_str).collect();
            format!(
                "- {} \"{}\" ({}{marker}) turns={} keywords=[{}] summary: {}",
                b.id,
                b.topic_label,
                b.status.as_str(),
                b.turn_count,
                keywords.join(", "),
                clip_chars(&b.summary, 150),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn route(
    db: &SharedDB,
    ai_cfg: Option<&AiConfig>,
    query: &str,
    day_id: &str,
) -> Result<RoutingDecision, HmlrError> {
    let day = day_id.to_string();
    let blocks = db_call(db, move |d| d.block_metadata_by_day(&day)).await??;

    if blocks.is_empty() {
        return Ok(RoutingDecision {
            matched_block_id: None,
            is_new_topic: true,
            reasoning: "first_query_of_day".into(),
            suggested_label: Some("Initial Conversation".into()),
        });
    }

    let last_active = blocks.iter().find(|b| b.is_last_active);
    // Heuristic routing when the small tier is unavailable or unusable:
    // the shift detector decides against the last-active block's keywords.
    let fallback = || {
        let keywords =
            last_active.map(|b| b.keywords.as_slice()).unwrap_or_default();
        let decision = shift::check_for_shift(query, keywords);
        if decision.is_shift {
            RoutingDecision {
                matched_block_id: None,
                is_new_topic: true,
                reasoning: decision.reason,
                suggested_label: decision.new_topic_label,
            }
        } else {
            RoutingDecision {
                matched_block_id: last_active.map(|b| b.id.clone()),
                is_new_topic: false,
                reasoning: decision.reason,
                suggested_label: None,
            }
        }
    };

    let Some(cfg) = ai_cfg else {
        return Ok(fallback());
    };

    #[derive(Deserialize)]
    struct RouteReply {
        #[serde(default)]
        matched_block_id: Option<String>,
        is_new_topic: bool,
        #[serde(default)]
        reasoning: Option<String>,
        #[serde(default)]
        suggested_label: Option<String>,
    }

    let user = format!(
        "Today's blocks:\n{}\n\nIncoming message: {query}",
        render_ledger(&blocks)
    );

    match ai::llm_tool_call::<RouteReply>(
        cfg,
        ModelTier::Governor,
        prompts::ROUTER_SYSTEM,
        &user,
        "route_message",
        "Route the message to a block or declare a new topic",
        prompts::router_schema(),
    )
    .await
    {
        Ok(tcr) => {
            if let Some(ref u) = tcr.usage {
                let model = tcr.model.clone();
                let (pt, ct) = (u.prompt_tokens, u.completion_tokens);
                let dur = tcr.duration_ms;
                let _ = db_call(db, move |d| d.log_llm_call("router", &model, pt, ct, 0, dur))
                    .await;
            }
            let reply = tcr.value;
            // A matched id that isn't in the ledger is a hallucination;
            // treat it as a parse failure.
            if let Some(ref id) = reply.matched_block_id {
                if !blocks.iter().any(|b| &b.id == id) {
                    warn!(block = %id, "router matched unknown block, using last-active");
                    return Ok(fallback());
                }
            }
            Ok(RoutingDecision {
                matched_block_id: reply.matched_block_id,
                is_new_topic: reply.is_new_topic,
                reasoning: reply.reasoning.unwrap_or_default(),
                suggested_label: reply.suggested_label,
            })
        }
        Err(e) if matches!(e, HmlrError::Parse(_)) => {
            warn!(error = %e, "router reply unparseable, using last-active");
            Ok(fallback())
        }
        Err(e) => {
            warn!(error = %e, "router call failed, using last-active");
            Ok(fallback())
        }
    }
}

/// The 2-key memory filter: vector candidates judged by the small tier so
/// near-matches with opposite meaning are dropped. Parse failure falls
/// back to the top candidates by vector score.
async fn filter_memories(
    db: &SharedDB,
    ai_cfg: Option<&AiConfig>,
    query: &str,
    query_embedding: Option<&[f32]>,
) -> Result<Vec<ScoredMemory>, HmlrError> {
    let candidates = match query_embedding {
        Some(emb) => {
            let emb = emb.to_vec();
            db_call(db, move |d| {
                retrieval::search_memories_semantic(d, &emb, GOVERNOR_CANDIDATE_LIMIT)
            })
            .await??
        }
        None => {
            let terms = retrieval::extract_terms(query);
            db_call(db, move |d| {
                retrieval::search_memories(d, &terms, GOVERNOR_CANDIDATE_LIMIT)
            })
            .await??
        }
    };

    if candidates.is_empty() {
        return Ok(vec![]);
    }

    let Some(cfg) = ai_cfg else {
        return Ok(candidates.into_iter().take(GOVERNOR_FALLBACK_TOP).collect());
    };

    #[derive(Deserialize)]
    struct FilterReply {
        relevant_indices: Vec<usize>,
        #[serde(default)]
        reasoning: Option<String>,
    }

    let listing = candidates
        .iter()
        .enumerate()
        .map(|(i, m)| format!("[{i}] {}", clip_chars(&m.memory.content, 300)))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!("Query: {query}\n\nCandidate memories:\n{listing}");

    match ai::llm_tool_call::<FilterReply>(
        cfg,
        ModelTier::Governor,
        prompts::MEMORY_FILTER_SYSTEM,
        &user,
        "filter_memories",
        "Select the indices of memories relevant to the query",
        prompts::memory_filter_schema(),
    )
    .await
    {
        Ok(tcr) => {
            if let Some(ref u) = tcr.usage {
                let model = tcr.model.clone();
                let (pt, ct) = (u.prompt_tokens, u.completion_tokens);
                let dur = tcr.duration_ms;
                let _ = db_call(db, move |d| {
                    d.log_llm_call("memory_filter", &model, pt, ct, 0, dur)
                })
                .await;
            }
            if let Some(reason) = tcr.value.reasoning {
                debug!(reason, "memory filter");
            }
            Ok(tcr
                .value
                .relevant_indices
                .into_iter()
                .filter_map(|i| candidates.get(i).cloned())
                .collect())
        }
        Err(e) => {
            warn!(error = %e, "memory filter failed, keeping top candidates");
            Ok(candidates.into_iter().take(GOVERNOR_FALLBACK_TOP).collect())
        }
    }
}

async fn lookup_facts(db: &SharedDB, query: &str) -> Result<Vec<Fact>, HmlrError> {
    let keys = extract_fact_keys(query);
    if keys.is_empty() {
        return Ok(vec![]);
    }
    db_call(db, move |d| -> Result<Vec<Fact>, HmlrError> {
        let mut out = Vec::new();
        for key in &keys {
            if let Some(fact) = d.get_fact(key)? {
                if !fact.is_deleted() {
                    out.push(fact);
                }
            }
        }
        Ok(out)
    })
    .await?
}

/// Run routing, memory filtering, and fact lookup concurrently and fan the
/// results back in.
pub async fn govern(
    db: &SharedDB,
    ai_cfg: Option<&AiConfig>,
    _cfg: &HmlrConfig,
    query: &str,
    query_embedding: Option<&[f32]>,
    day_id: &str,
) -> Result<GovernResult, HmlrError> {
    let (routing, memories, facts) = tokio::join!(
        route(db, ai_cfg, query, day_id),
        filter_memories(db, ai_cfg, query, query_embedding),
        lookup_facts(db, query),
    );
    Ok(GovernResult { routing: routing?, memories: memories?, facts: facts? })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing(
        matched: Option<&str>,
        is_new_topic: bool,
    ) -> RoutingDecision {
        RoutingDecision {
            matched_block_id: matched.map(str::to_string),
            is_new_topic,
            reasoning: String::new(),
            suggested_label: None,
        }
    }

    #[test]
    fn scenario_continuation_when_matched_is_last_active() {
        let s = resolve_scenario(&routing(Some("blk_a"), false), Some("blk_a"));
        assert_eq!(s, RouteScenario::Continuation("blk_a".into()));
    }

    #[test]
    fn scenario_resumption_for_other_matched_block() {
        let s = resolve_scenario(&routing(Some("blk_b"), false), Some("blk_a"));
        assert_eq!(s, RouteScenario::Resumption("blk_b".into()));
    }

    #[test]
    fn scenario_new_block_when_nothing_active() {
        let s = resolve_scenario(&routing(None, true), None);
        assert_eq!(s, RouteScenario::NewBlock);
    }

    #[test]
    fn scenario_topic_shift_pauses_last_active() {
        let s = resolve_scenario(&routing(None, true), Some("blk_a"));
        assert_eq!(s, RouteScenario::TopicShift { paused: "blk_a".into() });
    }

    #[test]
    fn scenario_inconsistent_input_falls_back_to_new_block() {
        let s = resolve_scenario(&routing(None, false), Some("blk_a"));
        assert_eq!(s, RouteScenario::NewBlock);
    }

    #[test]
    fn fact_keys_prefer_acronyms_then_terms() {
        let keys = extract_fact_keys("What does HMLR mean for the contract?");
        assert_eq!(keys[0], "HMLR");
        assert!(keys.contains(&"contract".to_string()));
        assert!(!keys.contains(&"hmlr".to_string()));
    }

    #[test]
    fn fact_keys_deduped_and_capped() {
        let keys = extract_fact_keys(
            "AWS AWS lambda lambda serverless endpoint region bucket queue table stream shard node",
        );
        assert!(keys.len() <= 10);
        let lowered: Vec<String> = keys.iter().map(|k| k.to_lowercase()).collect();
        let mut deduped = lowered.clone();
        deduped.dedup();
        assert_eq!(lowered.len(), deduped.len());
    }
}
