//! Sliding-window maintenance: time and space eviction with topic
//! affinity accounting, plus rehydration of referenced turns.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::HmlrConfig;
use crate::db::{now_ms, HmlrDB, Turn};
use crate::error::HmlrError;
use crate::thresholds::PREFETCH_MAX_TURNS;

#[derive(Debug, Default, Serialize)]
pub struct EvictionReport {
    pub time_evicted: usize,
    pub space_evicted: usize,
    pub remaining_turns: usize,
    pub remaining_tokens: usize,
}

fn evict_and_account(db: &HmlrDB, cfg_now: i64, turn: &Turn) -> Result<(), HmlrError> {
    if let Some(block) = db.get_block(&turn.block_id)? {
        let _ = db.update_topic_affinity(&block.topic_label, turn.timestamp, cfg_now);
    }
    db.evict_turn(&turn.id)?;
    Ok(())
}

/// Run both eviction policies over a day's window. Time eviction drops
/// turns older than the horizon; space eviction then drops oldest-first
/// until the window satisfies both the turn and token bounds.
pub fn check_and_evict(
    db: &HmlrDB,
    cfg: &HmlrConfig,
    day_id: &str,
) -> Result<EvictionReport, HmlrError> {
    let now = now_ms();
    let horizon_ms = (cfg.time_eviction_hours * 3_600_000.0) as i64;
    let mut report = EvictionReport::default();

    for turn in db.turns_by_day(day_id)? {
        if now - turn.timestamp > horizon_ms {
            evict_and_account(db, now, &turn)?;
            report.time_evicted += 1;
        }
    }

    // Space pass over whatever survived, oldest first.
    let mut remaining = db.turns_by_day(day_id)?;
    remaining.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    let mut total_tokens: usize = remaining.iter().map(Turn::token_estimate).sum();

    let mut idx = 0;
    while remaining.len() - idx > cfg.max_window_turns || total_tokens > cfg.max_window_tokens {
        let Some(oldest) = remaining.get(idx) else { break };
        total_tokens = total_tokens.saturating_sub(oldest.token_estimate());
        evict_and_account(db, now, oldest)?;
        report.space_evicted += 1;
        idx += 1;
    }

    report.remaining_turns = remaining.len() - idx;
    report.remaining_tokens = total_tokens;

    if report.time_evicted + report.space_evicted > 0 {
        info!(
            day = day_id,
            time_evicted = report.time_evicted,
            space_evicted = report.space_evicted,
            remaining = report.remaining_turns,
            "window eviction"
        );
    }
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct RehydratedTurn {
    #[serde(flatten)]
    pub turn: Turn,
    pub match_score: usize,
}

/// Promote earlier turns back into context when the query's keywords
/// overlap a non-current block. Scored by turn-keyword plus block-keyword
/// hits, newest first on ties, clipped to the rehydration cap.
pub fn rehydrate(
    db: &HmlrDB,
    cfg: &HmlrConfig,
    keywords: &[String],
    current_block_id: Option<&str>,
) -> Result<Vec<RehydratedTurn>, HmlrError> {
    if keywords.is_empty() {
        return Ok(vec![]);
    }
    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let candidates = db.turns_matching_keywords(keywords, current_block_id)?;

    let mut scored: Vec<RehydratedTurn> = Vec::with_capacity(candidates.len());
    for turn in candidates {
        let turn_matches = turn
            .keywords
            .iter()
            .filter(|k| lowered.contains(&k.to_lowercase()))
            .count();
        let block_matches = match db.get_block(&turn.block_id)? {
            Some(block) => block
                .keywords
                .iter()
                .filter(|k| lowered.contains(&k.to_lowercase()))
                .count(),
            None => 0,
        };
        let match_score = turn_matches + block_matches;
        if match_score > 0 {
            scored.push(RehydratedTurn { turn, match_score });
        }
    }

    scored.sort_by(|a, b| {
        b.match_score
            .cmp(&a.match_score)
            .then_with(|| b.turn.timestamp.cmp(&a.turn.timestamp))
            .then_with(|| a.turn.id.cmp(&b.turn.id))
    });
    scored.truncate(cfg.max_rehydration_turns);

    for r in &scored {
        let _ = db.bump_usage(&r.turn.id, "turn", None);
    }
    debug!(count = scored.len(), "rehydrated turns");
    Ok(scored)
}

/// Warm the window ahead of need: blocks whose keywords overlap the
/// current topic contribute their most recent turn ids, up to five.
pub fn prefetch_by_affinity(
    db: &HmlrDB,
    cfg: &HmlrConfig,
    topic: &str,
) -> Result<Vec<String>, HmlrError> {
    let topic_terms = crate::retrieval::extract_terms(topic);
    if topic_terms.is_empty() {
        return Ok(vec![]);
    }

    let day_id = crate::db::today_day_id();
    let mut blocks: Vec<(usize, String)> = db
        .blocks_by_day(&day_id)?
        .into_iter()
        .filter_map(|b| {
            let overlap = b
                .keywords
                .iter()
                .filter(|k| topic_terms.iter().any(|t| t.eq_ignore_ascii_case(k)))
                .count();
            (overlap > 0).then_some((overlap, b.id))
        })
        .collect();
    blocks.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    blocks.truncate(cfg.prefetch_window);

    let mut turn_ids = Vec::new();
    'outer: for (_, block_id) in blocks {
        let mut turns = db.turns_by_block(&block_id)?;
        turns.reverse();
        for turn in turns {
            turn_ids.push(turn.id);
            if turn_ids.len() >= PREFETCH_MAX_TURNS {
                break 'outer;
            }
        }
    }
    Ok(turn_ids)
}
