//! Background synthesis: block metadata synthesis, daily and weekly
//! digests, and the user-profile scribe driven by the job outbox.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::ai::{self, AiConfig, ModelTier};
use crate::db::{BlockMetadataPatch, SynthesisKind};
use crate::db_call;
use crate::error::HmlrError;
use crate::prompts;
use crate::util::clip_chars;
use crate::SharedDB;

const SCRIBE_BATCH: usize = 8;
const PROFILE_FACTS: usize = 30;

/// Ask the small tier to produce a block's metadata from its turns, then
/// merge it in. Replaces the heuristic summary when it succeeds.
pub async fn synthesize_block(
    db: &SharedDB,
    ai_cfg: &AiConfig,
    block_id: &str,
) -> Result<(), HmlrError> {
    let bid = block_id.to_string();
    let turns = db_call(db, move |d| d.turns_by_block(&bid)).await??;
    if turns.is_empty() {
        return Ok(());
    }

    #[derive(Deserialize)]
    struct BlockReply {
        topic_label: String,
        summary: String,
        #[serde(default)]
        user_affect: Option<String>,
        #[serde(default)]
        open_loops: Vec<String>,
        #[serde(default)]
        decisions_made: Vec<String>,
        #[serde(default)]
        keywords: Vec<String>,
    }

    let transcript = turns
        .iter()
        .map(|t| format!("User: {}\nAssistant: {}", t.user_message, t.ai_response))
        .collect::<Vec<_>>()
        .join("\n\n");
    let user = format!("Conversation segment ({} turns):\n\n{}", turns.len(), clip_chars(&transcript, 12000));

    let tcr = ai::llm_tool_call::<BlockReply>(
        ai_cfg,
        ModelTier::Governor,
        prompts::BLOCK_SYNTHESIS_SYSTEM,
        &user,
        "describe_block",
        "Produce metadata for the conversation segment",
        prompts::block_synthesis_schema(),
    )
    .await?;

    if let Some(ref u) = tcr.usage {
        let model = tcr.model.clone();
        let (pt, ct) = (u.prompt_tokens, u.completion_tokens);
        let dur = tcr.duration_ms;
        let _ =
            db_call(db, move |d| d.log_llm_call("block_synthesis", &model, pt, ct, 0, dur)).await;
    }

    let reply = tcr.value;
    debug!(block = block_id, affect = ?reply.user_affect, "block synthesized");
    let patch = BlockMetadataPatch {
        topic_label: Some(reply.topic_label),
        summary: Some(reply.summary),
        keywords: reply.keywords,
        open_loops: reply.open_loops,
        decisions_made: reply.decisions_made,
    };
    let bid = block_id.to_string();
    db_call(db, move |d| d.update_block_metadata(&bid, &patch)).await??;
    Ok(())
}

/// Distil one day's blocks into a digest row.
pub async fn synthesize_day(
    db: &SharedDB,
    ai_cfg: &AiConfig,
    day_id: &str,
) -> Result<(), HmlrError> {
    let day = day_id.to_string();
    let blocks = db_call(db, move |d| d.blocks_by_day(&day)).await??;
    if blocks.is_empty() {
        return Ok(());
    }

    let listing = blocks
        .iter()
        .map(|b| {
            format!(
                "- {} ({} turns): {}\n  decisions: {}\n  open: {}",
                b.topic_label,
                b.turn_count,
                b.summary,
                b.decisions_made.join("; "),
                b.open_loops.join("; "),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!("Topics for {day_id}:\n{listing}");

    let result = ai::llm_chat(
        ai_cfg,
        ModelTier::Governor,
        prompts::DAY_SYNTHESIS_SYSTEM,
        &user,
        1024,
        0.3,
    )
    .await?;

    let source_ids: Vec<String> = blocks.iter().map(|b| b.id.clone()).collect();
    let day = day_id.to_string();
    let content = result.content;
    db_call(db, move |d| d.put_synthesis(SynthesisKind::Day, &day, &content, &source_ids))
        .await??;
    info!(day = day_id, "day synthesis stored");
    Ok(())
}

/// Fold the most recent daily digests into a weekly one, keyed by ISO week.
pub async fn synthesize_week(db: &SharedDB, ai_cfg: &AiConfig) -> Result<(), HmlrError> {
    let days = db_call(db, |d| d.recent_syntheses(SynthesisKind::Day, 7)).await??;
    if days.is_empty() {
        return Ok(());
    }

    let listing = days
        .iter()
        .map(|s| format!("{}: {}", s.period_key, s.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    let user = format!("Daily digests, newest first:\n\n{listing}");

    let result = ai::llm_chat(
        ai_cfg,
        ModelTier::Governor,
        prompts::WEEK_SYNTHESIS_SYSTEM,
        &user,
        1024,
        0.3,
    )
    .await?;

    let week_key = chrono::Utc::now().format("%G-W%V").to_string();
    let source_ids: Vec<String> = days.iter().map(|s| s.id.clone()).collect();
    let content = result.content;
    db_call(db, move |d| d.put_synthesis(SynthesisKind::Week, &week_key, &content, &source_ids))
        .await??;
    info!("week synthesis stored");
    Ok(())
}

/// Drain the scribe outbox: each batch of queued jobs triggers one
/// profile rewrite from recent facts and block summaries.
pub async fn run_scribe(db: &SharedDB, ai_cfg: &AiConfig) -> Result<usize, HmlrError> {
    let jobs = db_call(db, |d| d.claim_scribe_jobs(SCRIBE_BATCH)).await??;
    if jobs.is_empty() {
        return Ok(0);
    }

    let current = db_call(db, |d| d.current_profile()).await??.unwrap_or_default();
    let facts = db_call(db, |d| d.list_facts(PROFILE_FACTS, 0)).await??;
    let day = crate::db::today_day_id();
    let blocks = db_call(db, move |d| d.blocks_by_day(&day)).await??;

    let fact_lines = facts
        .iter()
        .filter(|f| !f.is_deleted())
        .map(|f| format!("- {} = {}", f.key, f.value))
        .collect::<Vec<_>>()
        .join("\n");
    let block_lines = blocks
        .iter()
        .filter(|b| !b.summary.is_empty())
        .map(|b| format!("- {}: {}", b.topic_label, b.summary))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "Current profile:\n{}\n\nRecent facts:\n{}\n\nToday's topics:\n{}",
        if current.is_empty() { "(none yet)" } else { &current },
        fact_lines,
        block_lines,
    );

    let result = match ai::llm_chat(
        ai_cfg,
        ModelTier::Governor,
        prompts::PROFILE_SCRIBE_SYSTEM,
        &user,
        512,
        0.3,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "profile scribe failed, jobs stay queued for retry");
            return Err(e);
        }
    };

    let content = result.content.trim().to_string();
    if !content.is_empty() {
        let sources: Vec<String> = jobs.iter().map(|j| j.turn_id.clone()).collect();
        db_call(db, move |d| {
            d.put_synthesis(SynthesisKind::Profile, "current", &content, &sources)
        })
        .await??;
    }

    let count = jobs.len();
    for job in jobs {
        let id = job.id;
        let _ = db_call(db, move |d| d.finish_scribe_job(id, true)).await;
    }
    info!(jobs = count, "scribe drained");
    Ok(count)
}
