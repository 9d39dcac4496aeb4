//! The per-turn pipeline: chunk, embed, govern, route, hydrate, generate,
//! persist. Chunking, fact extraction, profile load, and scribe scheduling
//! are non-fatal; the governor, hydrator, generation, memory insert, and
//! turn append abort the turn with the failed step attached.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ai::{self, ModelTier};
use crate::chunker;
use crate::compressor;
use crate::db::{self, FactInput};
use crate::db_call;
use crate::error::{HmlrError, Step};
use crate::evict;
use crate::governor::{self, RouteScenario};
use crate::hydrator::{self, HydratorInput, MetadataMode};
use crate::prompts;
use crate::scribe;
use crate::util::short_id;
use crate::AppState;

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant with long-term memory of prior \
    conversations. Context sections above the user's message are recalled history — treat them \
    as your own knowledge, not as quoted text.";

const RESPONSE_MAX_TOKENS: u32 = 2000;
const RESPONSE_TEMPERATURE: f64 = 0.7;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatOutcome {
    pub response: String,
    pub block_id: String,
    pub turn_id: String,
    pub is_new_topic: bool,
    pub topic_label: String,
    pub scenario: RouteScenario,
    pub memories_used: usize,
    pub facts_used: usize,
    pub chunks_created: usize,
    pub facts_extracted: usize,
}

/// Extract keyed facts from a message with the small tier.
async fn extract_facts(
    state: &AppState,
    text: &str,
) -> Result<Vec<FactInput>, HmlrError> {
    let Some(ref ai_cfg) = state.ai else {
        return Ok(vec![]);
    };

    #[derive(Deserialize)]
    struct FactReply {
        #[serde(default)]
        facts: Vec<FactInput>,
    }

    let tcr = ai::llm_tool_call::<FactReply>(
        ai_cfg,
        ModelTier::Governor,
        prompts::FACT_EXTRACT_SYSTEM,
        text,
        "store_facts",
        "Store durable facts extracted from the message",
        prompts::fact_extract_schema(),
    )
    .await?;

    if let Some(ref u) = tcr.usage {
        let model = tcr.model.clone();
        let (pt, ct) = (u.prompt_tokens, u.completion_tokens);
        let dur = tcr.duration_ms;
        let _ =
            db_call(&state.db, move |d| d.log_llm_call("fact_extract", &model, pt, ct, 0, dur))
                .await;
    }
    Ok(tcr.value.facts)
}

/// Look the embedding up in the cache, hitting the embedder on a miss.
async fn embed_query(state: &AppState, text: &str) -> Option<Vec<f32>> {
    let ai_cfg = state.ai.as_ref()?;
    if let Some(hit) = state.embed_cache.get(text) {
        return Some(hit);
    }
    match ai::embed_one(ai_cfg, text).await {
        Ok(emb) => {
            state.embed_cache.insert(text.to_string(), emb.clone());
            Some(emb)
        }
        Err(e) => {
            warn!(error = %e, "query embedding failed, continuing without it");
            None
        }
    }
}

/// Upgrade a just-paused block's heuristic summary with LLM-written
/// metadata. Fire-and-forget; synthesis failure never touches the turn.
pub(crate) fn spawn_block_synthesis(state: &AppState, block_id: &str) {
    if state.ai.is_none() {
        return;
    }
    let state = state.clone();
    let bid = block_id.to_string();
    tokio::spawn(async move {
        let Some(ref ai_cfg) = state.ai else { return };
        if let Err(e) = scribe::synthesize_block(&state.db, ai_cfg, &bid).await {
            warn!(error = %e, block = %short_id(&bid), "block synthesis failed");
        }
    });
}

/// Execute the routed scenario and return the active block for this turn.
async fn apply_scenario(
    state: &AppState,
    scenario: &RouteScenario,
    suggested_label: Option<&str>,
    query: &str,
    day_id: &str,
) -> Result<db::BridgeBlock, HmlrError> {
    let db = &state.db;
    match scenario {
        RouteScenario::Continuation(id) => {
            let id = id.clone();
            db_call(db, move |d| d.get_block(&id))
                .await??
                .ok_or_else(|| HmlrError::Internal("routed block vanished".into()))
        }
        RouteScenario::Resumption(id) => {
            let day = day_id.to_string();
            if let Some(active) = db_call(db, move |d| d.get_active_block(Some(&day))).await?? {
                if &active.id != id {
                    let aid = active.id.clone();
                    db_call(db, move |d| d.pause_block_with_summary(&aid)).await??;
                    spawn_block_synthesis(state, &active.id);
                }
            }
            let resume = id.clone();
            db_call(db, move |d| {
                d.update_block_status(&resume, db::BlockStatus::Active)?;
                d.get_block(&resume)
            })
            .await??
            .ok_or_else(|| HmlrError::Internal("resumed block vanished".into()))
        }
        RouteScenario::NewBlock | RouteScenario::TopicShift { .. } => {
            let prev = if let RouteScenario::TopicShift { paused } = scenario {
                let pid = paused.clone();
                db_call(db, move |d| d.pause_block_with_summary(&pid)).await??;
                spawn_block_synthesis(state, paused);
                Some(paused.clone())
            } else {
                None
            };
            let label = suggested_label
                .map(str::to_string)
                .or_else(|| chunker::extract_lexical_filters(query).into_iter().next())
                .unwrap_or_else(|| "General Conversation".into());
            let keywords = chunker::extract_lexical_filters(query);
            let day = day_id.to_string();
            db_call(db, move |d| d.create_block(&day, &label, &keywords, prev.as_deref())).await?
        }
    }
}

/// One full chat turn.
pub async fn send_message(state: &AppState, req: ChatRequest) -> Result<ChatOutcome, HmlrError> {
    db::validate_message(&req.message)?;
    let query = req.message.trim().to_string();
    let user_id = req.user_id.unwrap_or_else(|| "default".into());
    let day_id = db::today_day_id();
    let turn_id = format!("turn_{}_{}", db::now_ms(), &uuid::Uuid::new_v4().to_string()[..8]);
    debug!(turn = %short_id(&turn_id), "turn started");

    // Chunks persist before routing; block ids patch in afterwards.
    let chunks = chunker::chunk_text(&query, &turn_id, None);
    let chunks_created = chunks.len();
    let chunk_records = chunks.clone();
    if let Err(e) = db_call(&state.db, move |d| d.insert_chunks(&chunk_records)).await? {
        warn!(error = %e, "chunk persistence failed");
    }

    let query_embedding = embed_query(state, &query).await;

    let governed = governor::govern(
        &state.db,
        state.ai.as_ref(),
        &state.cfg,
        &query,
        query_embedding.as_deref(),
        &day_id,
    )
    .await
    .map_err(|e| HmlrError::at(Step::Governor, e))?;

    let last_active = db_call(&state.db, |d| d.get_active_block(None))
        .await?
        .map_err(|e| HmlrError::at(Step::Governor, e))?
        .map(|b| b.id);
    let scenario = governor::resolve_scenario(&governed.routing, last_active.as_deref());
    let is_new_topic =
        matches!(scenario, RouteScenario::NewBlock | RouteScenario::TopicShift { .. });

    let block = apply_scenario(
        state,
        &scenario,
        governed.routing.suggested_label.as_deref(),
        &query,
        &day_id,
    )
    .await
    .map_err(|e| HmlrError::at(Step::Governor, e))?;
    let block_id = block.id.clone();
    info!(
        turn = %short_id(&turn_id),
        block = %short_id(&block_id),
        scenario = ?scenario,
        "routed"
    );

    // Patch ownership of the pre-routing artifacts.
    {
        let (tid, bid) = (turn_id.clone(), block_id.clone());
        if let Err(e) = db_call(&state.db, move |d| {
            d.link_chunks_to_block(&tid, &bid)?;
            d.update_facts_block_id(&tid, &bid)
        })
        .await?
        {
            warn!(error = %e, "chunk block patch failed");
        }
    }

    // Fact extraction runs while the rest of the context builds.
    let extraction = {
        let state = state.clone();
        let message = query.clone();
        tokio::spawn(async move { extract_facts(&state, &message).await })
    };

    let block_facts = {
        let bid = block_id.clone();
        db_call(&state.db, move |d| d.facts_by_block(&bid))
            .await?
            .unwrap_or_else(|e| {
                warn!(error = %e, "block fact load failed");
                vec![]
            })
            .into_iter()
            .filter(|f| f.superseded_by.is_none() && !f.is_deleted())
            .collect::<Vec<_>>()
    };
    let profile = db_call(&state.db, |d| d.current_profile()).await?.unwrap_or_else(|e| {
        warn!(error = %e, "profile load failed");
        None
    });
    let block_turns = {
        let bid = block_id.clone();
        db_call(&state.db, move |d| d.turns_by_block(&bid))
            .await?
            .map_err(|e| HmlrError::at(Step::Hydrator, e))?
    };

    // Window compression: decide how many recent turns stay verbatim, and
    // pull referenced turns back in when the query points at history.
    let recent_queries: Vec<String> =
        block_turns.iter().map(|t| t.user_message.clone()).collect();
    let decision = compressor::decide_compression(
        &state.cfg,
        &compressor::CompressionInput {
            query: &query,
            recent_queries: &recent_queries,
            last_turn_ts: block_turns.last().map(|t| t.timestamp),
            query_embedding: query_embedding.as_deref(),
            recent_embeddings: None,
            now_ms: db::now_ms(),
        },
    );
    debug!(level = ?decision.level, keep = decision.keep_verbatim_count, "window compression");

    let mut context_turns: Vec<db::Turn> = if decision.keep_verbatim_count < block_turns.len() {
        block_turns[block_turns.len() - decision.keep_verbatim_count..].to_vec()
    } else {
        block_turns
    };
    if decision.has_explicit_reference {
        let cfg = state.cfg.clone();
        let keywords = chunker::extract_lexical_filters(&query);
        let bid = block_id.clone();
        match db_call(&state.db, move |d| {
            evict::rehydrate(d, &cfg, &keywords, Some(&bid))
        })
        .await?
        {
            Ok(rehydrated) => {
                context_turns.extend(rehydrated.into_iter().map(|r| r.turn));
            }
            Err(e) => warn!(error = %e, "rehydration failed"),
        }
    }

    let mut context_facts = governed.facts.clone();
    for f in block_facts {
        if !context_facts.iter().any(|existing| existing.id == f.id) {
            context_facts.push(f);
        }
    }
    let facts_used = context_facts.len();
    let memories_used = governed.memories.len();

    let prompt = hydrator::hydrate(
        &state.cfg,
        &HydratorInput {
            query: &query,
            system_prompt: CHAT_SYSTEM_PROMPT,
            turns: &context_turns,
            memories: &governed.memories,
            facts: &context_facts,
            profile: profile.as_deref(),
            metadata_mode: if is_new_topic {
                MetadataMode::NewTopic
            } else {
                MetadataMode::Continuation
            },
        },
    );

    let ai_cfg = state
        .ai
        .as_ref()
        .ok_or_else(|| HmlrError::at(Step::LlmGeneration, HmlrError::AiNotConfigured))?;
    let llm = ai::llm_chat(
        ai_cfg,
        ModelTier::Default,
        &prompt.system,
        &prompt.user,
        RESPONSE_MAX_TOKENS,
        RESPONSE_TEMPERATURE,
    )
    .await
    .map_err(|e| HmlrError::at(Step::LlmGeneration, e))?;
    if let Some(ref u) = llm.usage {
        let model = llm.model.clone();
        let (pt, ct) = (u.prompt_tokens, u.completion_tokens);
        let dur = llm.duration_ms;
        let _ = db_call(&state.db, move |d| d.log_llm_call("chat", &model, pt, ct, 0, dur)).await;
    }

    let (response, metadata) = hydrator::extract_response_metadata(&llm.content);
    let (affect, turn_keywords) = match metadata {
        Some(meta) => {
            let affect = meta.affect.clone().unwrap_or_else(|| "neutral".into());
            let keywords = if meta.keywords.is_empty() {
                chunker::extract_lexical_filters(&query)
            } else {
                meta.keywords.clone()
            };
            let bid = block_id.clone();
            let patch = db::BlockMetadataPatch {
                topic_label: meta.topic_label,
                summary: meta.summary,
                keywords: meta.keywords,
                open_loops: meta.open_loops,
                decisions_made: meta.decisions_made,
            };
            if let Err(e) =
                db_call(&state.db, move |d| d.update_block_metadata(&bid, &patch)).await?
            {
                warn!(error = %e, "metadata merge failed");
            }
            (affect, keywords)
        }
        None => ("neutral".to_string(), chunker::extract_lexical_filters(&query)),
    };

    {
        let (tid, bid) = (turn_id.clone(), block_id.clone());
        let (msg, resp) = (query.clone(), response.clone());
        let kw = turn_keywords.clone();
        let aff = affect.clone();
        db_call(&state.db, move |d| d.append_turn(&tid, &bid, &msg, &resp, &kw, &aff))
            .await?
            .map_err(|e| HmlrError::at(Step::TurnAppend, e))?;
    }

    let memory_id = format!("mem_{turn_id}");
    {
        let (mid, tid, bid) = (memory_id.clone(), turn_id.clone(), block_id.clone());
        let content = format!("User: {query}\nAssistant: {response}");
        let emb = query_embedding.clone();
        db_call(&state.db, move |d| {
            d.insert_memory(&mid, &tid, &bid, &content, 0, emb.as_deref())
        })
        .await?
        .map_err(|e| HmlrError::at(Step::MemoryInsert, e))?;
    }

    // Lineage edges for the turn, its memory, and its chunks.
    {
        let (tid, bid, mid) = (turn_id.clone(), block_id.clone(), memory_id.clone());
        let chunk_meta: Vec<(String, Option<String>)> =
            chunks.iter().map(|c| (c.id.clone(), c.parent_chunk_id.clone())).collect();
        if let Err(e) = db_call(&state.db, move |d| -> Result<(), HmlrError> {
            d.record_lineage(&tid, "turn", &[bid.clone()], "chat.sendMessage")?;
            d.record_lineage(&mid, "memory", &[tid.clone()], "chat.sendMessage")?;
            for (chunk_id, parent) in &chunk_meta {
                let mut parents = vec![tid.clone(), bid.clone()];
                if let Some(p) = parent {
                    parents.push(p.clone());
                }
                d.record_lineage(chunk_id, "chunk", &parents, "chunk_engine_v1")?;
            }
            Ok(())
        })
        .await?
        {
            warn!(error = %e, "lineage write failed");
        }
    }

    // Fan the fact extraction back in and persist what it found.
    let facts_extracted = match extraction.await {
        Ok(Ok(facts)) if !facts.is_empty() => {
            let (tid, bid) = (turn_id.clone(), block_id.clone());
            let stored = db_call(&state.db, move |d| -> Result<usize, HmlrError> {
                let inputs: Vec<FactInput> = facts
                    .into_iter()
                    .map(|mut f| {
                        f.turn_id = Some(tid.clone());
                        f
                    })
                    .collect();
                let rows = d.store_facts(inputs, &bid)?;
                for fact in &rows {
                    d.record_lineage(
                        &fact.id,
                        "fact",
                        &[tid.clone(), bid.clone()],
                        "fact_scrubber_v1",
                    )?;
                }
                Ok(rows.len())
            })
            .await?;
            match stored {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "fact persistence failed");
                    0
                }
            }
        }
        Ok(Ok(_)) => 0,
        Ok(Err(e)) => {
            warn!(error = %e, "fact extraction failed");
            0
        }
        Err(e) => {
            warn!(error = %e, "fact extraction task panicked");
            0
        }
    };

    // Schedule the scribe; fire-and-forget.
    {
        let (uid, tid) = (user_id, turn_id.clone());
        if let Err(e) = db_call(&state.db, move |d| d.enqueue_scribe_job(&uid, &tid)).await? {
            warn!(error = %e, "scribe enqueue failed");
        } else if let Some(ref tx) = state.scribe_tx {
            let _ = tx.send(());
        }
    }

    Ok(ChatOutcome {
        response,
        topic_label: block.topic_label,
        block_id,
        turn_id,
        is_new_topic,
        scenario,
        memories_used,
        facts_used,
        chunks_created,
        facts_extracted,
    })
}

/// Ranked memory search for the public surface: gardened vector search
/// when an embedding is available, lexical otherwise.
pub async fn search(
    state: &AppState,
    query: &str,
    limit: usize,
) -> Result<serde_json::Value, HmlrError> {
    if query.trim().is_empty() {
        return Err(HmlrError::EmptyQuery);
    }
    let day_id = db::today_day_id();

    if let Some(embedding) = embed_query(state, query).await {
        let cfg = state.cfg.clone();
        let results = db_call(&state.db, move |d| {
            crate::retrieval::search_gardened(d, &cfg, &embedding, &day_id)
        })
        .await??;
        let clipped: Vec<_> = results.into_iter().take(limit).collect();
        return Ok(serde_json::json!({ "mode": "gardened", "results": clipped }));
    }

    let terms = crate::retrieval::extract_terms(query);
    let results =
        db_call(&state.db, move |d| crate::retrieval::search_memories(d, &terms, limit))
            .await??;
    Ok(serde_json::json!({ "mode": "lexical", "results": results }))
}
