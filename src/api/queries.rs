use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::LenientJson;
use crate::db::{self, BlockStatus, FactCategory};
use crate::db_call;
use crate::error::HmlrError;
use crate::{evict, AppState};

pub(super) async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "ai": state.ai.is_some(),
    }))
}

pub(super) async fn stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let stats = db_call(&state.db, |d| d.store_stats()).await??;
    let db_bytes = db_call(&state.db, |d| d.db_size_bytes()).await?;
    let vec_len = db_call(&state.db, |d| d.vec_index_len()).await?;
    let (cache_len, cache_cap, hits, misses) = state.embed_cache.stats();
    Ok(Json(json!({
        "store": stats,
        "db_size_bytes": db_bytes,
        "vector_index": vec_len,
        "embed_cache": {"len": cache_len, "cap": cache_cap, "hits": hits, "misses": misses},
    })))
}

#[derive(Deserialize)]
pub(super) struct DayQuery {
    #[serde(default)]
    day: Option<String>,
}

pub(super) async fn list_blocks(
    State(state): State<AppState>,
    Query(q): Query<DayQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let day = q.day.unwrap_or_else(db::today_day_id);
    let day2 = day.clone();
    let blocks = db_call(&state.db, move |d| d.block_metadata_by_day(&day2)).await??;
    Ok(Json(json!({ "day": day, "blocks": blocks })))
}

pub(super) async fn get_block(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let bid = id.clone();
    let block = db_call(&state.db, move |d| d.get_block(&bid))
        .await??
        .ok_or(HmlrError::NotFound)?;
    let turns = db_call(&state.db, move |d| d.turns_by_block(&id)).await??;
    Ok(Json(json!({ "block": block, "turns": turns })))
}

#[derive(Deserialize)]
pub(super) struct StatusBody {
    status: String,
}

pub(super) async fn set_block_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    LenientJson(body): LenientJson<StatusBody>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let status = BlockStatus::parse(&body.status)?;
    let bid = id.clone();
    db_call(&state.db, move |d| d.update_block_status(&bid, status)).await??;
    // A block leaving ACTIVE gets its metadata written properly.
    if matches!(status, BlockStatus::Paused | BlockStatus::Closed) {
        crate::chat::spawn_block_synthesis(&state, &id);
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub(super) struct FactQuery {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    block: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub(super) async fn list_facts(
    State(state): State<AppState>,
    Query(q): Query<FactQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let limit = q.limit.unwrap_or(50).min(500);
    let facts = if let Some(key) = q.key {
        db_call(&state.db, move |d| d.get_fact(&key))
            .await??
            .into_iter()
            .collect()
    } else if let Some(prefix) = q.prefix {
        db_call(&state.db, move |d| d.search_facts_by_key_prefix(&prefix)).await??
    } else if let Some(cat) = q.category {
        let cat = FactCategory::parse(&cat)
            .ok_or_else(|| HmlrError::Validation(format!("unknown category: {cat}")))?;
        db_call(&state.db, move |d| d.facts_by_category(cat)).await??
    } else if let Some(block) = q.block {
        db_call(&state.db, move |d| d.facts_by_block(&block)).await??
    } else {
        db_call(&state.db, move |d| d.list_facts(limit, 0)).await??
    };
    let clipped: Vec<_> = facts.into_iter().take(limit).collect();
    Ok(Json(json!({ "facts": clipped })))
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    key: String,
}

pub(super) async fn fact_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let history = db_call(&state.db, move |d| d.fact_history(&q.key)).await??;
    Ok(Json(json!({ "history": history })))
}

pub(super) async fn remove_fact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let removed = db_call(&state.db, move |d| d.remove_fact(&id))
        .await??
        .ok_or(HmlrError::NotFound)?;
    Ok(Json(json!({ "superseded_by": removed.id })))
}

#[derive(Deserialize)]
pub(super) struct LineageQuery {
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    depth: Option<usize>,
}

pub(super) async fn get_lineage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LineageQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let depth = q.depth.unwrap_or(10);
    let iid = id.clone();
    let edge = db_call(&state.db, move |d| d.get_lineage(&iid)).await??;
    let related = match q.direction.as_deref() {
        Some("descendants") => {
            db_call(&state.db, move |d| d.lineage_descendants(&id, depth)).await??
        }
        _ => db_call(&state.db, move |d| d.lineage_ancestors(&id, depth)).await??,
    };
    Ok(Json(json!({ "edge": edge, "related": related })))
}

pub(super) async fn lineage_integrity(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let report = db_call(&state.db, |d| d.lineage_integrity()).await??;
    Ok(Json(serde_json::to_value(report).map_err(|e| HmlrError::Internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub(super) struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

pub(super) async fn usage_stats(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let limit = q.limit.unwrap_or(50).min(500);
    let top = db_call(&state.db, move |d| d.top_usage(limit)).await??;
    Ok(Json(json!({ "usage": top })))
}

#[derive(Deserialize)]
pub(super) struct TopicQuery {
    topic: String,
}

pub(super) async fn topic_affinity(
    State(state): State<AppState>,
    Query(q): Query<TopicQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let affinity = db_call(&state.db, move |d| d.get_topic_affinity(&q.topic)).await??;
    Ok(Json(json!({ "affinity": affinity })))
}

#[derive(Deserialize)]
pub(super) struct SynthQuery {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

pub(super) async fn list_syntheses(
    State(state): State<AppState>,
    Query(q): Query<SynthQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let kind = match q.kind.as_deref() {
        Some("day") | None => db::SynthesisKind::Day,
        Some("week") => db::SynthesisKind::Week,
        Some("profile") => db::SynthesisKind::Profile,
        Some(other) => {
            return Err(HmlrError::Validation(format!("unknown synthesis kind: {other}")))
        }
    };
    let result = match q.key {
        Some(key) => db_call(&state.db, move |d| d.get_synthesis(kind, &key))
            .await??
            .into_iter()
            .collect(),
        None => db_call(&state.db, move |d| d.recent_syntheses(kind, 14)).await??,
    };
    Ok(Json(json!({ "syntheses": result })))
}

#[derive(Deserialize)]
pub(super) struct DaysQuery {
    #[serde(default)]
    days: Option<u32>,
}

pub(super) async fn llm_usage(
    State(state): State<AppState>,
    Query(q): Query<DaysQuery>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let days = q.days.unwrap_or(7).min(90);
    let usage = db_call(&state.db, move |d| d.llm_usage_daily(days)).await??;
    Ok(Json(json!({ "daily": usage })))
}

#[derive(Deserialize)]
pub(super) struct EvictBody {
    #[serde(default)]
    day: Option<String>,
}

pub(super) async fn run_eviction(
    State(state): State<AppState>,
    LenientJson(body): LenientJson<EvictBody>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let day = body.day.unwrap_or_else(db::today_day_id);
    let cfg = state.cfg.clone();
    let report =
        db_call(&state.db, move |d| evict::check_and_evict(d, &cfg, &day)).await??;
    Ok(Json(serde_json::to_value(report).map_err(|e| HmlrError::Internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub(super) struct RehydrateBody {
    keywords: Vec<String>,
    #[serde(default)]
    current_block: Option<String>,
}

pub(super) async fn run_rehydration(
    State(state): State<AppState>,
    LenientJson(body): LenientJson<RehydrateBody>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let cfg = state.cfg.clone();
    let turns = db_call(&state.db, move |d| {
        evict::rehydrate(d, &cfg, &body.keywords, body.current_block.as_deref())
    })
    .await??;
    Ok(Json(json!({ "turns": turns })))
}
