use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::LenientJson;
use crate::chat::{self, ChatOutcome, ChatRequest};
use crate::error::HmlrError;
use crate::AppState;

pub(super) async fn do_chat(
    State(state): State<AppState>,
    LenientJson(req): LenientJson<ChatRequest>,
) -> Result<Json<ChatOutcome>, HmlrError> {
    let outcome = chat::send_message(&state, req).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub(super) struct SearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub(super) async fn do_search(
    State(state): State<AppState>,
    LenientJson(req): LenientJson<SearchRequest>,
) -> Result<Json<serde_json::Value>, HmlrError> {
    let limit = req.limit.unwrap_or(state.cfg.top_k).min(100);
    let results = chat::search(&state, &req.query, limit).await?;
    Ok(Json(results))
}
