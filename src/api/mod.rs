use axum::extract::State;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::HmlrError;
use crate::AppState;

mod chat_handlers;
mod lenient;
mod queries;

use chat_handlers::*;
pub use lenient::LenientJson;
use queries::*;

/// Auth middleware: checks Bearer token if HMLR_API_KEY is configured.
async fn require_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, HmlrError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let unauthorized = || HmlrError::Unauthorized;

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

    // constant-time comparison to prevent timing attacks
    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(req).await)
    } else {
        Err(unauthorized())
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/stats", get(stats));

    let protected = Router::new()
        .route("/chat", post(do_chat))
        .route("/search", post(do_search))
        .route("/blocks", get(list_blocks))
        .route("/blocks/{id}", get(get_block))
        .route("/blocks/{id}/status", post(set_block_status))
        .route("/facts", get(list_facts))
        .route("/facts/history", get(fact_history))
        .route("/facts/{id}", delete(remove_fact))
        .route("/lineage/{id}", get(get_lineage))
        .route("/lineage-integrity", get(lineage_integrity))
        .route("/usage", get(usage_stats))
        .route("/affinity", get(topic_affinity))
        .route("/syntheses", get(list_syntheses))
        .route("/llm-usage", get(llm_usage))
        .route("/evict", post(run_eviction))
        .route("/rehydrate", post(run_rehydration))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(256 * 1024))
        .with_state(state)
}
