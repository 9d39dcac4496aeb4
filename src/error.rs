use axum::http::StatusCode;
use axum::Json;

/// Pipeline step names carried by fatal orchestrator errors so the caller
/// can see exactly where a turn died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Governor,
    Hydrator,
    LlmGeneration,
    MemoryInsert,
    TurnAppend,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Governor => "governor",
            Step::Hydrator => "hydrator",
            Step::LlmGeneration => "llm_generation",
            Step::MemoryInsert => "memory_insert",
            Step::TurnAppend => "turn_append",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HmlrError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("AI not configured (set HMLR_LLM_URL)")]
    AiNotConfigured,

    /// Transient upstream failure — retryable (embedder 5xx, LLM timeout).
    #[error("AI backend error: {0}")]
    AiBackend(String),

    /// Permanent upstream failure — auth/quota; fails the turn.
    #[error("AI backend rejected the request: {0}")]
    AiRejected(String),

    /// Malformed JSON in an LLM response. Callers apply the documented
    /// per-subtask fallback instead of failing the turn.
    #[error("LLM response parse failed: {0}")]
    Parse(String),

    /// Internal invariant broken (two ACTIVE blocks, broken supersession
    /// chain). Always fatal.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("storage conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A fatal pipeline step failed; the turn aborts with the step name.
    #[error("turn failed at step {step}: {source}")]
    Turn {
        step: Step,
        #[source]
        source: Box<HmlrError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl HmlrError {
    pub fn at(step: Step, source: HmlrError) -> Self {
        Self::Turn { step, source: Box::new(source) }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AiBackend(_) | Self::Conflict(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Internal(_) | Self::Invariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AiNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::AiBackend(_) | Self::AiRejected(_) | Self::Parse(_) => StatusCode::BAD_GATEWAY,
            Self::Turn { source, .. } => source.status_code(),
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl axum::response::IntoResponse for HmlrError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = match &self {
            HmlrError::Turn { step, source } => Json(serde_json::json!({
                "error": source.to_string(),
                "step": step,
            })),
            other => Json(serde_json::json!({ "error": other.to_string() })),
        };
        (status, body).into_response()
    }
}
