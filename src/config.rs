//! Immutable runtime configuration. Built once at startup, injected by value.

use crate::thresholds;

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct HmlrConfig {
    /// Embedding vector dimension. Schema-time constant for the vector index.
    pub embedding_dimensions: usize,
    /// Total prompt budget for the hydrator.
    pub max_context_tokens: usize,
    /// Fixed system-prompt share of the budget.
    pub system_tokens: usize,
    /// Fixed task-instruction share of the budget.
    pub task_tokens: usize,
    /// Hard cap on verbatim turns regardless of compression level.
    pub verbatim_hard_cap: usize,
    pub compress_all_keep: usize,
    pub compress_partial_keep: usize,
    pub very_different_threshold: f64,
    pub somewhat_different_threshold: f64,
    pub long_gap_hours: f64,
    pub time_eviction_hours: f64,
    pub max_window_turns: usize,
    pub max_window_tokens: usize,
    pub max_rehydration_turns: usize,
    pub prefetch_window: usize,
    pub vector_weight: f64,
    pub lexical_weight: f64,
    pub hybrid_min_score: f64,
    pub top_k: usize,
    pub gardened_min_similarity: f64,
    /// Exclude today's memories from gardened search (they live in the
    /// sliding window). Flip off when the window is disabled.
    pub garden_exclude_today: bool,
    /// Max tokens the profile section may consume.
    pub profile_max_tokens: usize,
}

impl Default for HmlrConfig {
    fn default() -> Self {
        Self {
            embedding_dimensions: 1024,
            max_context_tokens: 8000,
            system_tokens: 500,
            task_tokens: 500,
            verbatim_hard_cap: thresholds::VERBATIM_HARD_CAP,
            compress_all_keep: thresholds::COMPRESS_ALL_KEEP,
            compress_partial_keep: thresholds::COMPRESS_PARTIAL_KEEP,
            very_different_threshold: thresholds::VERY_DIFFERENT_DISTANCE,
            somewhat_different_threshold: thresholds::SOMEWHAT_DIFFERENT_DISTANCE,
            long_gap_hours: thresholds::LONG_GAP_HOURS,
            time_eviction_hours: thresholds::TIME_EVICTION_HOURS,
            max_window_turns: thresholds::MAX_WINDOW_TURNS,
            max_window_tokens: thresholds::MAX_WINDOW_TOKENS,
            max_rehydration_turns: thresholds::MAX_REHYDRATION_TURNS,
            prefetch_window: thresholds::PREFETCH_WINDOW,
            vector_weight: 0.7,
            lexical_weight: 0.3,
            hybrid_min_score: 0.3,
            top_k: 10,
            gardened_min_similarity: 0.4,
            garden_exclude_today: true,
            profile_max_tokens: 300,
        }
    }
}

impl HmlrConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            embedding_dimensions: env_usize("HMLR_EMBED_DIMS", d.embedding_dimensions),
            max_context_tokens: env_usize("HMLR_MAX_CONTEXT_TOKENS", d.max_context_tokens),
            system_tokens: env_usize("HMLR_SYSTEM_TOKENS", d.system_tokens),
            task_tokens: env_usize("HMLR_TASK_TOKENS", d.task_tokens),
            verbatim_hard_cap: env_usize("HMLR_VERBATIM_CAP", d.verbatim_hard_cap),
            compress_all_keep: env_usize("HMLR_COMPRESS_ALL_KEEP", d.compress_all_keep),
            compress_partial_keep: env_usize("HMLR_COMPRESS_PARTIAL_KEEP", d.compress_partial_keep),
            very_different_threshold: env_f64("HMLR_VERY_DIFFERENT", d.very_different_threshold),
            somewhat_different_threshold: env_f64(
                "HMLR_SOMEWHAT_DIFFERENT",
                d.somewhat_different_threshold,
            ),
            long_gap_hours: env_f64("HMLR_LONG_GAP_HOURS", d.long_gap_hours),
            time_eviction_hours: env_f64("HMLR_TIME_EVICTION_HOURS", d.time_eviction_hours),
            max_window_turns: env_usize("HMLR_MAX_WINDOW_TURNS", d.max_window_turns),
            max_window_tokens: env_usize("HMLR_MAX_WINDOW_TOKENS", d.max_window_tokens),
            max_rehydration_turns: env_usize("HMLR_MAX_REHYDRATION", d.max_rehydration_turns),
            prefetch_window: env_usize("HMLR_PREFETCH_WINDOW", d.prefetch_window),
            vector_weight: env_f64("HMLR_VECTOR_WEIGHT", d.vector_weight),
            lexical_weight: env_f64("HMLR_LEXICAL_WEIGHT", d.lexical_weight),
            hybrid_min_score: env_f64("HMLR_HYBRID_MIN_SCORE", d.hybrid_min_score),
            top_k: env_usize("HMLR_TOP_K", d.top_k),
            gardened_min_similarity: env_f64("HMLR_GARDEN_MIN_SIM", d.gardened_min_similarity),
            garden_exclude_today: env_bool("HMLR_GARDEN_EXCLUDE_TODAY", d.garden_exclude_today),
            profile_max_tokens: env_usize("HMLR_PROFILE_TOKENS", d.profile_max_tokens),
        }
    }
}
