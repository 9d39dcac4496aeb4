/// Policy constants shared across the window, compressor, and retrieval.
///
/// Thresholds that are operator-tunable live in `HmlrConfig`; the ones here
/// are structural and changing them changes the meaning of the algorithms.

/// Semantic distance above which the query is "very different" from the
/// recent window.
pub const VERY_DIFFERENT_DISTANCE: f64 = 0.8;

/// Semantic distance above which the query is "somewhat different".
pub const SOMEWHAT_DIFFERENT_DISTANCE: f64 = 0.6;

/// Hours of silence after which the gap counts as "long".
pub const LONG_GAP_HOURS: f64 = 12.0;

/// Hard cap on turns kept verbatim regardless of compression level.
pub const VERBATIM_HARD_CAP: usize = 15;

/// Verbatim turns kept under COMPRESS_ALL.
pub const COMPRESS_ALL_KEEP: usize = 5;

/// Verbatim turns kept under COMPRESS_PARTIAL.
pub const COMPRESS_PARTIAL_KEEP: usize = 10;

/// Turns older than this are evicted from the sliding window.
pub const TIME_EVICTION_HOURS: f64 = 24.0;

/// Space bound: max turns the day window holds before FIFO eviction.
pub const MAX_WINDOW_TURNS: usize = 30;

/// Space bound: max estimated tokens across the day window.
pub const MAX_WINDOW_TOKENS: usize = 5000;

/// Cap on turns promoted back into context by rehydration.
pub const MAX_REHYDRATION_TURNS: usize = 10;

/// Blocks consulted by affinity prefetch.
pub const PREFETCH_WINDOW: usize = 3;

/// Turn ids returned by affinity prefetch.
pub const PREFETCH_MAX_TURNS: usize = 5;

/// Shift confidence above which the heuristic declares a new topic.
pub const SHIFT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Candidate memories fetched for the governor's 2-key filter.
pub const GOVERNOR_CANDIDATE_LIMIT: usize = 20;

/// Memories returned when the 2-key filter response fails to parse.
pub const GOVERNOR_FALLBACK_TOP: usize = 5;

/// Candidate fact keys extracted per query.
pub const MAX_FACT_KEY_CANDIDATES: usize = 10;

/// Lexical filter tokens kept per chunk.
pub const MAX_LEXICAL_FILTERS: usize = 20;

/// Keyword cardinality bound on a bridge block.
pub const MAX_BLOCK_KEYWORDS: usize = 20;

/// Open-loop / decision list bounds on a bridge block.
pub const MAX_BLOCK_LIST_ITEMS: usize = 10;

/// Sentinel value marking a soft-deleted fact's successor row.
pub const DELETED_FACT_VALUE: &str = "[DELETED]";
