//! Graduated compression decisions for the sliding window. Pure function
//! of the query, the recent window, and the clock — no storage access.

use std::collections::HashSet;

use serde::Serialize;

use crate::ai::cosine_similarity;
use crate::config::HmlrConfig;

/// Substrings that signal the user is pointing back at earlier turns.
/// Any hit forces the window to stay verbatim.
const EXPLICIT_REFERENCE_PATTERNS: &[&str] = &[
    "we discussed",
    "you mentioned",
    "you said",
    "as i said",
    "earlier you",
    "previously",
    "going back to",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionLevel {
    NoCompression,
    CompressPartial,
    CompressAll,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionDecision {
    pub level: CompressionLevel,
    pub keep_verbatim_count: usize,
    pub reason: String,
    pub has_explicit_reference: bool,
    pub semantic_distance: f64,
    pub time_gap_hours: f64,
}

/// Everything the decision depends on. `now_ms` is explicit so identical
/// inputs always produce identical decisions.
pub struct CompressionInput<'a> {
    pub query: &'a str,
    pub recent_queries: &'a [String],
    pub last_turn_ts: Option<i64>,
    pub query_embedding: Option<&'a [f32]>,
    pub recent_embeddings: Option<&'a [Vec<f32>]>,
    pub now_ms: i64,
}

fn content_words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect()
}

/// Word-overlap distance used when embeddings are unavailable: the query
/// against the concatenation of the last three recent queries.
fn word_distance(query: &str, recent: &[String]) -> f64 {
    let tail_start = recent.len().saturating_sub(3);
    let recent_text = recent[tail_start..].join(" ");
    let a = content_words(query);
    let b = content_words(&recent_text);
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    1.0 - a.intersection(&b).count() as f64 / union as f64
}

/// Cosine distance between the query embedding and the mean of the recent
/// window's embeddings.
fn embedding_distance(query_emb: &[f32], recent_embs: &[Vec<f32>]) -> Option<f64> {
    let usable: Vec<&Vec<f32>> =
        recent_embs.iter().filter(|e| e.len() == query_emb.len()).collect();
    if usable.is_empty() {
        return None;
    }
    let dims = query_emb.len();
    let mut mean = vec![0.0f32; dims];
    for emb in &usable {
        for (m, v) in mean.iter_mut().zip(emb.iter()) {
            *m += v;
        }
    }
    let n = usable.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    Some(1.0 - cosine_similarity(query_emb, &mean))
}

fn has_explicit_reference(query: &str) -> bool {
    let lower = query.to_lowercase();
    EXPLICIT_REFERENCE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Decide how aggressively the recent window compresses for this query.
pub fn decide_compression(cfg: &HmlrConfig, input: &CompressionInput) -> CompressionDecision {
    let keep_all = input.recent_queries.len().min(cfg.verbatim_hard_cap);

    if input.recent_queries.is_empty() || input.last_turn_ts.is_none() {
        return CompressionDecision {
            level: CompressionLevel::NoCompression,
            keep_verbatim_count: 0,
            reason: "window is empty".into(),
            has_explicit_reference: false,
            semantic_distance: 0.0,
            time_gap_hours: 0.0,
        };
    }

    if has_explicit_reference(input.query) {
        return CompressionDecision {
            level: CompressionLevel::NoCompression,
            keep_verbatim_count: keep_all,
            reason: "query references earlier turns explicitly".into(),
            has_explicit_reference: true,
            semantic_distance: 0.0,
            time_gap_hours: 0.0,
        };
    }

    let semantic_distance = input
        .query_embedding
        .zip(input.recent_embeddings)
        .and_then(|(q, r)| embedding_distance(q, r))
        .unwrap_or_else(|| word_distance(input.query, input.recent_queries));

    let last_ts = input.last_turn_ts.expect("checked above");
    let time_gap_hours = ((input.now_ms - last_ts).max(0)) as f64 / 3_600_000.0;
    let long_gap = time_gap_hours > cfg.long_gap_hours;

    let (level, keep, reason) = if semantic_distance > cfg.very_different_threshold {
        if long_gap {
            (
                CompressionLevel::CompressAll,
                cfg.compress_all_keep,
                format!("very different topic after {time_gap_hours:.1}h gap"),
            )
        } else {
            (
                CompressionLevel::CompressPartial,
                cfg.compress_partial_keep,
                "very different topic within the session".to_string(),
            )
        }
    } else if semantic_distance > cfg.somewhat_different_threshold {
        if long_gap {
            (
                CompressionLevel::CompressPartial,
                cfg.compress_partial_keep,
                format!("related topic after {time_gap_hours:.1}h gap"),
            )
        } else {
            (
                CompressionLevel::NoCompression,
                keep_all,
                "related topic within the session".to_string(),
            )
        }
    } else {
        (
            CompressionLevel::NoCompression,
            keep_all,
            "query continues the recent topic".to_string(),
        )
    };

    CompressionDecision {
        level,
        keep_verbatim_count: keep.min(cfg.verbatim_hard_cap),
        reason,
        has_explicit_reference: false,
        semantic_distance,
        time_gap_hours,
    }
}
