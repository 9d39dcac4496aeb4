//! Topic-shift detection: decides whether a query warrants a new bridge
//! block. Pattern tables first, keyword-overlap heuristic as the fallback.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::chunker::extract_lexical_filters;
use crate::thresholds::SHIFT_CONFIDENCE_THRESHOLD;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ShiftDecision {
    pub is_shift: bool,
    pub reason: String,
    pub new_topic_label: Option<String>,
    pub confidence: f64,
}

/// Routing metadata the nano tier may attach to a query. When present and
/// confident it overrides the heuristic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NanoShiftHint {
    #[serde(default)]
    pub is_topic_shift: Option<bool>,
    #[serde(default)]
    pub new_topic_label: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

fn explicit_shift_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)let'?s talk about (.+?)(?: instead)?[.!?]?$",
            r"(?i)changing topics? to (.+?)[.!?]?$",
            r"(?i)moving on to (.+?)[.!?]?$",
            r"(?i)new topic:\s*(.+?)[.!?]?$",
            r"(?i)can we discuss (.+?)[.!?]?$",
            r"(?i)switching to (.+?)[.!?]?$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("shift pattern"))
        .collect()
    })
}

fn continuation_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^(so|and|but|also|additionally|furthermore)\b",
            r"(?i)^as we discussed",
            r"(?i)^going back to",
            r"(?i)^regarding that",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("continuation pattern"))
        .collect()
    })
}

/// Content words of the query, in order. The first one doubles as the
/// suggested topic label when a shift fires without an explicit target.
fn extract_topics(query: &str) -> Vec<String> {
    extract_lexical_filters(query)
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let sa: HashSet<String> = a.iter().map(|s| s.to_lowercase()).collect();
    let sb: HashSet<String> = b.iter().map(|s| s.to_lowercase()).collect();
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / union as f64
}

/// Decide whether `query` shifts away from the active block's topic.
pub fn check_for_shift(query: &str, active_block_keywords: &[String]) -> ShiftDecision {
    let trimmed = query.trim();

    if active_block_keywords.is_empty() {
        let label = extract_topics(trimmed)
            .into_iter()
            .next()
            .unwrap_or_else(|| "General Conversation".into());
        return ShiftDecision {
            is_shift: true,
            reason: "No active topic to continue".into(),
            new_topic_label: Some(label),
            confidence: 1.0,
        };
    }

    for pattern in explicit_shift_patterns() {
        if let Some(caps) = pattern.captures(trimmed) {
            let label = caps
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "New Topic".into());
            return ShiftDecision {
                is_shift: true,
                reason: "Explicit topic change requested".into(),
                new_topic_label: Some(label),
                confidence: 1.0,
            };
        }
    }

    for pattern in continuation_patterns() {
        if pattern.is_match(trimmed) {
            return ShiftDecision {
                is_shift: false,
                reason: "Continuation phrasing at start of query".into(),
                new_topic_label: None,
                confidence: 0.1,
            };
        }
    }

    let topics = extract_topics(trimmed);
    let similarity = jaccard(&topics, active_block_keywords);
    let shift_confidence = 1.0 - similarity;
    if shift_confidence > SHIFT_CONFIDENCE_THRESHOLD {
        ShiftDecision {
            is_shift: true,
            reason: format!("Low keyword overlap with active topic (similarity {similarity:.2})"),
            new_topic_label: topics.into_iter().next(),
            confidence: shift_confidence,
        }
    } else {
        ShiftDecision {
            is_shift: false,
            reason: format!("Keyword overlap with active topic (similarity {similarity:.2})"),
            new_topic_label: None,
            confidence: 1.0 - shift_confidence,
        }
    }
}

/// Variant that trusts nano-tier metadata when it carries a verdict, and
/// falls back to the heuristic otherwise.
pub fn check_for_shift_with_metadata(
    query: &str,
    active_block_keywords: &[String],
    hint: Option<&NanoShiftHint>,
) -> ShiftDecision {
    if let Some(hint) = hint {
        if let Some(is_shift) = hint.is_topic_shift {
            return ShiftDecision {
                is_shift,
                reason: "Routing metadata verdict".into(),
                new_topic_label: hint.new_topic_label.clone(),
                confidence: hint.confidence.unwrap_or(0.9),
            };
        }
    }
    check_for_shift(query, active_block_keywords)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn continuation_of_active_topic() {
        let d = check_for_shift(
            "So tell me more about the contract details",
            &kw(&["contract", "law", "agreement"]),
        );
        assert!(!d.is_shift);
        assert!(d.reason.contains("Continuation"), "reason: {}", d.reason);
        assert!(d.confidence <= 0.2);
    }

    #[test]
    fn explicit_shift_extracts_label() {
        let d = check_for_shift(
            "Actually, let's talk about cooking pasta",
            &kw(&["HMLR", "architecture", "Governor"]),
        );
        assert!(d.is_shift);
        assert!(d.confidence > 0.5);
        let label = d.new_topic_label.expect("label");
        assert!(!label.is_empty());
        assert!(label.to_lowercase().contains("cooking"));
    }

    #[test]
    fn no_active_keywords_always_shifts() {
        let d = check_for_shift("What is a bridge loan?", &[]);
        assert!(d.is_shift);
        assert!((d.confidence - 1.0).abs() < f64::EPSILON);
        assert!(d.new_topic_label.is_some());
    }

    #[test]
    fn empty_query_without_topics_falls_back_to_general() {
        let d = check_for_shift("??", &[]);
        assert!(d.is_shift);
        assert_eq!(d.new_topic_label.as_deref(), Some("General Conversation"));
    }

    #[test]
    fn overlapping_keywords_do_not_shift() {
        let d = check_for_shift(
            "contract agreement clauses review",
            &kw(&["contract", "agreement", "clauses", "review"]),
        );
        assert!(!d.is_shift);
        assert!(d.confidence > 0.5);
    }

    #[test]
    fn disjoint_keywords_shift() {
        let d = check_for_shift(
            "quantum computing qubits entanglement",
            &kw(&["contract", "law", "agreement"]),
        );
        assert!(d.is_shift);
        assert!(d.confidence > SHIFT_CONFIDENCE_THRESHOLD);
        assert_eq!(d.new_topic_label.as_deref(), Some("quantum"));
    }

    #[test]
    fn explicit_patterns_match_variants() {
        let active = kw(&["alpha", "beta"]);
        for q in [
            "changing topics to gardening",
            "moving on to travel plans",
            "new topic: budget review",
            "can we discuss the roadmap",
            "switching to deployment",
        ] {
            let d = check_for_shift(q, &active);
            assert!(d.is_shift, "expected shift for {q:?}");
            assert!((d.confidence - 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn metadata_verdict_wins_over_heuristic() {
        let hint = NanoShiftHint {
            is_topic_shift: Some(true),
            new_topic_label: Some("Gardening".into()),
            confidence: Some(0.95),
        };
        let d = check_for_shift_with_metadata(
            "so about those tomatoes",
            &kw(&["contract", "law"]),
            Some(&hint),
        );
        assert!(d.is_shift);
        assert_eq!(d.new_topic_label.as_deref(), Some("Gardening"));
    }

    #[test]
    fn metadata_without_verdict_falls_back() {
        let hint = NanoShiftHint::default();
        let d = check_for_shift_with_metadata(
            "so about those clauses",
            &kw(&["contract", "law"]),
            Some(&hint),
        );
        assert!(!d.is_shift);
    }
}
