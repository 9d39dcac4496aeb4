use hmlr::compressor::{decide_compression, CompressionInput, CompressionLevel};
use hmlr::config::HmlrConfig;

const HOUR_MS: i64 = 3_600_000;
const NOW: i64 = 1_750_000_000_000;

fn queries(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn input<'a>(
    query: &'a str,
    recent: &'a [String],
    last_turn_ts: Option<i64>,
) -> CompressionInput<'a> {
    CompressionInput {
        query,
        recent_queries: recent,
        last_turn_ts,
        query_embedding: None,
        recent_embeddings: None,
        now_ms: NOW,
    }
}

#[test]
fn empty_window_means_no_compression() {
    let cfg = HmlrConfig::default();
    let recent: Vec<String> = vec![];
    let d = decide_compression(&cfg, &input("anything", &recent, None));
    assert_eq!(d.level, CompressionLevel::NoCompression);
    assert_eq!(d.keep_verbatim_count, 0);
}

#[test]
fn explicit_reference_keeps_everything() {
    let cfg = HmlrConfig::default();
    let recent = queries(&["Contract terms outlined"]);
    let d = decide_compression(
        &cfg,
        &input(
            "As we discussed, what were the contract terms?",
            &recent,
            Some(NOW - 5 * 60 * 1000),
        ),
    );
    assert_eq!(d.level, CompressionLevel::NoCompression);
    assert!(d.has_explicit_reference);
    assert_eq!(d.keep_verbatim_count, 1);
}

#[test]
fn explicit_reference_patterns_all_fire() {
    let cfg = HmlrConfig::default();
    let recent = queries(&["earlier topic"]);
    for q in [
        "you mentioned a deadline",
        "you said it was fine",
        "as I said before",
        "earlier you recommended something",
        "previously we set a limit",
        "going back to the budget",
    ] {
        let d = decide_compression(&cfg, &input(q, &recent, Some(NOW - HOUR_MS)));
        assert!(d.has_explicit_reference, "expected explicit reference for {q:?}");
        assert_eq!(d.level, CompressionLevel::NoCompression);
    }
}

#[test]
fn very_different_long_gap_compresses_all() {
    let cfg = HmlrConfig::default();
    let recent = queries(&["database schema migrations", "sqlite index tuning"]);
    let d = decide_compression(
        &cfg,
        &input("favorite pasta recipes tonight", &recent, Some(NOW - 24 * HOUR_MS)),
    );
    assert!(d.semantic_distance > cfg.very_different_threshold);
    assert!(d.time_gap_hours > cfg.long_gap_hours);
    assert_eq!(d.level, CompressionLevel::CompressAll);
    assert_eq!(d.keep_verbatim_count, 5);
}

#[test]
fn very_different_short_gap_compresses_partial() {
    let cfg = HmlrConfig::default();
    let recent = queries(&["database schema migrations", "sqlite index tuning"]);
    let d = decide_compression(
        &cfg,
        &input("favorite pasta recipes tonight", &recent, Some(NOW - HOUR_MS)),
    );
    assert_eq!(d.level, CompressionLevel::CompressPartial);
    assert_eq!(d.keep_verbatim_count, 10);
}

#[test]
fn somewhat_different_long_gap_compresses_partial() {
    let cfg = HmlrConfig::default();
    // 2 of 6 content words shared: distance ~0.67, in the middle band.
    let recent = queries(&["database schema migrations"]);
    let long_gap = decide_compression(
        &cfg,
        &input("database schema budget planning review", &recent, Some(NOW - 20 * HOUR_MS)),
    );
    assert!(long_gap.semantic_distance > cfg.somewhat_different_threshold);
    assert!(long_gap.semantic_distance <= cfg.very_different_threshold);
    assert_eq!(long_gap.level, CompressionLevel::CompressPartial);
    assert_eq!(long_gap.keep_verbatim_count, 10);

    let short_gap = decide_compression(
        &cfg,
        &input("database schema budget planning review", &recent, Some(NOW - HOUR_MS)),
    );
    assert_eq!(short_gap.level, CompressionLevel::NoCompression);
    assert_eq!(short_gap.keep_verbatim_count, 1);
}

#[test]
fn similar_topic_never_compresses() {
    let cfg = HmlrConfig::default();
    let recent = queries(&["database schema migrations plan"]);
    let d = decide_compression(
        &cfg,
        &input("database schema migrations timeline", &recent, Some(NOW - HOUR_MS)),
    );
    assert!(d.semantic_distance <= cfg.somewhat_different_threshold);
    assert_eq!(d.level, CompressionLevel::NoCompression);
    assert_eq!(d.keep_verbatim_count, 1);
}

#[test]
fn keep_verbatim_clamped_to_hard_cap() {
    let cfg = HmlrConfig::default();
    let recent: Vec<String> = (0..40).map(|i| format!("same topic question {i}")).collect();
    let d = decide_compression(
        &cfg,
        &input("same topic question again", &recent, Some(NOW - HOUR_MS)),
    );
    assert_eq!(d.level, CompressionLevel::NoCompression);
    assert_eq!(d.keep_verbatim_count, cfg.verbatim_hard_cap);
}

#[test]
fn embedding_distance_preferred_over_word_overlap() {
    let cfg = HmlrConfig::default();
    // Word overlap would say identical; orthogonal embeddings say very
    // different. The embedding path must win.
    let recent = queries(&["exact same words"]);
    let query_emb = vec![1.0f32, 0.0, 0.0, 0.0];
    let recent_embs = vec![vec![0.0f32, 1.0, 0.0, 0.0]];
    let d = decide_compression(
        &cfg,
        &CompressionInput {
            query: "exact same words",
            recent_queries: &recent,
            last_turn_ts: Some(NOW - 24 * HOUR_MS),
            query_embedding: Some(&query_emb),
            recent_embeddings: Some(&recent_embs),
            now_ms: NOW,
        },
    );
    assert!(d.semantic_distance > cfg.very_different_threshold);
    assert_eq!(d.level, CompressionLevel::CompressAll);
}

#[test]
fn decision_is_idempotent() {
    let cfg = HmlrConfig::default();
    let recent = queries(&["sqlite tuning", "index selection"]);
    let i = input("weekend travel plans", &recent, Some(NOW - 20 * HOUR_MS));
    let a = decide_compression(&cfg, &i);
    let b = decide_compression(&cfg, &i);
    assert_eq!(a.level, b.level);
    assert_eq!(a.keep_verbatim_count, b.keep_verbatim_count);
    assert_eq!(a.has_explicit_reference, b.has_explicit_reference);
    assert!((a.semantic_distance - b.semantic_distance).abs() < 1e-12);
}
