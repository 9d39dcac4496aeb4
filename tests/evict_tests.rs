use std::sync::Arc;

use hmlr::config::HmlrConfig;
use hmlr::db::{today_day_id, HmlrDB, Turn};
use hmlr::evict::{check_and_evict, prefetch_by_affinity, rehydrate};

fn test_db() -> Arc<HmlrDB> {
    Arc::new(HmlrDB::open(":memory:").expect("in-memory db"))
}

fn kw(words: &[&str]) -> Vec<String> {
    words.iter().map(|s| s.to_string()).collect()
}

fn day_turns(db: &HmlrDB, day: &str) -> Vec<Turn> {
    db.turns_by_day(day).unwrap()
}

#[test]
fn space_eviction_converges_on_turn_bound() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Busy Topic", &[], None).unwrap();
    for i in 0..35 {
        db.append_turn(&format!("turn_{i:03}"), &block.id, &format!("question {i}"), "answer", &[], "neutral")
            .unwrap();
    }

    let cfg = HmlrConfig::default();
    let report = check_and_evict(&db, &cfg, &day).unwrap();
    assert_eq!(report.space_evicted, 5);

    let remaining = day_turns(&db, &day);
    assert!(remaining.len() <= cfg.max_window_turns);
    // FIFO: the oldest five went first.
    assert_eq!(remaining[0].id, "turn_005");
}

#[test]
fn space_eviction_converges_on_token_bound() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Verbose Topic", &[], None).unwrap();
    // 10 turns x ~1000 tokens each blows the 5000-token bound.
    let long = "x".repeat(2000);
    for i in 0..10 {
        db.append_turn(&format!("turn_{i:03}"), &block.id, &long, &long, &[], "neutral").unwrap();
    }

    let cfg = HmlrConfig::default();
    let report = check_and_evict(&db, &cfg, &day).unwrap();
    assert!(report.space_evicted > 0);

    let remaining = day_turns(&db, &day);
    let total_tokens: usize = remaining.iter().map(Turn::token_estimate).sum();
    assert!(total_tokens <= cfg.max_window_tokens, "tokens {total_tokens}");
    assert!(remaining.len() <= cfg.max_window_turns);
}

#[test]
fn time_eviction_with_zero_horizon_clears_window() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Stale Topic", &[], None).unwrap();
    db.append_turn("turn_1", &block.id, "old question", "old answer", &[], "neutral").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));

    let mut cfg = HmlrConfig::default();
    cfg.time_eviction_hours = 0.0;
    let report = check_and_evict(&db, &cfg, &day).unwrap();
    assert_eq!(report.time_evicted, 1);
    assert!(day_turns(&db, &day).is_empty());
}

#[test]
fn eviction_updates_topic_affinity() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Billing Questions", &[], None).unwrap();
    db.append_turn("turn_1", &block.id, "invoice?", "sure", &[], "neutral").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));

    let mut cfg = HmlrConfig::default();
    cfg.time_eviction_hours = 0.0;
    check_and_evict(&db, &cfg, &day).unwrap();

    let affinity = db.get_topic_affinity("billing questions").unwrap().expect("affinity row");
    assert_eq!(affinity.eviction_count, 1);
    assert!(affinity.total_time_in_window >= 0);
    assert!((affinity.avg_time_in_window - affinity.total_time_in_window as f64).abs() < 1e-6);

    // A second eviction for the same topic accumulates.
    let block2 = db.create_block(&day, "Billing Questions", &[], None).unwrap();
    db.append_turn("turn_2", &block2.id, "another invoice?", "yes", &[], "neutral").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    check_and_evict(&db, &cfg, &day).unwrap();

    let affinity = db.get_topic_affinity("Billing Questions").unwrap().expect("affinity row");
    assert_eq!(affinity.eviction_count, 2);
}

#[test]
fn eviction_noop_within_bounds() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Small Topic", &[], None).unwrap();
    db.append_turn("turn_1", &block.id, "hi", "hello", &[], "neutral").unwrap();

    let cfg = HmlrConfig::default();
    let report = check_and_evict(&db, &cfg, &day).unwrap();
    assert_eq!(report.time_evicted, 0);
    assert_eq!(report.space_evicted, 0);
    assert_eq!(report.remaining_turns, 1);
}

#[test]
fn rehydration_matches_keywords_outside_current_block() {
    let db = test_db();
    let day = today_day_id();
    let contracts = db.create_block(&day, "Contracts", &kw(&["contract", "legal"]), None).unwrap();
    db.append_turn("turn_old", &contracts.id, "contract question", "answer", &kw(&["contract"]), "neutral")
        .unwrap();
    let cooking = db.create_block(&day, "Cooking", &kw(&["pasta"]), None).unwrap();
    db.append_turn("turn_now", &cooking.id, "pasta question", "answer", &kw(&["pasta"]), "neutral")
        .unwrap();

    let cfg = HmlrConfig::default();
    let hits = rehydrate(&db, &cfg, &kw(&["contract"]), Some(&cooking.id)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].turn.id, "turn_old");
    // Turn keyword + block keyword both matched.
    assert_eq!(hits[0].match_score, 2);

    // The rehydrated turn's usage stat was bumped.
    let usage = db.get_usage("turn_old").unwrap().expect("usage row");
    assert_eq!(usage.usage_count, 1);
    assert_eq!(usage.item_type, "turn");
}

#[test]
fn rehydration_clipped_to_cap() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "History", &kw(&["archive"]), None).unwrap();
    for i in 0..15 {
        db.append_turn(
            &format!("turn_{i:03}"),
            &block.id,
            "archived question",
            "answer",
            &kw(&["archive"]),
            "neutral",
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    let current = db.create_block(&day, "Now", &[], None).unwrap();

    let cfg = HmlrConfig::default();
    let hits = rehydrate(&db, &cfg, &kw(&["archive"]), Some(&current.id)).unwrap();
    assert_eq!(hits.len(), cfg.max_rehydration_turns);
    // Newest first among equal scores.
    assert_eq!(hits[0].turn.id, "turn_014");
}

#[test]
fn rehydration_without_keywords_is_empty() {
    let db = test_db();
    let cfg = HmlrConfig::default();
    assert!(rehydrate(&db, &cfg, &[], None).unwrap().is_empty());
}

#[test]
fn prefetch_returns_turn_ids_for_overlapping_blocks() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Infra", &kw(&["deploy", "pipeline"]), None).unwrap();
    for i in 0..8 {
        db.append_turn(&format!("turn_{i:03}"), &block.id, "deploy step", "done", &[], "neutral")
            .unwrap();
    }
    db.create_block(&day, "Other", &kw(&["gardening"]), None).unwrap();

    let cfg = HmlrConfig::default();
    let ids = prefetch_by_affinity(&db, &cfg, "deploy pipeline work").unwrap();
    assert!(!ids.is_empty());
    assert!(ids.len() <= 5);
    // Most recent turns of the matching block come first.
    assert_eq!(ids[0], "turn_007");

    let none = prefetch_by_affinity(&db, &cfg, "completely unrelated").unwrap();
    assert!(none.is_empty());
}
