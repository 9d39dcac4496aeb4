use std::sync::Arc;

use hmlr::ai::normalize;
use hmlr::config::HmlrConfig;
use hmlr::db::{today_day_id, HmlrDB};
use hmlr::retrieval::{
    extract_terms, lexical_score, search_chunks, search_facts, search_gardened,
    search_memories, search_memories_hybrid, search_memories_semantic,
};

fn test_db() -> Arc<HmlrDB> {
    Arc::new(HmlrDB::open(":memory:").expect("in-memory db"))
}

/// Unit vector along one axis of a 4-dim space, tilted by `off` on axis 1.
fn vec4(axis: usize, off: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; 4];
    v[axis] = 1.0;
    v[1] += off;
    normalize(v)
}

fn seed_block(db: &HmlrDB, day: &str, label: &str, keywords: &[&str]) -> String {
    let kw: Vec<String> = keywords.iter().map(|s| s.to_string()).collect();
    let block = db.create_block(day, label, &kw, None).unwrap();
    block.id
}

fn seed_memory(db: &HmlrDB, id: &str, block_id: &str, content: &str, emb: Option<&[f32]>) {
    db.append_turn(&format!("turn_{id}"), block_id, content, "reply", &[], "neutral").unwrap();
    db.insert_memory(id, &format!("turn_{id}"), block_id, content, 0, emb).unwrap();
}

#[test]
fn lexical_search_ranks_by_match_fraction() {
    let db = test_db();
    let block = seed_block(&db, "2026-08-01", "Infra", &[]);
    seed_memory(&db, "mem_a", &block, "the deploy pipeline uses blue green rollout", None);
    seed_memory(&db, "mem_b", &block, "deploy notes", None);
    seed_memory(&db, "mem_c", &block, "lunch plans for friday", None);

    let terms = extract_terms("deploy pipeline rollout");
    let results = search_memories(&db, &terms, 10).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].memory.id, "mem_a");
    assert!((results[0].score - 1.0).abs() < 1e-9);
    assert_eq!(results[1].memory.id, "mem_b");
    assert!(results[0].score > results[1].score);
}

#[test]
fn chunk_search_respects_type_filter() {
    let db = test_db();
    let block = seed_block(&db, "2026-08-01", "Infra", &[]);
    db.append_turn("turn_1", &block, "seed", "reply", &[], "neutral").unwrap();
    let chunks = hmlr::chunker::chunk_text(
        "Deploy pipeline details. Rollback steps matter.",
        "turn_1",
        Some(&block),
    );
    db.insert_chunks(&chunks).unwrap();

    let terms = extract_terms("deploy pipeline");
    let all = search_chunks(&db, &terms, None, 10).unwrap();
    assert!(all.len() >= 2);

    let sentences =
        search_chunks(&db, &terms, Some(hmlr::db::ChunkType::Sentence), 10).unwrap();
    assert!(sentences
        .iter()
        .all(|c| c.chunk.chunk_type == hmlr::db::ChunkType::Sentence));
    assert!(!sentences.is_empty());
}

#[test]
fn fact_search_skips_deleted_values() {
    let db = test_db();
    let block = seed_block(&db, "2026-08-01", "Infra", &[]);
    let fact = db
        .store_fact(
            hmlr::db::FactInput {
                key: "deploy_window".into(),
                value: "friday evenings".into(),
                ..Default::default()
            },
            &block,
        )
        .unwrap();

    let terms = extract_terms("deploy window");
    assert_eq!(search_facts(&db, &terms, None, 10).unwrap().len(), 1);

    db.remove_fact(&fact.id).unwrap();
    assert!(search_facts(&db, &terms, None, 10).unwrap().is_empty());
}

#[test]
fn semantic_search_orders_by_cosine() {
    let db = test_db();
    let block = seed_block(&db, "2026-08-01", "Infra", &[]);
    seed_memory(&db, "mem_close", &block, "close", Some(&vec4(0, 0.3)));
    seed_memory(&db, "mem_far", &block, "far", Some(&vec4(3, 0.0)));
    seed_memory(&db, "mem_mid", &block, "mid", Some(&vec4(0, 1.0)));

    let query = vec4(0, 0.0);
    let results = search_memories_semantic(&db, &query, 3).unwrap();
    assert_eq!(results[0].memory.id, "mem_close");
    assert_eq!(results[1].memory.id, "mem_mid");
}

#[test]
fn hybrid_weights_are_monotone() {
    let db = test_db();
    let block = seed_block(&db, "2026-08-01", "Infra", &[]);
    // mem_vec: perfect vector match, no lexical overlap with the query.
    seed_memory(&db, "mem_vec", &block, "unrelated wording entirely", Some(&vec4(0, 0.0)));
    // mem_lex: perfect lexical match, orthogonal vector.
    seed_memory(&db, "mem_lex", &block, "deploy pipeline rollout", Some(&vec4(3, 0.0)));

    let query = vec4(0, 0.0);

    let mut vector_heavy = HmlrConfig::default();
    vector_heavy.vector_weight = 0.9;
    vector_heavy.lexical_weight = 0.1;
    vector_heavy.hybrid_min_score = 0.05;
    let results =
        search_memories_hybrid(&db, &vector_heavy, "deploy pipeline rollout", &query).unwrap();
    assert_eq!(results[0].memory.id, "mem_vec");

    let mut lexical_heavy = HmlrConfig::default();
    lexical_heavy.vector_weight = 0.1;
    lexical_heavy.lexical_weight = 0.9;
    lexical_heavy.hybrid_min_score = 0.05;
    let results =
        search_memories_hybrid(&db, &lexical_heavy, "deploy pipeline rollout", &query).unwrap();
    assert_eq!(results[0].memory.id, "mem_lex");
}

#[test]
fn hybrid_min_score_filters() {
    let db = test_db();
    let block = seed_block(&db, "2026-08-01", "Infra", &[]);
    seed_memory(&db, "mem_weak", &block, "nothing in common", Some(&vec4(3, 0.0)));

    let cfg = HmlrConfig::default();
    let query = vec4(0, 0.0);
    let results = search_memories_hybrid(&db, &cfg, "deploy pipeline", &query).unwrap();
    assert!(results.is_empty());
}

#[test]
fn gardened_excludes_current_day_by_default() {
    let db = test_db();
    let today = today_day_id();
    let today_block = seed_block(&db, &today, "Today", &["fresh"]);
    let old_block = seed_block(&db, "2026-01-15", "Old", &["archive", "history"]);
    seed_memory(&db, "mem_today", &today_block, "today's exchange", Some(&vec4(0, 0.0)));
    seed_memory(&db, "mem_old", &old_block, "an older exchange", Some(&vec4(0, 0.1)));

    let cfg = HmlrConfig::default();
    let results = search_gardened(&db, &cfg, &vec4(0, 0.0), &today).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].memory.id, "mem_old");
    assert_eq!(results[0].meta_tags, vec!["archive", "history"]);
    assert_eq!(results[0].chunk_type, "sentence");

    let mut no_exclude = HmlrConfig::default();
    no_exclude.garden_exclude_today = false;
    let results = search_gardened(&db, &no_exclude, &vec4(0, 0.0), &today).unwrap();
    assert_eq!(results.len(), 2);
}

#[test]
fn gardened_drops_low_similarity() {
    let db = test_db();
    let block = seed_block(&db, "2026-01-15", "Old", &[]);
    seed_memory(&db, "mem_far", &block, "far away", Some(&vec4(3, 0.0)));

    let cfg = HmlrConfig::default();
    let results = search_gardened(&db, &cfg, &vec4(0, 0.0), &today_day_id()).unwrap();
    assert!(results.is_empty());
}

#[test]
fn lexical_score_partial_and_exact() {
    let terms = vec!["rust".to_string(), "tokio".to_string(), "axum".to_string()];
    let (score, matched) = lexical_score("rust with tokio runtime", &terms);
    assert!((score - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(matched, vec!["rust", "tokio"]);
}
