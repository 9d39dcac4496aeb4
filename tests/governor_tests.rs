use std::sync::Arc;

use hmlr::config::HmlrConfig;
use hmlr::db::{today_day_id, FactInput, HmlrDB};
use hmlr::governor::{govern, resolve_scenario, RouteScenario};

fn test_db() -> Arc<HmlrDB> {
    Arc::new(HmlrDB::open(":memory:").expect("in-memory db"))
}

fn kw(words: &[&str]) -> Vec<String> {
    words.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn first_query_of_day_opens_new_topic() {
    let db = test_db();
    let cfg = HmlrConfig::default();
    let result = govern(&db, None, &cfg, "Good morning", None, &today_day_id()).await.unwrap();

    assert!(result.routing.is_new_topic);
    assert!(result.routing.matched_block_id.is_none());
    assert_eq!(result.routing.reasoning, "first_query_of_day");
    assert_eq!(result.routing.suggested_label.as_deref(), Some("Initial Conversation"));
    assert_eq!(resolve_scenario(&result.routing, None), RouteScenario::NewBlock);
}

#[tokio::test]
async fn without_llm_routing_falls_back_to_last_active() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Contracts", &kw(&["contract"]), None).unwrap();

    let cfg = HmlrConfig::default();
    let result =
        govern(&db, None, &cfg, "more about the contract", None, &day).await.unwrap();

    assert!(!result.routing.is_new_topic);
    assert_eq!(result.routing.matched_block_id.as_deref(), Some(block.id.as_str()));
    assert_eq!(
        resolve_scenario(&result.routing, Some(&block.id)),
        RouteScenario::Continuation(block.id.clone())
    );
}

#[tokio::test]
async fn heuristic_fallback_detects_topic_shift() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Contracts", &kw(&["contract", "law", "agreement"]), None).unwrap();

    let cfg = HmlrConfig::default();
    let result = govern(&db, None, &cfg, "quantum computing qubits entanglement", None, &day)
        .await
        .unwrap();

    assert!(result.routing.is_new_topic);
    assert!(result.routing.matched_block_id.is_none());
    assert_eq!(result.routing.suggested_label.as_deref(), Some("quantum"));
    assert_eq!(
        resolve_scenario(&result.routing, Some(&block.id)),
        RouteScenario::TopicShift { paused: block.id.clone() }
    );
}

#[tokio::test]
async fn heuristic_fallback_honors_explicit_shift_phrasing() {
    let db = test_db();
    let day = today_day_id();
    db.create_block(&day, "Contracts", &kw(&["contract", "law"]), None).unwrap();

    let cfg = HmlrConfig::default();
    let result = govern(&db, None, &cfg, "Actually, let's talk about cooking pasta", None, &day)
        .await
        .unwrap();

    assert!(result.routing.is_new_topic);
    let label = result.routing.suggested_label.expect("label");
    assert!(label.to_lowercase().contains("cooking"));
}

#[tokio::test]
async fn heuristic_fallback_keeps_continuation_phrasing_in_block() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Contracts", &kw(&["contract", "law"]), None).unwrap();

    let cfg = HmlrConfig::default();
    let result = govern(&db, None, &cfg, "So what about the penalty clause?", None, &day)
        .await
        .unwrap();

    assert!(!result.routing.is_new_topic);
    assert_eq!(result.routing.matched_block_id.as_deref(), Some(block.id.as_str()));
    assert_eq!(
        resolve_scenario(&result.routing, Some(&block.id)),
        RouteScenario::Continuation(block.id.clone())
    );
}

#[tokio::test]
async fn fact_lookup_hits_acronym_keys() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Architecture", &kw(&["AWS", "Lambda", "serverless"]), None).unwrap();
    db.store_fact(
        FactInput {
            key: "HMLR".into(),
            value: "Hierarchical Memory Lookup & Routing".into(),
            ..Default::default()
        },
        &block.id,
    )
    .unwrap();

    let cfg = HmlrConfig::default();

    // Fact key present: lookup short-circuits to the stored definition.
    let result = govern(&db, None, &cfg, "What does HMLR mean?", None, &day).await.unwrap();
    assert_eq!(result.facts.len(), 1);
    assert_eq!(result.facts[0].value, "Hierarchical Memory Lookup & Routing");

    // Fact miss, but the day ledger still routes to the block.
    let result = govern(&db, None, &cfg, "Tell me about AWS Lambda", None, &day).await.unwrap();
    assert!(result.facts.is_empty());
    assert_eq!(result.routing.matched_block_id.as_deref(), Some(block.id.as_str()));

    // Both miss: the caller falls through to vector search.
    let result =
        govern(&db, None, &cfg, "What about quantum computing?", None, &day).await.unwrap();
    assert!(result.facts.is_empty());
    assert!(result.memories.is_empty());
}

#[tokio::test]
async fn deleted_facts_are_skipped_by_lookup() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Misc", &[], None).unwrap();
    let fact = db
        .store_fact(
            FactInput { key: "OKR".into(), value: "objectives".into(), ..Default::default() },
            &block.id,
        )
        .unwrap();
    db.remove_fact(&fact.id).unwrap();

    let cfg = HmlrConfig::default();
    let result = govern(&db, None, &cfg, "What is our OKR?", None, &day).await.unwrap();
    assert!(result.facts.is_empty());
}

#[tokio::test]
async fn memory_filter_fallback_returns_top_candidates() {
    let db = test_db();
    let day = today_day_id();
    let block = db.create_block(&day, "Infra", &[], None).unwrap();
    for i in 0..8 {
        db.append_turn(&format!("turn_{i}"), &block.id, "seed", "reply", &[], "neutral").unwrap();
        db.insert_memory(
            &format!("mem_{i}"),
            &format!("turn_{i}"),
            &block.id,
            &format!("deploy pipeline note number {i}"),
            0,
            None,
        )
        .unwrap();
    }

    let cfg = HmlrConfig::default();
    let result = govern(&db, None, &cfg, "deploy pipeline", None, &day).await.unwrap();
    // Without an LLM the 2-key filter keeps the top five by score.
    assert_eq!(result.memories.len(), 5);
}
