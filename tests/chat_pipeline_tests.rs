//! Pipeline failure semantics: without a configured LLM the turn aborts
//! at the generation step, and the partial writes it leaves behind are
//! the tolerated kind (routed block, orphaned chunks), never a turn.

use std::sync::Arc;

use hmlr::chat::{self, ChatRequest};
use hmlr::config::HmlrConfig;
use hmlr::db::{today_day_id, HmlrDB};
use hmlr::error::{HmlrError, Step};
use hmlr::{AppState, EmbedCache};

fn test_state() -> AppState {
    let db = Arc::new(HmlrDB::open(":memory:").expect("in-memory db"));
    AppState {
        db,
        ai: None,
        cfg: HmlrConfig::default(),
        api_key: None,
        embed_cache: EmbedCache::new(16),
        scribe_tx: None,
        started_at: std::time::Instant::now(),
    }
}

#[tokio::test]
async fn turn_aborts_at_generation_without_llm() {
    let state = test_state();
    let err = chat::send_message(
        &state,
        ChatRequest { message: "First question of the day. It has two sentences.".into(), user_id: None },
    )
    .await
    .expect_err("no LLM configured");

    match err {
        HmlrError::Turn { step, source } => {
            assert_eq!(step, Step::LlmGeneration);
            assert!(matches!(*source, HmlrError::AiNotConfigured));
        }
        other => panic!("expected a step-tagged turn failure, got {other}"),
    }

    // The failed turn still routed: a block exists for today, ACTIVE,
    // with no appended turns.
    let day = today_day_id();
    let blocks = state.db.blocks_by_day(&day).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].turn_count, 0);
    let stats = state.db.store_stats().unwrap();
    assert_eq!(stats.turns, 0);
    assert_eq!(stats.active_blocks, 1);

    // Chunks were persisted before routing and patched to the block.
    assert!(stats.chunks >= 2);
}

#[tokio::test]
async fn empty_message_rejected_before_any_write() {
    let state = test_state();
    let err = chat::send_message(&state, ChatRequest { message: "   ".into(), user_id: None })
        .await
        .expect_err("empty message");
    assert!(matches!(err, HmlrError::EmptyMessage));

    let stats = state.db.store_stats().unwrap();
    assert_eq!(stats.blocks, 0);
    assert_eq!(stats.chunks, 0);
}

#[tokio::test]
async fn search_without_embedder_uses_lexical_mode() {
    let state = test_state();
    let day = today_day_id();
    let block = state.db.create_block(&day, "Infra", &[], None).unwrap();
    state.db.append_turn("turn_1", &block.id, "seed", "reply", &[], "neutral").unwrap();
    state
        .db
        .insert_memory("mem_1", "turn_1", &block.id, "deploy pipeline history", 0, None)
        .unwrap();

    let result = chat::search(&state, "deploy pipeline", 10).await.unwrap();
    assert_eq!(result["mode"], "lexical");
    assert_eq!(result["results"].as_array().unwrap().len(), 1);

    let err = chat::search(&state, "  ", 10).await.expect_err("empty query");
    assert!(matches!(err, HmlrError::EmptyQuery));
}
