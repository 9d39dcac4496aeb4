use super::*;

fn test_db() -> HmlrDB {
    HmlrDB::open(":memory:").expect("in-memory db")
}

fn kw(words: &[&str]) -> Vec<String> {
    words.iter().map(|s| s.to_string()).collect()
}

#[test]
fn create_block_is_active() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "Contract Review", &kw(&["contract"]), None).unwrap();
    assert_eq!(block.status, BlockStatus::Active);
    assert_eq!(block.day_id, "2026-08-02");
    assert_eq!(block.turn_count, 0);
    assert!(block.id.starts_with("blk_"));

    let loaded = db.get_block(&block.id).unwrap().expect("block");
    assert_eq!(loaded.topic_label, "Contract Review");
    assert_eq!(loaded.keywords, vec!["contract"]);
}

#[test]
fn create_pauses_previous_active() {
    let db = test_db();
    let first = db.create_block("2026-08-02", "Topic A", &[], None).unwrap();
    let second = db.create_block("2026-08-02", "Topic B", &[], Some(&first.id)).unwrap();

    assert_eq!(db.get_block(&first.id).unwrap().unwrap().status, BlockStatus::Paused);
    assert_eq!(db.get_block(&second.id).unwrap().unwrap().status, BlockStatus::Active);
    assert_eq!(db.active_block_count().unwrap(), 1);
    assert_eq!(
        db.get_block(&second.id).unwrap().unwrap().prev_block_id.as_deref(),
        Some(first.id.as_str())
    );
}

#[test]
fn at_most_one_active_after_any_transition_sequence() {
    let db = test_db();
    let a = db.create_block("2026-08-02", "A", &[], None).unwrap();
    let b = db.create_block("2026-08-02", "B", &[], None).unwrap();
    let c = db.create_block("2026-08-02", "C", &[], None).unwrap();

    db.update_block_status(&a.id, BlockStatus::Active).unwrap();
    assert_eq!(db.active_block_count().unwrap(), 1);

    db.update_block_status(&b.id, BlockStatus::Active).unwrap();
    assert_eq!(db.active_block_count().unwrap(), 1);

    db.pause_block_with_summary(&b.id).unwrap();
    assert_eq!(db.active_block_count().unwrap(), 0);

    db.update_block_status(&c.id, BlockStatus::Active).unwrap();
    db.update_block_status(&c.id, BlockStatus::Closed).unwrap();
    assert_eq!(db.active_block_count().unwrap(), 0);
    assert!(db.get_active_block(None).unwrap().is_none());
}

#[test]
fn resumption_flips_other_active_to_paused() {
    let db = test_db();
    let a = db.create_block("2026-08-02", "A", &[], None).unwrap();
    let b = db.create_block("2026-08-02", "B", &[], None).unwrap();

    db.update_block_status(&a.id, BlockStatus::Active).unwrap();
    let active = db.get_active_block(Some("2026-08-02")).unwrap().expect("active");
    assert_eq!(active.id, a.id);
    assert_eq!(db.get_block(&b.id).unwrap().unwrap().status, BlockStatus::Paused);
}

#[test]
fn unknown_block_status_update_is_not_found() {
    let db = test_db();
    assert!(matches!(
        db.update_block_status("blk_missing", BlockStatus::Paused),
        Err(HmlrError::NotFound)
    ));
}

#[test]
fn metadata_merge_dedupes_and_clamps() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "A", &kw(&["alpha", "beta"]), None).unwrap();

    let updated = db
        .update_block_metadata(
            &block.id,
            &BlockMetadataPatch {
                keywords: kw(&["beta", "Gamma", "gamma", "delta"]),
                open_loops: kw(&["check deadline"]),
                decisions_made: kw(&["use sqlite"]),
                summary: Some("merged".into()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(updated.keywords, vec!["alpha", "beta", "Gamma", "delta"]);
    assert_eq!(updated.summary, "merged");
    assert_eq!(updated.open_loops, vec!["check deadline"]);
    assert_eq!(updated.decisions_made, vec!["use sqlite"]);

    // Cardinality bound on keywords
    let many: Vec<String> = (0..30).map(|i| format!("kw{i}")).collect();
    let updated = db
        .update_block_metadata(
            &block.id,
            &BlockMetadataPatch { keywords: many, ..Default::default() },
        )
        .unwrap();
    assert_eq!(updated.keywords.len(), crate::thresholds::MAX_BLOCK_KEYWORDS);

    // And on open loops
    let many: Vec<String> = (0..15).map(|i| format!("loop{i}")).collect();
    let updated = db
        .update_block_metadata(
            &block.id,
            &BlockMetadataPatch { open_loops: many, ..Default::default() },
        )
        .unwrap();
    assert_eq!(updated.open_loops.len(), crate::thresholds::MAX_BLOCK_LIST_ITEMS);
}

#[test]
fn summary_overwrites_but_absent_summary_keeps_old() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "A", &[], None).unwrap();
    db.update_block_metadata(
        &block.id,
        &BlockMetadataPatch { summary: Some("first".into()), ..Default::default() },
    )
    .unwrap();
    let updated = db
        .update_block_metadata(
            &block.id,
            &BlockMetadataPatch { keywords: kw(&["x"]), ..Default::default() },
        )
        .unwrap();
    assert_eq!(updated.summary, "first");
}

#[test]
fn append_turn_counts_and_bumps_updated_at() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "A", &[], None).unwrap();

    db.append_turn("turn_1", &block.id, "hello", "hi", &[], "neutral").unwrap();
    db.append_turn("turn_2", &block.id, "more", "sure", &[], "curious").unwrap();

    let loaded = db.get_block(&block.id).unwrap().unwrap();
    assert_eq!(loaded.turn_count, 2);
    assert!(loaded.updated_at >= loaded.created_at);

    let turns = db.turns_by_block(&block.id).unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(loaded.turn_count as usize, turns.len());
    assert_eq!(turns[0].id, "turn_1");
    assert_eq!(turns[1].affect, "curious");
}

#[test]
fn append_to_unknown_block_fails() {
    let db = test_db();
    assert!(db.append_turn("turn_1", "blk_missing", "hello", "hi", &[], "neutral").is_err());
}

#[test]
fn pause_with_summary_synthesizes_heuristic() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "A", &[], None).unwrap();
    db.append_turn("turn_1", &block.id, "What is a bridge loan and how does it work?", "…", &[], "neutral")
        .unwrap();
    db.append_turn("turn_2", &block.id, "And what rates should I expect?", "…", &[], "neutral")
        .unwrap();

    let paused = db.pause_block_with_summary(&block.id).unwrap();
    assert_eq!(paused.status, BlockStatus::Paused);
    assert!(paused.summary.starts_with("2 exchanges."));
    assert!(paused.summary.contains("Started with: \"What is a bridge loan"));
    assert!(paused.summary.contains("Ended with: \"And what rates"));
}

#[test]
fn pause_single_turn_block_uses_short_form() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "A", &[], None).unwrap();
    db.append_turn("turn_1", &block.id, "Quick question about taxes", "…", &[], "neutral")
        .unwrap();

    let paused = db.pause_block_with_summary(&block.id).unwrap();
    assert!(paused.summary.starts_with("1 exchange:"));
    assert!(paused.summary.contains("Quick question about taxes"));
}

#[test]
fn pause_keeps_existing_summary() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "A", &[], None).unwrap();
    db.update_block_metadata(
        &block.id,
        &BlockMetadataPatch { summary: Some("already written".into()), ..Default::default() },
    )
    .unwrap();
    let paused = db.pause_block_with_summary(&block.id).unwrap();
    assert_eq!(paused.summary, "already written");
}

#[test]
fn metadata_projection_marks_last_active() {
    let db = test_db();
    let a = db.create_block("2026-08-02", "A", &[], None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let b = db.create_block("2026-08-02", "B", &[], None).unwrap();
    db.create_block("2026-08-03", "other day", &[], None).unwrap();

    let meta = db.block_metadata_by_day("2026-08-02").unwrap();
    assert_eq!(meta.len(), 2);
    let last: Vec<&BlockMetadata> = meta.iter().filter(|m| m.is_last_active).collect();
    assert_eq!(last.len(), 1);
    // B paused A and then was itself paused by the other-day create, but
    // the third create bumped only B's updated_at among day-1 blocks.
    assert_eq!(last[0].id, b.id);
    assert!(meta.iter().any(|m| m.id == a.id && !m.is_last_active));
}

#[test]
fn blocks_by_day_filters_day() {
    let db = test_db();
    db.create_block("2026-08-02", "A", &[], None).unwrap();
    db.create_block("2026-08-03", "B", &[], None).unwrap();

    assert_eq!(db.blocks_by_day("2026-08-02").unwrap().len(), 1);
    assert_eq!(db.blocks_by_day("2026-08-03").unwrap().len(), 1);
    assert!(db.blocks_by_day("2026-08-04").unwrap().is_empty());
}

#[test]
fn evict_turn_decrements_count() {
    let db = test_db();
    let block = db.create_block("2026-08-02", "A", &[], None).unwrap();
    db.append_turn("turn_1", &block.id, "one", "r1", &[], "neutral").unwrap();
    db.append_turn("turn_2", &block.id, "two", "r2", &[], "neutral").unwrap();

    let evicted = db.evict_turn("turn_1").unwrap().expect("turn");
    assert_eq!(evicted.user_message, "one");
    assert_eq!(db.get_block(&block.id).unwrap().unwrap().turn_count, 1);
    assert!(db.get_turn("turn_1").unwrap().is_none());
    assert!(db.evict_turn("turn_1").unwrap().is_none());
}
