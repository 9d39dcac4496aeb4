use super::*;
use crate::db::ChunkType;

#[test]
fn single_paragraph_no_separator() {
    let chunks = chunk_text("Just one paragraph here", "turn_1", None);
    let paras: Vec<_> = chunks.iter().filter(|c| c.chunk_type == ChunkType::Paragraph).collect();
    assert_eq!(paras.len(), 1);
    assert_eq!(paras[0].text_verbatim, "Just one paragraph here");
}

#[test]
fn paragraphs_split_on_blank_lines() {
    let text = "First paragraph.\n\nSecond paragraph.\n   \nThird paragraph.";
    let chunks = chunk_text(text, "turn_1", None);
    let paras: Vec<_> = chunks
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Paragraph)
        .map(|c| c.text_verbatim.as_str())
        .collect();
    assert_eq!(paras, vec!["First paragraph.", "Second paragraph.", "Third paragraph."]);
}

#[test]
fn sentences_carry_parent_paragraph() {
    let chunks = chunk_text("One sentence. Two sentence! Three sentence?", "turn_1", None);
    let para_id = chunks
        .iter()
        .find(|c| c.chunk_type == ChunkType::Paragraph)
        .map(|c| c.id.clone())
        .unwrap();
    let sentences: Vec<_> =
        chunks.iter().filter(|c| c.chunk_type == ChunkType::Sentence).collect();
    assert_eq!(sentences.len(), 3);
    assert_eq!(sentences[0].text_verbatim, "One sentence.");
    assert_eq!(sentences[1].text_verbatim, "Two sentence!");
    assert_eq!(sentences[2].text_verbatim, "Three sentence?");
    for s in &sentences {
        assert_eq!(s.parent_chunk_id.as_deref(), Some(para_id.as_str()));
    }
}

#[test]
fn terminator_without_whitespace_does_not_split() {
    // Version numbers and file names keep their dots.
    let chunks = chunk_text("We shipped v1.2 today", "turn_1", None);
    let sentences: Vec<_> =
        chunks.iter().filter(|c| c.chunk_type == ChunkType::Sentence).collect();
    assert_eq!(sentences.len(), 1);
    assert_eq!(sentences[0].text_verbatim, "We shipped v1.2 today");
}

#[test]
fn paragraph_roundtrip_up_to_whitespace() {
    let text = "Alpha one. Alpha two.\n\nBeta one.\n\nGamma.";
    let chunks = chunk_text(text, "turn_1", None);
    let rejoined: String = chunks
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Paragraph)
        .map(|c| c.text_verbatim.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    assert_eq!(rejoined, text);
}

#[test]
fn sentence_roundtrip_within_paragraph() {
    let para = "Alpha one. Alpha two! Alpha three?";
    let chunks = chunk_text(para, "turn_1", None);
    let rejoined: String = chunks
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Sentence)
        .map(|c| c.text_verbatim.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    assert_eq!(rejoined, para);
}

#[test]
fn empty_text_yields_no_chunks() {
    assert!(chunk_text("", "turn_1", None).is_empty());
    assert!(chunk_text("   \n\n  ", "turn_1", None).is_empty());
}

#[test]
fn chunk_ids_are_prefixed_and_distinct() {
    let chunks = chunk_text("A sentence. Another one.\n\nNext paragraph.", "turn_1", None);
    let mut ids = std::collections::HashSet::new();
    for c in &chunks {
        match c.chunk_type {
            ChunkType::Paragraph => assert!(c.id.starts_with("para_"), "{}", c.id),
            ChunkType::Sentence => assert!(c.id.starts_with("sent_"), "{}", c.id),
        }
        assert!(ids.insert(c.id.clone()), "duplicate id {}", c.id);
    }
}

#[test]
fn lexical_filters_drop_stop_words_and_short_tokens() {
    let filters = extract_lexical_filters("The quick brown fox and the lazy dog at a zoo");
    assert!(!filters.contains(&"the".to_string()));
    assert!(!filters.contains(&"and".to_string()));
    assert!(!filters.contains(&"at".to_string()));
    assert!(filters.contains(&"quick".to_string()));
    assert!(filters.contains(&"brown".to_string()));
    assert!(filters.contains(&"lazy".to_string()));
}

#[test]
fn lexical_filters_dedupe_preserving_order() {
    let filters = extract_lexical_filters("rust rust tokio Rust tokio axum");
    assert_eq!(filters, vec!["rust", "tokio", "axum"]);
}

#[test]
fn lexical_filters_capped_at_twenty() {
    let text: String =
        (0..40).map(|i| format!("uniqueword{i}")).collect::<Vec<_>>().join(" ");
    assert_eq!(extract_lexical_filters(&text).len(), 20);
}

#[test]
fn lexical_filters_strip_punctuation() {
    let filters = extract_lexical_filters("contract-law, agreement; (signing)");
    assert_eq!(filters, vec!["contract", "law", "agreement", "signing"]);
}

#[test]
fn token_count_is_ceil_len_over_four() {
    let chunks = chunk_text("abcdefgh", "turn_1", None);
    assert_eq!(chunks[0].token_count, 2);
    let chunks = chunk_text("abcdefghi", "turn_1", None);
    assert_eq!(chunks[0].token_count, 3);
}

#[test]
fn block_id_flows_through_when_known() {
    let chunks = chunk_text("Hello there.", "turn_1", Some("blk_1"));
    assert!(chunks.iter().all(|c| c.block_id.as_deref() == Some("blk_1")));
    let chunks = chunk_text("Hello there.", "turn_1", None);
    assert!(chunks.iter().all(|c| c.block_id.is_none()));
}
