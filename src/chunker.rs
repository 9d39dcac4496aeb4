//! Splits turn text into paragraph and sentence chunks and derives the
//! stop-word-filtered lexical filters retrieval matches against.

use crate::db::{now_ms, Chunk, ChunkType};
use crate::thresholds::MAX_LEXICAL_FILTERS;

/// Words too common to discriminate between chunks.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old", "see",
    "two", "way", "who", "did", "its", "let", "she", "too", "use", "that", "with", "have", "this",
    "will", "your", "from", "they", "know", "want", "been", "good", "much", "some", "time", "very",
    "when", "come", "here", "just", "like", "long", "make", "many", "more", "only", "over", "such",
    "take", "than", "them", "well", "were", "what", "about", "there", "which", "their", "would",
    "could", "should", "into", "also", "after", "before", "because", "does", "doing", "each",
    "other", "these", "those", "then", "being", "where", "while", "again",
];

fn is_stop_word(w: &str) -> bool {
    STOP_WORDS.contains(&w)
}

/// Lowercase, strip non-word characters, drop short and stop-word tokens,
/// dedupe preserving order, cap at the filter bound.
pub fn extract_lexical_filters(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();
    let mut seen = std::collections::HashSet::new();
    cleaned
        .split_whitespace()
        .filter(|w| w.len() > 2 && !is_stop_word(w))
        .filter(|w| seen.insert(w.to_string()))
        .take(MAX_LEXICAL_FILTERS)
        .map(str::to_string)
        .collect()
}

/// `ceil(len/4)` token estimate shared with the hydrator and eviction.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..6).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Split on blank-line boundaries, trimming each paragraph. Text without
/// separators becomes a single paragraph.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut blank_run = false;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run = true;
            continue;
        }
        if blank_run && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        blank_run = false;
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out.into_iter().map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
}

/// Split a paragraph into sentences on a terminator (. ! ?) followed by
/// whitespace. The terminator stays with its sentence.
fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = paragraph.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            if chars.peek().is_some_and(|n| n.is_whitespace()) {
                while chars.peek().is_some_and(|n| n.is_whitespace()) {
                    chars.next();
                }
                let s = current.trim().to_string();
                if !s.is_empty() {
                    out.push(s);
                }
                current.clear();
            }
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Chunk a turn's text. Emission order is stable for a given input and
/// monotonic in (paragraph index, sentence index): each paragraph chunk is
/// followed by its sentence chunks.
pub fn chunk_text(text: &str, turn_id: &str, block_id: Option<&str>) -> Vec<Chunk> {
    let ts = now_ms();
    let mut chunks = Vec::new();
    let mut sentence_idx = 0usize;

    for (p_idx, para) in split_paragraphs(text).into_iter().enumerate() {
        let para_id = format!("para_{ts}_{p_idx}_{}", nonce());
        chunks.push(Chunk {
            id: para_id.clone(),
            chunk_type: ChunkType::Paragraph,
            lexical_filters: extract_lexical_filters(&para),
            token_count: estimate_tokens(&para) as i64,
            text_verbatim: para.clone(),
            parent_chunk_id: None,
            turn_id: turn_id.to_string(),
            block_id: block_id.map(str::to_string),
            embedding: None,
            created_at: ts,
        });

        for sentence in split_sentences(&para) {
            let sent_id = format!("sent_{ts}_{sentence_idx}_{}", nonce());
            sentence_idx += 1;
            chunks.push(Chunk {
                id: sent_id,
                chunk_type: ChunkType::Sentence,
                lexical_filters: extract_lexical_filters(&sentence),
                token_count: estimate_tokens(&sentence) as i64,
                text_verbatim: sentence,
                parent_chunk_id: Some(para_id.clone()),
                turn_id: turn_id.to_string(),
                block_id: block_id.map(str::to_string),
                embedding: None,
                created_at: ts,
            });
        }
    }
    chunks
}

#[cfg(test)]
#[path = "chunker_tests.rs"]
mod tests;
