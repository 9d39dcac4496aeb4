//! Lexical, semantic, and hybrid retrieval over memories, chunks, and
//! facts, plus the gardened (prior-day) memory search.

use serde::Serialize;

use crate::chunker::extract_lexical_filters;
use crate::config::HmlrConfig;
use crate::db::{Chunk, ChunkType, Fact, HmlrDB, MemoryRow};
use crate::error::HmlrError;

/// Query terms for lexical scoring — the same extraction pipeline the
/// chunker uses for its filters.
pub fn extract_terms(query: &str) -> Vec<String> {
    extract_lexical_filters(query)
}

/// Fraction of query terms found in the content. Exact word match first,
/// substring as the partial-match fallback. Returns the matched terms.
pub fn lexical_score(content: &str, terms: &[String]) -> (f64, Vec<String>) {
    if terms.is_empty() {
        return (0.0, vec![]);
    }
    let lower = content.to_lowercase();
    let words: std::collections::HashSet<&str> =
        lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect();
    let mut matched = Vec::new();
    for term in terms {
        if words.contains(term.as_str()) || lower.contains(term.as_str()) {
            matched.push(term.clone());
        }
    }
    (matched.len() as f64 / terms.len() as f64, matched)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: MemoryRow,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredFact {
    #[serde(flatten)]
    pub fact: Fact,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

/// A gardened memory: a prior-day memory surfaced by vector search, with
/// the owning block's keywords attached as meta-tags.
#[derive(Debug, Clone, Serialize)]
pub struct GardenedMemory {
    #[serde(flatten)]
    pub memory: MemoryRow,
    pub score: f64,
    pub chunk_type: &'static str,
    pub meta_tags: Vec<String>,
}

/// Deterministic ordering: score desc, then created_at desc, then id asc.
fn sort_ranked<T>(items: &mut [T], score: impl Fn(&T) -> f64, created: impl Fn(&T) -> i64, id: impl Fn(&T) -> String) {
    items.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| created(b).cmp(&created(a)))
            .then_with(|| id(a).cmp(&id(b)))
    });
}

/// Lexical search over memory contents.
pub fn search_memories(
    db: &HmlrDB,
    keywords: &[String],
    top_k: usize,
) -> Result<Vec<ScoredMemory>, HmlrError> {
    let mut scored: Vec<ScoredMemory> = db
        .all_memories()?
        .into_iter()
        .filter_map(|m| {
            let (score, matched) = lexical_score(&m.content, keywords);
            (score > 0.0).then_some(ScoredMemory { memory: m, score, matched_terms: matched })
        })
        .collect();
    sort_ranked(
        &mut scored,
        |s| s.score,
        |s| s.memory.created_at,
        |s| s.memory.id.clone(),
    );
    scored.truncate(top_k);
    Ok(scored)
}

/// Lexical search over chunks, optionally restricted to one chunk type.
/// Scoring runs over the chunk's lexical filters plus its verbatim text.
pub fn search_chunks(
    db: &HmlrDB,
    keywords: &[String],
    chunk_type: Option<ChunkType>,
    top_k: usize,
) -> Result<Vec<ScoredChunk>, HmlrError> {
    let mut scored: Vec<ScoredChunk> = db
        .chunks_for_search(chunk_type.as_ref())?
        .into_iter()
        .filter_map(|c| {
            let haystack = format!("{} {}", c.lexical_filters.join(" "), c.text_verbatim);
            let (score, matched) = lexical_score(&haystack, keywords);
            (score > 0.0).then_some(ScoredChunk { chunk: c, score, matched_terms: matched })
        })
        .collect();
    sort_ranked(&mut scored, |s| s.score, |s| s.chunk.created_at, |s| s.chunk.id.clone());
    scored.truncate(top_k);
    Ok(scored)
}

/// Lexical search over live facts (key + value + evidence), optionally
/// restricted to a category.
pub fn search_facts(
    db: &HmlrDB,
    keywords: &[String],
    category: Option<crate::db::FactCategory>,
    top_k: usize,
) -> Result<Vec<ScoredFact>, HmlrError> {
    let pool = match category {
        Some(cat) => db.facts_by_category(cat)?,
        None => db.list_facts(500, 0)?,
    };
    let mut scored: Vec<ScoredFact> = pool
        .into_iter()
        .filter(|f| !f.is_deleted())
        .filter_map(|f| {
            let haystack = format!(
                "{} {} {}",
                f.key,
                f.value,
                f.evidence_snippet.as_deref().unwrap_or("")
            );
            let (score, matched) = lexical_score(&haystack, keywords);
            (score > 0.0).then_some(ScoredFact { fact: f, score, matched_terms: matched })
        })
        .collect();
    sort_ranked(&mut scored, |s| s.score, |s| s.fact.created_at, |s| s.fact.id.clone());
    scored.truncate(top_k);
    Ok(scored)
}

/// Semantic search over memories by query embedding.
pub fn search_memories_semantic(
    db: &HmlrDB,
    query_embedding: &[f32],
    top_k: usize,
) -> Result<Vec<ScoredMemory>, HmlrError> {
    let hits = db.search_memory_vectors(query_embedding, top_k);
    let mut out = Vec::with_capacity(hits.len());
    for (id, score) in hits {
        if let Some(memory) = db.get_memory(&id)? {
            out.push(ScoredMemory { memory, score, matched_terms: vec![] });
        }
    }
    Ok(out)
}

/// Hybrid search: weighted combination of vector and lexical scores,
/// filtered by the minimum combined score and clipped to `top_k`.
pub fn search_memories_hybrid(
    db: &HmlrDB,
    cfg: &HmlrConfig,
    query: &str,
    query_embedding: &[f32],
) -> Result<Vec<ScoredMemory>, HmlrError> {
    let terms = extract_terms(query);
    let vector_hits = db.search_memory_vectors(query_embedding, cfg.top_k * 2);
    let vector_ids: std::collections::HashMap<String, f64> = vector_hits.into_iter().collect();

    let mut scored = Vec::new();
    for m in db.all_memories()? {
        let vector_score = vector_ids.get(&m.id).copied().unwrap_or(0.0);
        let (lex_score, matched) = lexical_score(&m.content, &terms);
        let combined = cfg.vector_weight * vector_score + cfg.lexical_weight * lex_score;
        if combined >= cfg.hybrid_min_score {
            scored.push(ScoredMemory { memory: m, score: combined, matched_terms: matched });
        }
    }
    sort_ranked(
        &mut scored,
        |s| s.score,
        |s| s.memory.created_at,
        |s| s.memory.id.clone(),
    );
    scored.truncate(cfg.top_k);
    Ok(scored)
}

fn classify_chunk_type(content: &str) -> &'static str {
    if content.len() < 200 {
        "sentence"
    } else if content.len() < 500 {
        "paragraph"
    } else {
        "turn"
    }
}

/// Gardened memory search: long-term (prior-day) memories by vector
/// similarity. Today's memories are excluded by default — they already
/// live in the sliding window.
pub fn search_gardened(
    db: &HmlrDB,
    cfg: &HmlrConfig,
    query_embedding: &[f32],
    current_day_id: &str,
) -> Result<Vec<GardenedMemory>, HmlrError> {
    let hits = db.search_memory_vectors(query_embedding, cfg.top_k * 2);
    let mut out = Vec::new();
    for (id, score) in hits {
        if out.len() >= cfg.top_k {
            break;
        }
        if score < cfg.gardened_min_similarity {
            continue;
        }
        let Some(memory) = db.get_memory(&id)? else { continue };
        let Some(block) = db.get_block(&memory.block_id)? else { continue };
        if cfg.garden_exclude_today && block.day_id == current_day_id {
            continue;
        }
        out.push(GardenedMemory {
            chunk_type: classify_chunk_type(&memory.content),
            meta_tags: block.keywords,
            memory,
            score,
        });
    }
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_score_counts_matched_fraction() {
        let terms = vec!["contract".to_string(), "deadline".to_string()];
        let (score, matched) = lexical_score("the contract is signed", &terms);
        assert!((score - 0.5).abs() < 1e-9);
        assert_eq!(matched, vec!["contract"]);
    }

    #[test]
    fn lexical_score_substring_fallback() {
        let terms = vec!["deploy".to_string()];
        let (score, matched) = lexical_score("redeployment finished", &terms);
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(matched, vec!["deploy"]);
    }

    #[test]
    fn lexical_score_empty_terms() {
        let (score, matched) = lexical_score("anything", &[]);
        assert_eq!(score, 0.0);
        assert!(matched.is_empty());
    }

    #[test]
    fn chunk_type_classification_by_length() {
        assert_eq!(classify_chunk_type("short"), "sentence");
        assert_eq!(classify_chunk_type(&"x".repeat(300)), "paragraph");
        assert_eq!(classify_chunk_type(&"x".repeat(600)), "turn");
    }
}
