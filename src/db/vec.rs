//! In-memory vector index over memory embeddings.

use std::collections::HashMap;

/// Brute-force cosine index. O(n) per query — fine for the tens of
/// thousands of memories a single agent accumulates; swap for HNSW if a
/// deployment outgrows it.
pub(super) struct VecIndex {
    entries: HashMap<String, Vec<f32>>,
}

impl VecIndex {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn insert(&mut self, id: String, emb: Vec<f32>) {
        self.entries.insert(id, emb);
    }

    pub fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-`limit` ids by cosine similarity, descending. Ties break by
    /// lexicographic id so results are stable across runs.
    pub fn search(&self, query: &[f32], limit: usize) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self
            .entries
            .iter()
            .map(|(id, emb)| (id.clone(), crate::ai::cosine_similarity(query, emb)))
            .filter(|(_, sim)| *sim > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        scored
    }
}
