//! Memory rows and the vector index that serves semantic search.

use rusqlite::params;

use super::*;

fn row_to_memory(row: &rusqlite::Row, include_embedding: bool) -> rusqlite::Result<MemoryRow> {
    let embedding = if include_embedding {
        let blob: Option<Vec<u8>> = row.get("embedding").ok();
        blob.map(|b| crate::ai::bytes_to_embedding(&b))
    } else {
        None
    };
    Ok(MemoryRow {
        id: row.get("id")?,
        turn_id: row.get("turn_id")?,
        block_id: row.get("block_id")?,
        content: row.get("content")?,
        chunk_index: row.get("chunk_index")?,
        embedding,
        created_at: row.get("created_at")?,
    })
}

impl HmlrDB {
    /// Insert a memory row and register its embedding in the vector index.
    pub fn insert_memory(
        &self,
        id: &str,
        turn_id: &str,
        block_id: &str,
        content: &str,
        chunk_index: i64,
        embedding: Option<&[f32]>,
    ) -> Result<MemoryRow, HmlrError> {
        let now = now_ms();
        let blob = embedding.map(crate::ai::embedding_to_bytes);
        self.conn()?.execute(
            "INSERT INTO memories (id, turn_id, block_id, content, chunk_index, embedding, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, turn_id, block_id, content, chunk_index, blob, now],
        )?;
        if let Some(emb) = embedding {
            self.vec_index_put(id, emb.to_vec());
        }
        Ok(MemoryRow {
            id: id.to_string(),
            turn_id: turn_id.to_string(),
            block_id: block_id.to_string(),
            content: content.to_string(),
            chunk_index,
            embedding: embedding.map(|e| e.to_vec()),
            created_at: now,
        })
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRow>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, turn_id, block_id, content, chunk_index, embedding, created_at \
             FROM memories WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], |r| row_to_memory(r, false))?;
        Ok(rows.next().transpose()?)
    }

    pub fn memories_by_block(&self, block_id: &str) -> Result<Vec<MemoryRow>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, turn_id, block_id, content, chunk_index, embedding, created_at \
             FROM memories WHERE block_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([block_id], |r| row_to_memory(r, false))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All memories (no embeddings) for lexical scans.
    pub fn all_memories(&self) -> Result<Vec<MemoryRow>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, turn_id, block_id, content, chunk_index, embedding, created_at \
             FROM memories ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |r| row_to_memory(r, false))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_memory_embedding(&self, id: &str, embedding: &[f32]) -> Result<(), HmlrError> {
        let bytes = crate::ai::embedding_to_bytes(embedding);
        self.conn()?.execute(
            "UPDATE memories SET embedding = ?1 WHERE id = ?2",
            params![bytes, id],
        )?;
        self.vec_index_put(id, embedding.to_vec());
        Ok(())
    }

    /// Rebuild the in-memory vector index from persisted blobs.
    pub(super) fn load_vec_index(&self) {
        let Ok(conn) = self.conn() else { return };
        let Ok(mut stmt) =
            conn.prepare("SELECT id, embedding FROM memories WHERE embedding IS NOT NULL")
        else {
            return;
        };

        let pairs: Vec<(String, Vec<f32>)> = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, crate::ai::bytes_to_embedding(&blob)))
            })
            .map(|iter| iter.filter_map(|r| r.ok()).collect())
            .unwrap_or_default();

        if let Ok(mut idx) = self.vec_index.write() {
            idx.clear();
            let count = pairs.len();
            for (id, emb) in pairs {
                idx.insert(id, emb);
            }
            tracing::debug!(count, "loaded vector index");
        }
    }

    fn vec_index_put(&self, id: &str, emb: Vec<f32>) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.insert(id.to_string(), emb);
        }
    }

    #[allow(dead_code)]
    fn vec_index_remove(&self, id: &str) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.remove(id);
        }
    }

    pub fn vec_index_len(&self) -> usize {
        self.vec_index.read().map(|i| i.len()).unwrap_or(0)
    }

    /// Cosine search over the memory index. Returns `(memory_id, score)`
    /// sorted by score descending, ties by id.
    pub fn search_memory_vectors(&self, query: &[f32], limit: usize) -> Vec<(String, f64)> {
        if let Ok(idx) = self.vec_index.read() {
            if !idx.is_empty() {
                return idx.search(query, limit);
            }
        }
        // Index empty or poisoned: scan blobs directly.
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) =
            conn.prepare("SELECT id, embedding FROM memories WHERE embedding IS NOT NULL")
        else {
            return vec![];
        };
        let mut scored: Vec<(String, f64)> = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, crate::ai::bytes_to_embedding(&blob)))
            })
            .map(|iter| {
                iter.filter_map(|r| r.ok())
                    .map(|(id, emb)| {
                        let sim = crate::ai::cosine_similarity(query, &emb);
                        (id, sim)
                    })
                    .filter(|(_, sim)| *sim > 0.0)
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        scored
    }

    /// Persistent embed-cache backing for the LRU in `lib.rs`.
    pub fn embed_cache_put(&self, query: &str, embedding: &[f32]) {
        let bytes = crate::ai::embedding_to_bytes(embedding);
        if let Ok(conn) = self.conn() {
            let _ = conn.execute(
                "INSERT OR REPLACE INTO embed_cache (query, embedding, created_at) VALUES (?1, ?2, ?3)",
                params![query, bytes, now_ms()],
            );
        }
    }

    pub fn embed_cache_load_all(&self) -> Vec<(String, Vec<f32>)> {
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare("SELECT query, embedding FROM embed_cache") else {
            return vec![];
        };
        stmt.query_map([], |row| {
            let q: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((q, crate::ai::bytes_to_embedding(&blob)))
        })
        .map(|iter| iter.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }
}
