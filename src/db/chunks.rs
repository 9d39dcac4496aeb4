//! Chunk persistence. Chunks are written before routing with a null
//! block id, then patched in bulk once the governor picks a block.

use rusqlite::params;

use super::*;

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    let chunk_type: String = row.get("chunk_type")?;
    let filters: String = row.get("lexical_filters")?;
    let blob: Option<Vec<u8>> = row.get("embedding").ok();
    Ok(Chunk {
        id: row.get("id")?,
        chunk_type: if chunk_type == "sentence" {
            ChunkType::Sentence
        } else {
            ChunkType::Paragraph
        },
        text_verbatim: row.get("text_verbatim")?,
        lexical_filters: from_json(&filters),
        parent_chunk_id: row.get("parent_chunk_id")?,
        turn_id: row.get("turn_id")?,
        block_id: row.get("block_id")?,
        embedding: blob.map(|b| crate::ai::bytes_to_embedding(&b)),
        token_count: row.get("token_count")?,
        created_at: row.get("created_at")?,
    })
}

const CHUNK_COLS: &str = "id, chunk_type, text_verbatim, lexical_filters, parent_chunk_id, \
     turn_id, block_id, embedding, token_count, created_at";

impl HmlrDB {
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> Result<(), HmlrError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for c in chunks {
            let blob = c.embedding.as_deref().map(crate::ai::embedding_to_bytes);
            tx.execute(
                "INSERT INTO chunks (id, chunk_type, text_verbatim, lexical_filters, \
                 parent_chunk_id, turn_id, block_id, embedding, token_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    c.id,
                    c.chunk_type.as_str(),
                    c.text_verbatim,
                    to_json(&c.lexical_filters),
                    c.parent_chunk_id,
                    c.turn_id,
                    c.block_id,
                    blob,
                    c.token_count,
                    c.created_at
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {CHUNK_COLS} FROM chunks WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], row_to_chunk)?;
        Ok(rows.next().transpose()?)
    }

    /// Chunks for a turn in emission order (paragraphs interleaved with
    /// their sentences, as the chunker produced them).
    pub fn chunks_by_turn(&self, turn_id: &str) -> Result<Vec<Chunk>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM chunks WHERE turn_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([turn_id], row_to_chunk)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Bulk-patch block ownership once routing has resolved. Returns the
    /// number of chunks linked.
    pub fn link_chunks_to_block(&self, turn_id: &str, block_id: &str) -> Result<usize, HmlrError> {
        let n = self.conn()?.execute(
            "UPDATE chunks SET block_id = ?1 WHERE turn_id = ?2 AND block_id IS NULL",
            params![block_id, turn_id],
        )?;
        Ok(n)
    }

    /// All chunks, optionally restricted by type. Lexical retrieval scans
    /// this set; the filter keeps sentence/paragraph queries cheap.
    pub fn chunks_for_search(
        &self,
        chunk_type: Option<&ChunkType>,
    ) -> Result<Vec<Chunk>, HmlrError> {
        let conn = self.conn()?;
        let rows = match chunk_type {
            Some(t) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHUNK_COLS} FROM chunks WHERE chunk_type = ?1 \
                     ORDER BY created_at DESC, id DESC"
                ))?;
                let result = stmt.query_map([t.as_str()], row_to_chunk)?.collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHUNK_COLS} FROM chunks ORDER BY created_at DESC, id DESC"
                ))?;
                let result = stmt.query_map([], row_to_chunk)?.collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }
}
