//! Keyed fact storage with supersession chains.
//!
//! For any key at most one row has `superseded_by = NULL`. Storing a new
//! value links every previously-live row to the new id inside one
//! transaction, so readers never observe two live rows for a key.

use rusqlite::params;
use uuid::Uuid;

use super::*;
use crate::thresholds::DELETED_FACT_VALUE;

fn row_to_fact(row: &rusqlite::Row) -> rusqlite::Result<Fact> {
    let category: Option<String> = row.get("category")?;
    Ok(Fact {
        id: row.get("id")?,
        key: row.get("key")?,
        value: row.get("value")?,
        category: category.as_deref().and_then(FactCategory::parse),
        block_id: row.get("block_id")?,
        turn_id: row.get("turn_id")?,
        evidence_snippet: row.get("evidence_snippet")?,
        source_chunk_id: row.get("source_chunk_id")?,
        source_paragraph_id: row.get("source_paragraph_id")?,
        confidence: row.get("confidence")?,
        superseded_by: row.get("superseded_by")?,
        created_at: row.get("created_at")?,
    })
}

const FACT_COLS: &str = "id, key, value, category, block_id, turn_id, evidence_snippet, \
     source_chunk_id, source_paragraph_id, confidence, superseded_by, created_at";

fn validate_fact(input: &FactInput) -> Result<(), HmlrError> {
    if input.key.trim().is_empty() {
        return Err(HmlrError::Validation("fact key must not be empty".into()));
    }
    if input.value.trim().is_empty() {
        return Err(HmlrError::Validation("fact value must not be empty".into()));
    }
    if let Some(c) = input.confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(HmlrError::Validation("confidence must be in [0,1]".into()));
        }
    }
    Ok(())
}

impl HmlrDB {
    /// The newest live fact for `key`, or None. Keys are case-preserving
    /// and matched exactly.
    pub fn get_fact(&self, key: &str) -> Result<Option<Fact>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts \
             WHERE key = ?1 AND superseded_by IS NULL \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map([key], row_to_fact)?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_fact_by_id(&self, id: &str) -> Result<Option<Fact>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {FACT_COLS} FROM facts WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], row_to_fact)?;
        Ok(rows.next().transpose()?)
    }

    /// All facts for a block, newest first, superseded rows included.
    pub fn facts_by_block(&self, block_id: &str) -> Result<Vec<Fact>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts WHERE block_id = ?1 \
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([block_id], row_to_fact)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Live facts for a category, newest first.
    pub fn facts_by_category(&self, category: FactCategory) -> Result<Vec<Fact>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts \
             WHERE category = ?1 AND superseded_by IS NULL \
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows =
            stmt.query_map([category.as_str()], row_to_fact)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Live facts whose key starts with `prefix`, case-insensitive.
    pub fn search_facts_by_key_prefix(&self, prefix: &str) -> Result<Vec<Fact>, HmlrError> {
        let conn = self.conn()?;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts \
             WHERE LOWER(key) LIKE LOWER(?1) ESCAPE '\\' AND superseded_by IS NULL \
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([pattern], row_to_fact)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert a new fact row and supersede every previously-live row with
    /// the same key. Insert and supersession commit together.
    pub fn store_fact(&self, input: FactInput, block_id: &str) -> Result<Fact, HmlrError> {
        validate_fact(&input)?;
        let now = now_ms();
        let id = format!("fact_{}_{}", now, &Uuid::new_v4().to_string()[..8]);
        let confidence = input.confidence.unwrap_or(1.0);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE facts SET superseded_by = ?1 WHERE key = ?2 AND superseded_by IS NULL",
            params![id, input.key],
        )?;
        tx.execute(
            "INSERT INTO facts (id, key, value, category, block_id, turn_id, evidence_snippet, \
             source_chunk_id, source_paragraph_id, confidence, superseded_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11)",
            params![
                id,
                input.key,
                input.value,
                input.category.map(FactCategory::as_str),
                block_id,
                input.turn_id,
                input.evidence_snippet,
                input.source_chunk_id,
                input.source_paragraph_id,
                confidence,
                now
            ],
        )?;
        tx.commit()?;

        Ok(Fact {
            id,
            key: input.key,
            value: input.value,
            category: input.category,
            block_id: block_id.to_string(),
            turn_id: input.turn_id,
            evidence_snippet: input.evidence_snippet,
            source_chunk_id: input.source_chunk_id,
            source_paragraph_id: input.source_paragraph_id,
            confidence,
            superseded_by: None,
            created_at: now,
        })
    }

    /// Store a batch in order. Later entries supersede earlier ones when
    /// keys repeat within the batch.
    pub fn store_facts(
        &self,
        inputs: Vec<FactInput>,
        block_id: &str,
    ) -> Result<Vec<Fact>, HmlrError> {
        let mut stored = Vec::with_capacity(inputs.len());
        for input in inputs {
            stored.push(self.store_fact(input, block_id)?);
        }
        Ok(stored)
    }

    /// Soft-delete: insert a `[DELETED]` successor and link the target to
    /// it. Idempotent on rows that are already superseded.
    pub fn remove_fact(&self, fact_id: &str) -> Result<Option<Fact>, HmlrError> {
        let Some(target) = self.get_fact_by_id(fact_id)? else {
            return Ok(None);
        };
        if target.superseded_by.is_some() {
            return Ok(Some(target));
        }
        let tombstone = self.store_fact(
            FactInput {
                key: target.key.clone(),
                value: DELETED_FACT_VALUE.into(),
                category: target.category,
                turn_id: target.turn_id.clone(),
                ..Default::default()
            },
            &target.block_id,
        )?;
        Ok(Some(tombstone))
    }

    /// Patch `block_id` for every fact carrying the given `turn_id`. Used
    /// after routing resolves facts extracted before a block existed.
    pub fn update_facts_block_id(&self, turn_id: &str, block_id: &str) -> Result<usize, HmlrError> {
        let n = self.conn()?.execute(
            "UPDATE facts SET block_id = ?1 WHERE turn_id = ?2",
            params![block_id, turn_id],
        )?;
        Ok(n)
    }

    /// Full supersession history of a key, oldest first.
    pub fn fact_history(&self, key: &str) -> Result<Vec<Fact>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts WHERE key = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([key], row_to_fact)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Live rows for a key — more than one means the supersession chain is
    /// broken (invariant violation).
    pub fn live_fact_count(&self, key: &str) -> Result<i64, HmlrError> {
        let conn = self.conn()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE key = ?1 AND superseded_by IS NULL",
            [key],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Live facts, newest first, paginated.
    pub fn list_facts(&self, limit: usize, offset: usize) -> Result<Vec<Fact>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts WHERE superseded_by IS NULL \
             ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
#[path = "facts_tests.rs"]
mod tests;
