//! Bridge block storage: creation, status transitions, metadata merge.
//!
//! The one-ACTIVE invariant is enforced by running every transition that
//! can mint an ACTIVE block inside a single immediate transaction.

use rusqlite::params;

use super::*;
use crate::thresholds::{MAX_BLOCK_KEYWORDS, MAX_BLOCK_LIST_ITEMS};
use crate::util::clip_chars;

fn row_to_block(row: &rusqlite::Row) -> rusqlite::Result<BridgeBlock> {
    let status: String = row.get("status")?;
    let keywords: String = row.get("keywords")?;
    let open_loops: String = row.get("open_loops")?;
    let decisions: String = row.get("decisions_made")?;
    Ok(BridgeBlock {
        id: row.get("id")?,
        day_id: row.get("day_id")?,
        topic_label: row.get("topic_label")?,
        summary: row.get("summary")?,
        keywords: from_json(&keywords),
        status: BlockStatus::parse(&status).unwrap_or(BlockStatus::Paused),
        prev_block_id: row.get("prev_block_id")?,
        open_loops: from_json(&open_loops),
        decisions_made: from_json(&decisions),
        turn_count: row.get("turn_count")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const BLOCK_COLS: &str = "id, day_id, topic_label, summary, keywords, status, prev_block_id, \
     open_loops, decisions_made, turn_count, created_at, updated_at";

/// Merge `incoming` into `existing` as a deduped ordered set, clamped to `cap`.
fn merge_list(existing: &[String], incoming: &[String], cap: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for item in existing.iter().chain(incoming.iter()) {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.iter().any(|x| x.eq_ignore_ascii_case(trimmed)) {
            out.push(trimmed.to_string());
        }
    }
    out.truncate(cap);
    out
}

/// Metadata fields accepted by `update_block_metadata`. Lists merge,
/// summary overwrites.
#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct BlockMetadataPatch {
    #[serde(default)]
    pub topic_label: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub open_loops: Vec<String>,
    #[serde(default)]
    pub decisions_made: Vec<String>,
}

impl HmlrDB {
    /// Create a new ACTIVE block for `day_id`, pausing whichever block was
    /// ACTIVE before. Both writes commit atomically.
    pub fn create_block(
        &self,
        day_id: &str,
        topic_label: &str,
        keywords: &[String],
        prev_block_id: Option<&str>,
    ) -> Result<BridgeBlock, HmlrError> {
        let now = now_ms();
        let id = format!("blk_{}_{}", now, &uuid::Uuid::new_v4().to_string()[..8]);
        let kw = merge_list(&[], keywords, MAX_BLOCK_KEYWORDS);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE bridge_blocks SET status = 'PAUSED', updated_at = ?1 WHERE status = 'ACTIVE'",
            params![now],
        )?;
        tx.execute(
            "INSERT INTO bridge_blocks (id, day_id, topic_label, summary, keywords, status, \
             prev_block_id, open_loops, decisions_made, turn_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, '', ?4, 'ACTIVE', ?5, '[]', '[]', 0, ?6, ?6)",
            params![id, day_id, topic_label, to_json(&kw), prev_block_id, now],
        )?;
        tx.commit()?;

        Ok(BridgeBlock {
            id,
            day_id: day_id.to_string(),
            topic_label: topic_label.to_string(),
            summary: String::new(),
            keywords: kw,
            status: BlockStatus::Active,
            prev_block_id: prev_block_id.map(str::to_string),
            open_loops: vec![],
            decisions_made: vec![],
            turn_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_block(&self, id: &str) -> Result<Option<BridgeBlock>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {BLOCK_COLS} FROM bridge_blocks WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], row_to_block)?;
        Ok(rows.next().transpose()?)
    }

    pub fn blocks_by_day(&self, day_id: &str) -> Result<Vec<BridgeBlock>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLS} FROM bridge_blocks WHERE day_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([day_id], row_to_block)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The ACTIVE block, optionally restricted to one day. Observing more
    /// than one ACTIVE row is an invariant violation and surfaces as such.
    pub fn get_active_block(&self, day_id: Option<&str>) -> Result<Option<BridgeBlock>, HmlrError> {
        let conn = self.conn()?;
        let (sql, day) = match day_id {
            Some(d) => (
                format!(
                    "SELECT {BLOCK_COLS} FROM bridge_blocks WHERE day_id = ?1 AND status = 'ACTIVE'"
                ),
                d,
            ),
            None => (
                format!("SELECT {BLOCK_COLS} FROM bridge_blocks WHERE status = 'ACTIVE'"),
                "",
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<BridgeBlock> = if day_id.is_some() {
            stmt.query_map([day], row_to_block)?.collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map([], row_to_block)?.collect::<Result<Vec<_>, _>>()?
        };
        if rows.len() > 1 {
            let ids: Vec<&str> = rows.iter().map(|b| b.id.as_str()).collect();
            return Err(HmlrError::Invariant(format!(
                "multiple ACTIVE blocks observed: {}",
                ids.join(", ")
            )));
        }
        Ok(rows.into_iter().next())
    }

    /// Router-facing projection of a day's blocks. `is_last_active` marks
    /// the block with the greatest `updated_at`; ties resolve by descending
    /// id so a newer block wins.
    pub fn block_metadata_by_day(&self, day_id: &str) -> Result<Vec<BlockMetadata>, HmlrError> {
        let blocks = self.blocks_by_day(day_id)?;
        let last_active: Option<String> = blocks
            .iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)))
            .map(|b| b.id.clone());
        Ok(blocks
            .into_iter()
            .map(|b| BlockMetadata {
                is_last_active: last_active.as_deref() == Some(b.id.as_str()),
                id: b.id,
                topic_label: b.topic_label,
                status: b.status,
                summary: b.summary,
                keywords: b.keywords,
                turn_count: b.turn_count,
                updated_at: b.updated_at,
            })
            .collect())
    }

    /// Transition a block's status. Promoting to ACTIVE pauses every other
    /// ACTIVE block inside the same transaction.
    pub fn update_block_status(&self, id: &str, status: BlockStatus) -> Result<(), HmlrError> {
        let now = now_ms();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        if status == BlockStatus::Active {
            tx.execute(
                "UPDATE bridge_blocks SET status = 'PAUSED', updated_at = ?1 \
                 WHERE status = 'ACTIVE' AND id != ?2",
                params![now, id],
            )?;
        }
        let n = tx.execute(
            "UPDATE bridge_blocks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        tx.commit()?;
        if n == 0 {
            return Err(HmlrError::NotFound);
        }
        Ok(())
    }

    /// Merge metadata into a block. Keyword/loop/decision lists merge as
    /// deduped ordered sets clamped to their bounds; summary and topic
    /// label overwrite when present.
    pub fn update_block_metadata(
        &self,
        id: &str,
        patch: &BlockMetadataPatch,
    ) -> Result<BridgeBlock, HmlrError> {
        let existing = self.get_block(id)?.ok_or(HmlrError::NotFound)?;
        let keywords = merge_list(&existing.keywords, &patch.keywords, MAX_BLOCK_KEYWORDS);
        let open_loops = merge_list(&existing.open_loops, &patch.open_loops, MAX_BLOCK_LIST_ITEMS);
        let decisions =
            merge_list(&existing.decisions_made, &patch.decisions_made, MAX_BLOCK_LIST_ITEMS);
        let summary = patch.summary.clone().unwrap_or(existing.summary);
        let topic_label = patch.topic_label.clone().unwrap_or(existing.topic_label);
        let now = now_ms();

        self.conn()?.execute(
            "UPDATE bridge_blocks SET topic_label = ?1, summary = ?2, keywords = ?3, \
             open_loops = ?4, decisions_made = ?5, updated_at = ?6 WHERE id = ?7",
            params![
                topic_label,
                summary,
                to_json(&keywords),
                to_json(&open_loops),
                to_json(&decisions),
                now,
                id
            ],
        )?;

        Ok(BridgeBlock {
            topic_label,
            summary,
            keywords,
            open_loops,
            decisions_made: decisions,
            updated_at: now,
            ..existing
        })
    }

    /// Pause a block. If it has no summary yet, synthesize the heuristic
    /// one from its first and last turns.
    pub fn pause_block_with_summary(&self, id: &str) -> Result<BridgeBlock, HmlrError> {
        let block = self.get_block(id)?.ok_or(HmlrError::NotFound)?;
        if block.summary.is_empty() {
            let summary = self.generate_block_summary(id)?;
            if !summary.is_empty() {
                self.update_block_metadata(
                    id,
                    &BlockMetadataPatch { summary: Some(summary), ..Default::default() },
                )?;
            }
        }
        self.update_block_status(id, BlockStatus::Paused)?;
        self.get_block(id)?.ok_or(HmlrError::NotFound)
    }

    /// Heuristic summary from the block's turn span:
    /// `N exchanges. Started with: "…" Ended with: "…"`.
    pub fn generate_block_summary(&self, id: &str) -> Result<String, HmlrError> {
        let turns = self.turns_by_block(id)?;
        let Some(first) = turns.first() else {
            return Ok(String::new());
        };
        if turns.len() == 1 {
            return Ok(format!("1 exchange: \"{}…\"", clip_chars(&first.user_message, 100)));
        }
        let last = turns.last().expect("non-empty");
        Ok(format!(
            "{} exchanges. Started with: \"{}…\" Ended with: \"{}…\"",
            turns.len(),
            clip_chars(&first.user_message, 50),
            clip_chars(&last.user_message, 50)
        ))
    }

    /// Count of ACTIVE blocks (diagnostics; the invariant check surface).
    pub fn active_block_count(&self) -> Result<i64, HmlrError> {
        let conn = self.conn()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM bridge_blocks WHERE status = 'ACTIVE'",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
#[path = "blocks_tests.rs"]
mod tests;
