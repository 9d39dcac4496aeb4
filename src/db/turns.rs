//! Turn storage. Turns are immutable after append; the append bumps the
//! owning block's turn count in the same transaction.

use rusqlite::params;

use super::*;

fn row_to_turn(row: &rusqlite::Row) -> rusqlite::Result<Turn> {
    let keywords: String = row.get("keywords")?;
    Ok(Turn {
        id: row.get("id")?,
        block_id: row.get("block_id")?,
        user_message: row.get("user_message")?,
        ai_response: row.get("ai_response")?,
        keywords: from_json(&keywords),
        affect: row.get("affect")?,
        timestamp: row.get("timestamp")?,
    })
}

const TURN_COLS: &str = "id, block_id, user_message, ai_response, keywords, affect, timestamp";

impl HmlrDB {
    /// Append a turn to a block, incrementing the block's `turn_count` and
    /// bumping `updated_at` atomically.
    pub fn append_turn(
        &self,
        turn_id: &str,
        block_id: &str,
        user_message: &str,
        ai_response: &str,
        keywords: &[String],
        affect: &str,
    ) -> Result<Turn, HmlrError> {
        validate_message(user_message)?;
        let now = now_ms();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO turns (id, block_id, user_message, ai_response, keywords, affect, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![turn_id, block_id, user_message, ai_response, to_json(keywords), affect, now],
        )?;
        let n = tx.execute(
            "UPDATE bridge_blocks SET turn_count = turn_count + 1, updated_at = ?1 WHERE id = ?2",
            params![now, block_id],
        )?;
        if n == 0 {
            return Err(HmlrError::Validation(format!("unknown block: {block_id}")));
        }
        tx.commit()?;

        Ok(Turn {
            id: turn_id.to_string(),
            block_id: block_id.to_string(),
            user_message: user_message.to_string(),
            ai_response: ai_response.to_string(),
            keywords: keywords.to_vec(),
            affect: affect.to_string(),
            timestamp: now,
        })
    }

    pub fn get_turn(&self, id: &str) -> Result<Option<Turn>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {TURN_COLS} FROM turns WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], row_to_turn)?;
        Ok(rows.next().transpose()?)
    }

    /// Turns for a block, chronological.
    pub fn turns_by_block(&self, block_id: &str) -> Result<Vec<Turn>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TURN_COLS} FROM turns WHERE block_id = ?1 ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map([block_id], row_to_turn)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All turns belonging to a day's blocks, oldest first. The working set
    /// the eviction policies operate on.
    pub fn turns_by_day(&self, day_id: &str) -> Result<Vec<Turn>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT t.{} FROM turns t \
             JOIN bridge_blocks b ON t.block_id = b.id \
             WHERE b.day_id = ?1 ORDER BY t.timestamp ASC, t.id ASC",
            TURN_COLS.replace(", ", ", t.")
        ))?;
        let rows = stmt.query_map([day_id], row_to_turn)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove an evicted turn from the window and decrement the block count.
    /// The turn's memories and chunks stay; only window residency ends.
    pub fn evict_turn(&self, turn_id: &str) -> Result<Option<Turn>, HmlrError> {
        let Some(turn) = self.get_turn(turn_id)? else {
            return Ok(None);
        };
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM turns WHERE id = ?1", params![turn_id])?;
        tx.execute(
            "UPDATE bridge_blocks SET turn_count = turn_count - 1, updated_at = ?1 \
             WHERE id = ?2 AND turn_count > 0",
            params![now_ms(), turn.block_id],
        )?;
        tx.commit()?;
        Ok(Some(turn))
    }

    /// Turns whose keyword sets overlap `keywords`, excluding `skip_block`.
    /// Candidates for rehydration, newest first.
    pub fn turns_matching_keywords(
        &self,
        keywords: &[String],
        skip_block: Option<&str>,
    ) -> Result<Vec<Turn>, HmlrError> {
        if keywords.is_empty() {
            return Ok(vec![]);
        }
        let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {TURN_COLS} FROM turns ORDER BY timestamp DESC, id DESC"))?;
        let rows = stmt.query_map([], row_to_turn)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|t| skip_block.is_none_or(|b| t.block_id != b))
            .filter(|t| {
                t.keywords.iter().any(|k| lowered.iter().any(|l| l == &k.to_lowercase()))
            })
            .collect())
    }
}
