//! Usage accounting: per-item retrieval stats, topic affinity, and LLM
//! call bookkeeping.

use rusqlite::params;
use serde::Serialize;

use super::*;

#[derive(Debug, Default, Serialize)]
pub struct StoreStats {
    pub blocks: i64,
    pub active_blocks: i64,
    pub turns: i64,
    pub facts: i64,
    pub live_facts: i64,
    pub memories: i64,
    pub chunks: i64,
    pub lineage_edges: i64,
}

impl HmlrDB {
    /// Bump an item's usage stat, creating the row on first use. `topic`
    /// accumulates into the deduped topics list when present.
    pub fn bump_usage(
        &self,
        item_id: &str,
        item_type: &str,
        topic: Option<&str>,
    ) -> Result<(), HmlrError> {
        let now = now_ms();
        let conn = self.conn()?;
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT usage_count, topics FROM usage_stats WHERE item_id = ?1",
                [item_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .ok();

        match existing {
            Some((count, topics_raw)) => {
                let mut topics = from_json(&topics_raw);
                if let Some(t) = topic {
                    let t = t.to_lowercase();
                    if !topics.contains(&t) {
                        topics.push(t);
                    }
                }
                conn.execute(
                    "UPDATE usage_stats SET usage_count = ?1, last_used = ?2, topics = ?3 \
                     WHERE item_id = ?4",
                    params![count + 1, now, to_json(&topics), item_id],
                )?;
            }
            None => {
                let topics: Vec<String> =
                    topic.map(|t| vec![t.to_lowercase()]).unwrap_or_default();
                conn.execute(
                    "INSERT INTO usage_stats (item_id, item_type, usage_count, first_used, last_used, topics) \
                     VALUES (?1, ?2, 1, ?3, ?3, ?4)",
                    params![item_id, item_type, now, to_json(&topics)],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_usage(&self, item_id: &str) -> Result<Option<UsageStat>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, item_type, usage_count, first_used, last_used, topics \
             FROM usage_stats WHERE item_id = ?1",
        )?;
        let mut rows = stmt.query_map([item_id], |row| {
            let topics: String = row.get("topics")?;
            Ok(UsageStat {
                item_id: row.get("item_id")?,
                item_type: row.get("item_type")?,
                usage_count: row.get("usage_count")?,
                first_used: row.get("first_used")?,
                last_used: row.get("last_used")?,
                topics: from_json(&topics),
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn top_usage(&self, limit: usize) -> Result<Vec<UsageStat>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, item_type, usage_count, first_used, last_used, topics \
             FROM usage_stats ORDER BY usage_count DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                let topics: String = row.get("topics")?;
                Ok(UsageStat {
                    item_id: row.get("item_id")?,
                    item_type: row.get("item_type")?,
                    usage_count: row.get("usage_count")?,
                    first_used: row.get("first_used")?,
                    last_used: row.get("last_used")?,
                    topics: from_json(&topics),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Add an eviction observation for a topic. Residency time accumulates
    /// and the running average is recomputed. Last-writer-wins is fine
    /// here; drift is benign.
    pub fn update_topic_affinity(
        &self,
        topic: &str,
        added_ts: i64,
        evicted_ts: i64,
    ) -> Result<TopicAffinity, HmlrError> {
        let topic = topic.to_lowercase();
        let residency = (evicted_ts - added_ts).max(0);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO topic_affinity (topic, eviction_count, total_time_in_window, avg_time_in_window) \
             VALUES (?1, 1, ?2, ?2) \
             ON CONFLICT(topic) DO UPDATE SET \
               eviction_count = eviction_count + 1, \
               total_time_in_window = total_time_in_window + ?2, \
               avg_time_in_window = CAST(total_time_in_window + ?2 AS REAL) / (eviction_count + 1)",
            params![topic, residency],
        )?;
        let row = conn.query_row(
            "SELECT topic, eviction_count, total_time_in_window, avg_time_in_window \
             FROM topic_affinity WHERE topic = ?1",
            [topic.as_str()],
            |r| {
                Ok(TopicAffinity {
                    topic: r.get(0)?,
                    eviction_count: r.get(1)?,
                    total_time_in_window: r.get(2)?,
                    avg_time_in_window: r.get(3)?,
                })
            },
        )?;
        Ok(row)
    }

    pub fn get_topic_affinity(&self, topic: &str) -> Result<Option<TopicAffinity>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT topic, eviction_count, total_time_in_window, avg_time_in_window \
             FROM topic_affinity WHERE topic = ?1",
        )?;
        let mut rows = stmt.query_map([topic.to_lowercase()], |r| {
            Ok(TopicAffinity {
                topic: r.get(0)?,
                eviction_count: r.get(1)?,
                total_time_in_window: r.get(2)?,
                avg_time_in_window: r.get(3)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn log_llm_call(
        &self,
        component: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        cached_tokens: u32,
        duration_ms: u64,
    ) -> Result<(), HmlrError> {
        let c = self.conn()?;
        c.execute(
            "INSERT INTO llm_usage (ts, component, model, input_tokens, output_tokens, cached_tokens, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now_ms(),
                component,
                model,
                input_tokens,
                output_tokens,
                cached_tokens,
                duration_ms as i64
            ],
        )?;
        Ok(())
    }

    pub fn store_stats(&self) -> Result<StoreStats, HmlrError> {
        let c = self.conn()?;
        let count = |sql: &str| -> i64 { c.query_row(sql, [], |r| r.get(0)).unwrap_or(0) };
        Ok(StoreStats {
            blocks: count("SELECT COUNT(*) FROM bridge_blocks"),
            active_blocks: count("SELECT COUNT(*) FROM bridge_blocks WHERE status = 'ACTIVE'"),
            turns: count("SELECT COUNT(*) FROM turns"),
            facts: count("SELECT COUNT(*) FROM facts"),
            live_facts: count("SELECT COUNT(*) FROM facts WHERE superseded_by IS NULL"),
            memories: count("SELECT COUNT(*) FROM memories"),
            chunks: count("SELECT COUNT(*) FROM chunks"),
            lineage_edges: count("SELECT COUNT(*) FROM lineage"),
        })
    }

    pub fn llm_usage_daily(&self, days: u32) -> Result<Vec<DailyLlmUsage>, HmlrError> {
        let c = self.conn()?;
        let cutoff = now_ms() - (days as i64 * 86_400_000);
        let mut stmt = c.prepare(
            "SELECT date(ts/1000, 'unixepoch') as d, component, model, \
             COUNT(*) as calls, SUM(input_tokens), SUM(output_tokens), SUM(cached_tokens), \
             AVG(duration_ms) \
             FROM llm_usage WHERE ts >= ?1 \
             GROUP BY d, component, model ORDER BY d DESC, calls DESC",
        )?;
        let rows = stmt
            .query_map([cutoff], |r| {
                Ok(DailyLlmUsage {
                    date: r.get(0)?,
                    component: r.get(1)?,
                    model: r.get(2)?,
                    calls: r.get(3)?,
                    input_tokens: r.get(4)?,
                    output_tokens: r.get(5)?,
                    cached_tokens: r.get(6)?,
                    avg_duration_ms: r.get::<_, f64>(7)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
