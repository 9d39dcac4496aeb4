//! Derivation edges between items. The table must stay a DAG; traversal
//! uses explicit BFS with a visited set.

use std::collections::{HashSet, VecDeque};

use rusqlite::params;

use super::*;

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<LineageEdge> {
    let derived_from: String = row.get("derived_from")?;
    Ok(LineageEdge {
        item_id: row.get("item_id")?,
        item_type: row.get("item_type")?,
        derived_from: from_json(&derived_from),
        derived_by: row.get("derived_by")?,
        created_at: row.get("created_at")?,
    })
}

const EDGE_COLS: &str = "item_id, item_type, derived_from, derived_by, created_at";

const MAX_TRAVERSAL_DEPTH: usize = 10;

impl HmlrDB {
    /// Upsert the derivation record for an item.
    pub fn record_lineage(
        &self,
        item_id: &str,
        item_type: &str,
        derived_from: &[String],
        derived_by: &str,
    ) -> Result<(), HmlrError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO lineage (item_id, item_type, derived_from, derived_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![item_id, item_type, to_json(derived_from), derived_by, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_lineage(&self, item_id: &str) -> Result<Option<LineageEdge>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {EDGE_COLS} FROM lineage WHERE item_id = ?1"))?;
        let mut rows = stmt.query_map([item_id], row_to_edge)?;
        Ok(rows.next().transpose()?)
    }

    /// BFS up the `derived_from` edges. Depth caps at `max_depth`
    /// (clamped to 10); a visited set breaks any accidental cycle.
    pub fn lineage_ancestors(
        &self,
        item_id: &str,
        max_depth: usize,
    ) -> Result<Vec<LineageEdge>, HmlrError> {
        let max_depth = max_depth.clamp(1, MAX_TRAVERSAL_DEPTH);
        let mut out = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(item_id.to_string());
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        frontier.push_back((item_id.to_string(), 0));

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(edge) = self.get_lineage(&current)? else {
                continue;
            };
            for parent in &edge.derived_from {
                if visited.insert(parent.clone()) {
                    if let Some(parent_edge) = self.get_lineage(parent)? {
                        out.push(parent_edge);
                    }
                    frontier.push_back((parent.clone(), depth + 1));
                }
            }
        }
        Ok(out)
    }

    /// BFS down: items whose `derived_from` contains the target,
    /// transitively. Scans the lineage table level by level.
    pub fn lineage_descendants(
        &self,
        item_id: &str,
        max_depth: usize,
    ) -> Result<Vec<LineageEdge>, HmlrError> {
        let max_depth = max_depth.clamp(1, MAX_TRAVERSAL_DEPTH);
        let all = self.all_lineage()?;
        let mut out = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(item_id.to_string());
        let mut frontier: Vec<String> = vec![item_id.to_string()];

        for _ in 0..max_depth {
            let mut next = Vec::new();
            for edge in &all {
                if edge.derived_from.iter().any(|p| frontier.contains(p))
                    && visited.insert(edge.item_id.clone())
                {
                    out.push(edge.clone());
                    next.push(edge.item_id.clone());
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(out)
    }

    fn all_lineage(&self) -> Result<Vec<LineageEdge>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {EDGE_COLS} FROM lineage"))?;
        let rows = stmt.query_map([], row_to_edge)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Integrity sweep: orphans are root rows nothing derives from;
    /// broken references are parents that do not resolve inside the
    /// lineage table (legitimate for cross-table ids — callers interpret).
    pub fn lineage_integrity(&self) -> Result<LineageIntegrity, HmlrError> {
        let all = self.all_lineage()?;
        let ids: HashSet<&str> = all.iter().map(|e| e.item_id.as_str()).collect();
        let referenced: HashSet<&str> =
            all.iter().flat_map(|e| e.derived_from.iter().map(String::as_str)).collect();

        let orphaned_items: Vec<String> = all
            .iter()
            .filter(|e| e.derived_from.is_empty() && !referenced.contains(e.item_id.as_str()))
            .map(|e| e.item_id.clone())
            .collect();

        let mut broken_references: Vec<String> = referenced
            .iter()
            .filter(|p| !ids.contains(**p))
            .map(|p| p.to_string())
            .collect();
        broken_references.sort();

        Ok(LineageIntegrity {
            valid: orphaned_items.is_empty() && broken_references.is_empty(),
            orphaned_items,
            broken_references,
        })
    }
}

#[cfg(test)]
#[path = "lineage_tests.rs"]
mod tests;
