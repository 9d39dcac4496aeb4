//! Scribe job outbox and synthesis rows (day/week digests, user profile).

use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisKind {
    Day,
    Week,
    Profile,
}

impl SynthesisKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SynthesisKind::Day => "day",
            SynthesisKind::Week => "week",
            SynthesisKind::Profile => "profile",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Synthesis {
    pub id: String,
    pub kind: SynthesisKind,
    pub period_key: String,
    pub content: String,
    pub source_ids: Vec<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScribeJob {
    pub id: i64,
    pub user_id: String,
    pub turn_id: String,
    pub status: String,
    pub created_at: i64,
}

impl HmlrDB {
    /// Enqueue a scribe job. Written right after the turn append so a
    /// crash between the two loses at most the one job the caller retries.
    pub fn enqueue_scribe_job(&self, user_id: &str, turn_id: &str) -> Result<i64, HmlrError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scribe_jobs (user_id, turn_id, status, created_at) \
             VALUES (?1, ?2, 'queued', ?3)",
            params![user_id, turn_id, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim up to `limit` queued jobs, oldest first.
    pub fn claim_scribe_jobs(&self, limit: usize) -> Result<Vec<ScribeJob>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, turn_id, status, created_at FROM scribe_jobs \
             WHERE status = 'queued' ORDER BY id ASC LIMIT ?1",
        )?;
        let jobs = stmt
            .query_map([limit as i64], |r| {
                Ok(ScribeJob {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    turn_id: r.get(2)?,
                    status: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn finish_scribe_job(&self, id: i64, ok: bool) -> Result<(), HmlrError> {
        self.conn()?.execute(
            "UPDATE scribe_jobs SET status = ?1 WHERE id = ?2",
            params![if ok { "done" } else { "failed" }, id],
        )?;
        Ok(())
    }

    /// Upsert a synthesis for `(kind, period_key)` — reruns overwrite.
    pub fn put_synthesis(
        &self,
        kind: SynthesisKind,
        period_key: &str,
        content: &str,
        source_ids: &[String],
    ) -> Result<Synthesis, HmlrError> {
        let now = now_ms();
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM syntheses WHERE kind = ?1 AND period_key = ?2",
                params![kind.as_str(), period_key],
                |r| r.get(0),
            )
            .ok();
        let id = existing
            .unwrap_or_else(|| format!("syn_{}_{}", now, &Uuid::new_v4().to_string()[..8]));
        conn.execute(
            "INSERT OR REPLACE INTO syntheses (id, kind, period_key, content, source_ids, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, kind.as_str(), period_key, content, to_json(source_ids), now],
        )?;
        Ok(Synthesis {
            id,
            kind,
            period_key: period_key.to_string(),
            content: content.to_string(),
            source_ids: source_ids.to_vec(),
            created_at: now,
        })
    }

    pub fn get_synthesis(
        &self,
        kind: SynthesisKind,
        period_key: &str,
    ) -> Result<Option<Synthesis>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, period_key, content, source_ids, created_at FROM syntheses \
             WHERE kind = ?1 AND period_key = ?2",
        )?;
        let mut rows = stmt.query_map(params![kind.as_str(), period_key], |r| {
            let source_ids: String = r.get(3)?;
            Ok(Synthesis {
                id: r.get(0)?,
                kind,
                period_key: r.get(1)?,
                content: r.get(2)?,
                source_ids: from_json(&source_ids),
                created_at: r.get(4)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Most recent syntheses of a kind, newest period first.
    pub fn recent_syntheses(
        &self,
        kind: SynthesisKind,
        limit: usize,
    ) -> Result<Vec<Synthesis>, HmlrError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, period_key, content, source_ids, created_at FROM syntheses \
             WHERE kind = ?1 ORDER BY period_key DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str(), limit as i64], |r| {
                let source_ids: String = r.get(3)?;
                Ok(Synthesis {
                    id: r.get(0)?,
                    kind,
                    period_key: r.get(1)?,
                    content: r.get(2)?,
                    source_ids: from_json(&source_ids),
                    created_at: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The current user-profile paragraph, if the scribe has produced one.
    pub fn current_profile(&self) -> Result<Option<String>, HmlrError> {
        Ok(self
            .recent_syntheses(SynthesisKind::Profile, 1)?
            .into_iter()
            .next()
            .map(|s| s.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> HmlrDB {
        HmlrDB::open(":memory:").expect("in-memory db")
    }

    #[test]
    fn scribe_jobs_claimed_oldest_first() {
        let db = test_db();
        db.enqueue_scribe_job("default", "turn_1").unwrap();
        db.enqueue_scribe_job("default", "turn_2").unwrap();
        db.enqueue_scribe_job("default", "turn_3").unwrap();

        let jobs = db.claim_scribe_jobs(2).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].turn_id, "turn_1");
        assert_eq!(jobs[1].turn_id, "turn_2");

        db.finish_scribe_job(jobs[0].id, true).unwrap();
        db.finish_scribe_job(jobs[1].id, false).unwrap();

        // Only the untouched job stays queued.
        let remaining = db.claim_scribe_jobs(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].turn_id, "turn_3");
    }

    #[test]
    fn synthesis_upsert_overwrites_period() {
        let db = test_db();
        db.put_synthesis(SynthesisKind::Day, "2026-08-01", "first draft", &[]).unwrap();
        let second = db
            .put_synthesis(SynthesisKind::Day, "2026-08-01", "revised", &["blk_1".into()])
            .unwrap();

        let got = db.get_synthesis(SynthesisKind::Day, "2026-08-01").unwrap().expect("row");
        assert_eq!(got.id, second.id);
        assert_eq!(got.content, "revised");
        assert_eq!(got.source_ids, vec!["blk_1"]);
        assert_eq!(db.recent_syntheses(SynthesisKind::Day, 10).unwrap().len(), 1);
    }

    #[test]
    fn profile_reads_latest() {
        let db = test_db();
        assert!(db.current_profile().unwrap().is_none());
        db.put_synthesis(SynthesisKind::Profile, "current", "terse profile", &[]).unwrap();
        assert_eq!(db.current_profile().unwrap().as_deref(), Some("terse profile"));
    }

    #[test]
    fn recent_syntheses_newest_period_first() {
        let db = test_db();
        db.put_synthesis(SynthesisKind::Day, "2026-07-30", "a", &[]).unwrap();
        db.put_synthesis(SynthesisKind::Day, "2026-08-01", "c", &[]).unwrap();
        db.put_synthesis(SynthesisKind::Day, "2026-07-31", "b", &[]).unwrap();

        let recent = db.recent_syntheses(SynthesisKind::Day, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].period_key, "2026-08-01");
        assert_eq!(recent[1].period_key, "2026-07-31");
    }
}
