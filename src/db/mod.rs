//! SQLite-backed store for blocks, turns, facts, memories, chunks, and
//! lineage, with an in-memory vector index for semantic search.

mod blocks;
mod chunks;
mod facts;
mod lineage;
mod memories;
mod stats;
mod synth;
mod turns;
mod vec;

use std::sync::RwLock;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::HmlrError;
use crate::thresholds;

pub use blocks::BlockMetadataPatch;
pub use stats::StoreStats;
pub use synth::{ScribeJob, Synthesis, SynthesisKind};

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY under concurrent write pressure (eviction + API).
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_MESSAGE_LEN: usize = 32_768;

/// Topic container status. At most one block is ACTIVE at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockStatus {
    Active,
    Paused,
    Closed,
}

impl BlockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockStatus::Active => "ACTIVE",
            BlockStatus::Paused => "PAUSED",
            BlockStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, HmlrError> {
        match s {
            "ACTIVE" => Ok(BlockStatus::Active),
            "PAUSED" => Ok(BlockStatus::Paused),
            "CLOSED" => Ok(BlockStatus::Closed),
            other => Err(HmlrError::Validation(format!("unknown block status: {other}"))),
        }
    }
}

/// Bridge block — topic-scoped container for a contiguous run of turns
/// within a day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeBlock {
    pub id: String,
    pub day_id: String,
    pub topic_label: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub status: BlockStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_block_id: Option<String>,
    pub open_loops: Vec<String>,
    pub decisions_made: Vec<String>,
    pub turn_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Lightweight projection of a block for the router prompt.
#[derive(Debug, Clone, Serialize)]
pub struct BlockMetadata {
    pub id: String,
    pub topic_label: String,
    pub status: BlockStatus,
    pub summary: String,
    pub keywords: Vec<String>,
    pub turn_count: i64,
    pub updated_at: i64,
    /// True for the block with the greatest `updated_at` in the day
    /// (ties broken by descending id).
    pub is_last_active: bool,
}

/// One user/assistant exchange. Immutable after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub block_id: String,
    pub user_message: String,
    pub ai_response: String,
    pub keywords: Vec<String>,
    pub affect: String,
    pub timestamp: i64,
}

impl Turn {
    /// Rough token estimate used by the space-eviction policy.
    pub fn token_estimate(&self) -> usize {
        (self.user_message.len() + self.ai_response.len()).div_ceil(4)
    }
}

/// Fact categories. `general` is the catch-all for uncategorized keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Credential,
    Preference,
    Policy,
    Decision,
    Contact,
    Date,
    General,
}

impl FactCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FactCategory::Credential => "credential",
            FactCategory::Preference => "preference",
            FactCategory::Policy => "policy",
            FactCategory::Decision => "decision",
            FactCategory::Contact => "contact",
            FactCategory::Date => "date",
            FactCategory::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential" => Some(Self::Credential),
            "preference" => Some(Self::Preference),
            "policy" => Some(Self::Policy),
            "decision" => Some(Self::Decision),
            "contact" => Some(Self::Contact),
            "date" => Some(Self::Date),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

/// Keyed assertion with provenance, subject to supersession.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<FactCategory>,
    pub block_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_paragraph_id: Option<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub created_at: i64,
}

impl Fact {
    pub fn is_deleted(&self) -> bool {
        self.value == thresholds::DELETED_FACT_VALUE
    }
}

/// Input for storing a fact. Provenance fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactInput {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub category: Option<FactCategory>,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub evidence_snippet: Option<String>,
    #[serde(default)]
    pub source_chunk_id: Option<String>,
    #[serde(default)]
    pub source_paragraph_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Embedded text unit for semantic recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRow {
    pub id: String,
    pub turn_id: String,
    pub block_id: String,
    pub content: String,
    pub chunk_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

/// Hierarchical, immutable sub-unit of a turn's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Sentence,
    Paragraph,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Sentence => "sentence",
            ChunkType::Paragraph => "paragraph",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub chunk_type: ChunkType,
    pub text_verbatim: String,
    pub lexical_filters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chunk_id: Option<String>,
    pub turn_id: String,
    /// Null until routing assigns the turn to a block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub token_count: i64,
    pub created_at: i64,
}

/// Per-item retrieval accounting.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStat {
    pub item_id: String,
    pub item_type: String,
    pub usage_count: i64,
    pub first_used: i64,
    pub last_used: i64,
    pub topics: Vec<String>,
}

/// Directed derivation edge. The lineage table forms a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEdge {
    pub item_id: String,
    pub item_type: String,
    pub derived_from: Vec<String>,
    pub derived_by: String,
    pub created_at: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct LineageIntegrity {
    pub valid: bool,
    pub orphaned_items: Vec<String>,
    pub broken_references: Vec<String>,
}

/// Per-topic residency accounting maintained by the eviction policies.
#[derive(Debug, Clone, Serialize)]
pub struct TopicAffinity {
    pub topic: String,
    pub eviction_count: i64,
    pub total_time_in_window: i64,
    pub avg_time_in_window: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyLlmUsage {
    pub date: String,
    pub component: String,
    pub model: String,
    pub calls: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub avg_duration_ms: u64,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

/// UTC calendar date (`YYYY-MM-DD`) for an epoch-millisecond timestamp.
pub fn day_id_from_ms(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

pub fn today_day_id() -> String {
    day_id_from_ms(now_ms())
}

/// ISO-8601 UTC rendering used by the hydrator's turn formatting.
pub fn iso_from_ms(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

fn to_json(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".into())
}

fn from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bridge_blocks (
    id TEXT PRIMARY KEY,
    day_id TEXT NOT NULL,
    topic_label TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    keywords TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    prev_block_id TEXT,
    open_loops TEXT NOT NULL DEFAULT '[]',
    decisions_made TEXT NOT NULL DEFAULT '[]',
    turn_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blocks_day ON bridge_blocks(day_id);
CREATE INDEX IF NOT EXISTS idx_blocks_status ON bridge_blocks(status);
CREATE INDEX IF NOT EXISTS idx_blocks_day_status ON bridge_blocks(day_id, status);
CREATE INDEX IF NOT EXISTS idx_blocks_updated ON bridge_blocks(updated_at);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    block_id TEXT NOT NULL,
    user_message TEXT NOT NULL,
    ai_response TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    affect TEXT NOT NULL DEFAULT 'neutral',
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_turns_block ON turns(block_id);
CREATE INDEX IF NOT EXISTS idx_turns_timestamp ON turns(timestamp);

CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    category TEXT,
    block_id TEXT NOT NULL,
    turn_id TEXT,
    evidence_snippet TEXT,
    source_chunk_id TEXT,
    source_paragraph_id TEXT,
    confidence REAL NOT NULL DEFAULT 1.0,
    superseded_by TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_facts_key ON facts(key);
CREATE INDEX IF NOT EXISTS idx_facts_block ON facts(block_id);
CREATE INDEX IF NOT EXISTS idx_facts_category ON facts(category);
CREATE INDEX IF NOT EXISTS idx_facts_created ON facts(created_at);
CREATE INDEX IF NOT EXISTS idx_facts_chunk ON facts(source_chunk_id);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    turn_id TEXT NOT NULL,
    block_id TEXT NOT NULL,
    content TEXT NOT NULL,
    chunk_index INTEGER NOT NULL DEFAULT 0,
    embedding BLOB,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_turn ON memories(turn_id);
CREATE INDEX IF NOT EXISTS idx_memories_block ON memories(block_id);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    chunk_type TEXT NOT NULL,
    text_verbatim TEXT NOT NULL,
    lexical_filters TEXT NOT NULL DEFAULT '[]',
    parent_chunk_id TEXT,
    turn_id TEXT NOT NULL,
    block_id TEXT,
    embedding BLOB,
    token_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_turn ON chunks(turn_id);
CREATE INDEX IF NOT EXISTS idx_chunks_block ON chunks(block_id);

CREATE TABLE IF NOT EXISTS usage_stats (
    item_id TEXT PRIMARY KEY,
    item_type TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    first_used INTEGER NOT NULL,
    last_used INTEGER NOT NULL,
    topics TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_usage_count ON usage_stats(usage_count);

CREATE TABLE IF NOT EXISTS lineage (
    item_id TEXT PRIMARY KEY,
    item_type TEXT NOT NULL,
    derived_from TEXT NOT NULL DEFAULT '[]',
    derived_by TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lineage_type ON lineage(item_type);

CREATE TABLE IF NOT EXISTS topic_affinity (
    topic TEXT PRIMARY KEY,
    eviction_count INTEGER NOT NULL DEFAULT 0,
    total_time_in_window INTEGER NOT NULL DEFAULT 0,
    avg_time_in_window REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_affinity_evictions ON topic_affinity(eviction_count);

CREATE TABLE IF NOT EXISTS scribe_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL DEFAULT 'default',
    turn_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scribe_status ON scribe_jobs(status);

CREATE TABLE IF NOT EXISTS syntheses (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    period_key TEXT NOT NULL,
    content TEXT NOT NULL,
    source_ids TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_syntheses_kind ON syntheses(kind, period_key);

CREATE TABLE IF NOT EXISTS hmlr_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embed_cache (
    query TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS llm_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    component TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cached_tokens INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_llm_usage_ts ON llm_usage(ts);
CREATE INDEX IF NOT EXISTS idx_llm_usage_component ON llm_usage(component);
"#;

/// SQLite-backed store behind a connection pool.
pub struct HmlrDB {
    pool: Pool<SqliteConnectionManager>,
    /// In-memory index over memory embeddings for fast semantic search.
    vec_index: RwLock<vec::VecIndex>,
}

impl HmlrDB {
    fn conn(&self) -> Result<PooledConn, HmlrError> {
        self.pool.get().map_err(|e| HmlrError::Internal(format!("pool: {e}")))
    }

    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, HmlrError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each test gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| HmlrError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| HmlrError::Internal(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA auto_vacuum=INCREMENTAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        if conn.prepare("SELECT source_paragraph_id FROM facts LIMIT 0").is_err() {
            conn.execute("ALTER TABLE facts ADD COLUMN source_paragraph_id TEXT", [])?;
        }
        if conn.prepare("SELECT prev_block_id FROM bridge_blocks LIMIT 0").is_err() {
            conn.execute("ALTER TABLE bridge_blocks ADD COLUMN prev_block_id TEXT", [])?;
        }
        drop(conn);

        let db = Self { pool, vec_index: RwLock::new(vec::VecIndex::new()) };
        db.load_vec_index();
        Ok(db)
    }

    /// Database file size in bytes (via SQLite pragma).
    pub fn db_size_bytes(&self) -> i64 {
        self.conn()
            .and_then(|c| {
                c.query_row(
                    "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
                    [],
                    |r| r.get(0),
                )
                .map_err(|e| HmlrError::Internal(e.to_string()))
            })
            .unwrap_or(0)
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT value FROM hmlr_meta WHERE key = ?1", [key], |r| r.get(0)).ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), HmlrError> {
        let c = self.conn()?;
        c.execute(
            "INSERT OR REPLACE INTO hmlr_meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }
}

pub(crate) fn validate_message(msg: &str) -> Result<(), HmlrError> {
    let trimmed = msg.trim();
    if trimmed.is_empty() {
        return Err(HmlrError::EmptyMessage);
    }
    if trimmed.chars().count() > MAX_MESSAGE_LEN {
        return Err(HmlrError::Validation("message exceeds maximum length".into()));
    }
    Ok(())
}

#[cfg(test)]
mod meta_tests {
    use super::*;

    #[test]
    fn meta_get_set() {
        let db = HmlrDB::open(":memory:").unwrap();
        assert_eq!(db.get_meta("nonexistent"), None);
        db.set_meta("last_sweep_ms", "1234567890").unwrap();
        assert_eq!(db.get_meta("last_sweep_ms"), Some("1234567890".to_string()));
        db.set_meta("last_sweep_ms", "9999999999").unwrap();
        assert_eq!(db.get_meta("last_sweep_ms"), Some("9999999999".to_string()));
    }

    #[test]
    fn day_id_formats_utc() {
        // 2024-03-05T12:00:00Z
        assert_eq!(day_id_from_ms(1_709_640_000_000), "2024-03-05");
    }

    #[test]
    fn iso_formats_utc() {
        assert_eq!(iso_from_ms(1_709_640_000_000), "2024-03-05T12:00:00Z");
    }
}
