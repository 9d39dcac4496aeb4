pub mod ai;
pub mod api;
pub mod chat;
pub mod chunker;
pub mod compressor;
pub mod config;
pub mod db;
pub mod error;
pub mod evict;
pub mod governor;
pub mod hydrator;
pub mod prompts;
pub mod retrieval;
pub mod scribe;
pub mod shift;
pub mod thresholds;
pub mod util;

use std::sync::Arc;

pub type SharedDB = Arc<db::HmlrDB>;

/// Run a blocking DB operation on tokio's blocking thread pool.
///
/// All synchronous store calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<F, T>(db: &SharedDB, f: F) -> Result<T, error::HmlrError>
where
    F: FnOnce(&db::HmlrDB) -> T + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| error::HmlrError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDB,
    pub ai: Option<ai::AiConfig>,
    pub cfg: config::HmlrConfig,
    pub api_key: Option<String>,
    pub embed_cache: EmbedCache,
    pub scribe_tx: Option<tokio::sync::mpsc::UnboundedSender<()>>,
    pub started_at: std::time::Instant,
}

use lru::LruCache;
use std::num::NonZeroUsize;

/// LRU cache for query embeddings, write-through to the persistent
/// `embed_cache` table so restarts keep their hits.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<EmbedCacheInner>>,
    db: Option<SharedDB>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner {
                cache: LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap()),
                ),
                hits: 0,
                misses: 0,
            })),
            db: None,
        }
    }

    /// Create and warm from the persistent cache table.
    pub fn with_db(capacity: usize, db: &SharedDB) -> Self {
        let entries = db.embed_cache_load_all();
        let loaded = entries.len();
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap());
        let mut cache = LruCache::new(cap);
        for (q, emb) in entries {
            cache.put(q, emb);
        }
        if loaded > 0 {
            tracing::info!(loaded, "embed cache warmed from db");
        }
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner { cache, hits: 0, misses: 0 })),
            db: Some(db.clone()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        if let Some(ref db) = self.db {
            db.embed_cache_put(&key, &value);
        }
        let mut inner = self.inner.lock();
        inner.cache.put(key, value);
    }

    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.cache.cap().get(), inner.hits, inner.misses)
    }
}
