use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{MARKET_TYPE_BACKOFF_MS, MARKET_TYPE_RETRIES};
use crate::db::{with_retry, MarketTypeStore};
use crate::error::{AppError, Result};
use crate::types::{MarketFamily, MarketType};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryMetrics {
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub cached: usize,
}

#[derive(Default)]
struct Cache {
    by_code: HashMap<String, MarketType>,
    by_id: HashMap<i64, MarketType>,
}

impl Cache {
    fn insert(&mut self, mt: MarketType) {
        self.by_id.insert(mt.id, mt.clone());
        self.by_code.insert(mt.code.clone(), mt);
    }
}

/// Read-mostly cache of market types in front of the store.
///
/// Lookups go cache → store → create. The write lock is only taken to insert,
/// never across an await.
pub struct MarketTypeRegistry {
    store: Arc<dyn MarketTypeStore>,
    cache: RwLock<Cache>,
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    create_retries: u32,
    create_backoff: Duration,
}

impl MarketTypeRegistry {
    pub fn new(store: Arc<dyn MarketTypeStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            created: AtomicU64::new(0),
            create_retries: MARKET_TYPE_RETRIES,
            create_backoff: Duration::from_millis(MARKET_TYPE_BACKOFF_MS),
        }
    }

    /// Warm the cache with every persisted market type. Returns how many were loaded.
    pub async fn preload(&self) -> Result<usize> {
        let all = self.store.load_market_types().await?;
        let n = all.len();
        let mut cache = self.write();
        for mt in all {
            cache.insert(mt);
        }
        info!(count = n, "[REGISTRY] preloaded {n} market types");
        Ok(n)
    }

    /// Resolve a market code to its persisted type, creating it on first sight.
    /// `name` is only used when the type has to be created.
    pub async fn resolve(&self, code: &str, name: &str) -> Result<MarketType> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AppError::NotFound("empty market code".to_string()));
        }

        if let Some(mt) = self.read().by_code.get(code) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(mt.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(mt) = self.store.find_market_type(code).await? {
            debug!(code, id = mt.id, "[REGISTRY] filled {code} from store");
            self.write().insert(mt.clone());
            return Ok(mt);
        }

        let family = MarketFamily::classify(code, name);
        let mt = with_retry(
            "create market type",
            self.create_retries + 1,
            self.create_backoff,
            || self.store.insert_market_type(code, name, family),
        )
        .await
        .map_err(|e| {
            warn!(code, "[REGISTRY] could not create market type {code}: {e}");
            e
        })?;
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(code, id = mt.id, family = %mt.family, "[REGISTRY] created market type {code}");
        self.write().insert(mt.clone());
        Ok(mt)
    }

    /// Cache-only lookup.
    pub fn by_id(&self, id: i64) -> Option<MarketType> {
        self.read().by_id.get(&id).cloned()
    }

    pub fn metrics(&self) -> RegistryMetrics {
        RegistryMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            cached: self.read().by_code.len(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Cache> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Cache> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` inserts with a transient error.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl MarketTypeStore for FlakyStore {
        async fn find_market_type(&self, code: &str) -> Result<Option<MarketType>> {
            self.inner.find_market_type(code).await
        }

        async fn insert_market_type(&self, code: &str, name: &str, family: MarketFamily) -> Result<MarketType> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.insert_market_type(code, name, family).await
        }

        async fn load_market_types(&self) -> Result<Vec<MarketType>> {
            self.inner.load_market_types().await
        }
    }

    #[tokio::test]
    async fn counts_hits_and_misses() {
        let store = MemoryStore::new();
        let registry = MarketTypeRegistry::new(store.clone());

        let first = registry.resolve("1x2", "Match Result").await.unwrap();
        assert_eq!(first.family, MarketFamily::MatchResult);
        let again = registry.resolve("1x2", "Match Result").await.unwrap();
        assert_eq!(first, again);

        let m = registry.metrics();
        assert_eq!((m.hits, m.misses, m.created, m.cached), (1, 1, 1, 1));
        assert_eq!(registry.by_id(first.id), Some(first));
    }

    #[tokio::test]
    async fn preload_turns_lookups_into_hits() {
        let store = MemoryStore::new();
        store.insert_market_type("total", "Total Goals", MarketFamily::OverUnder).await.unwrap();
        let registry = MarketTypeRegistry::new(store.clone());
        assert_eq!(registry.preload().await.unwrap(), 1);

        registry.resolve("total", "Total Goals").await.unwrap();
        assert_eq!(registry.metrics().misses, 0);
        assert_eq!(registry.metrics().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_is_retried() {
        let store = Arc::new(FlakyStore { inner: MemoryStore::new(), failures: AtomicU32::new(2) });
        let registry = MarketTypeRegistry::new(store);
        let mt = registry.resolve("ah", "Asian Handicap").await.unwrap();
        assert_eq!(mt.family, MarketFamily::Handicap);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_gives_up_after_retries() {
        let store = Arc::new(FlakyStore { inner: MemoryStore::new(), failures: AtomicU32::new(3) });
        let registry = MarketTypeRegistry::new(store);
        assert!(registry.resolve("ah", "Asian Handicap").await.is_err());
        assert_eq!(registry.metrics().cached, 0);
    }

    #[tokio::test]
    async fn blank_code_is_rejected() {
        let registry = MarketTypeRegistry::new(MemoryStore::new());
        assert!(matches!(registry.resolve("  ", "x").await, Err(AppError::NotFound(_))));
    }
}
