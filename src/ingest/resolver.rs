use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::db::EventStore;
use crate::error::Result;

/// Maps upstream competition codes onto known leagues. Fuzzy name matching
/// lives behind this seam; the default only does exact lookups.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn resolve_league(&self, sport: &str, competition_code: &str) -> Result<Option<i64>>;
}

/// Exact (sport, code) lookup against the store, remembering hits.
pub struct StoreResolver {
    store: Arc<dyn EventStore>,
    known: DashMap<(String, String), i64>,
}

impl StoreResolver {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            known: DashMap::new(),
        }
    }
}

#[async_trait]
impl EntityResolver for StoreResolver {
    async fn resolve_league(&self, sport: &str, competition_code: &str) -> Result<Option<i64>> {
        let key = (sport.to_string(), competition_code.trim().to_string());
        if let Some(id) = self.known.get(&key) {
            return Ok(Some(*id));
        }
        let found = self.store.find_league(&key.0, &key.1).await?;
        match found {
            Some(id) => {
                self.known.insert(key, id);
            }
            None => debug!(sport, competition_code, "[RESOLVER] no league for {sport}/{competition_code}"),
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn resolves_known_leagues_only() {
        let store = MemoryStore::new();
        let epl = store.insert_league("football", "EPL");
        let resolver = StoreResolver::new(store.clone());
        assert_eq!(resolver.resolve_league("football", " EPL ").await.unwrap(), Some(epl));
        assert_eq!(resolver.resolve_league("football", "XYZ").await.unwrap(), None);
        assert_eq!(resolver.resolve_league("tennis", "EPL").await.unwrap(), None);
    }
}
