use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend};

#[derive(Debug, Error)]
#[error("Memory cache error: {0}")]
pub struct MemoryCacheError(String);

type Slot<T> = (Arc<CacheEntry<T>>, Option<Instant>);

#[derive(Clone)]
pub struct MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    data: Arc<DashMap<String, Slot<T>>>,
    metrics: CacheMetrics,
}

impl<T> MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    /// Must be called inside a tokio runtime: it spawns the expiry sweeper.
    pub fn new() -> Self {
        let backend = Self {
            data: Arc::new(DashMap::new()),
            metrics: CacheMetrics::new(),
        };
        backend.clone().spawn_cleanup_task();
        backend
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn spawn_cleanup_task(self) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                self.cleanup_expired();
            }
        });
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        let before = self.data.len();
        self.data
            .retain(|_, (_, expiration)| expiration.is_none_or(|exp| now < exp));
        let removed = before.saturating_sub(self.data.len());
        if removed > 0 {
            cyder_tools::log::debug!("Cleaned up {} expired cache entries", removed);
        }
    }
}

#[async_trait]
impl<T> CacheBackend<T> for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error = MemoryCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let hit = self.data.get(key).map(|slot| {
            let (value, expiration) = slot.value();
            (value.clone(), *expiration)
        });
        match hit {
            Some((_, Some(exp))) if Instant::now() >= exp => {
                self.data.remove(key);
                self.metrics.record_miss();
                Ok(None)
            }
            Some((value, _)) => {
                self.metrics.record_hit();
                Ok(Some(value))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let expiration = ttl.map(|d| Instant::now() + d);
        self.data.insert(key.to_string(), (value, expiration));
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.data.remove(key);
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.data.clear();
        cyder_tools::log::info!("In-memory cache cleared.");
        Ok(())
    }
}

impl<T> Default for MemoryCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
