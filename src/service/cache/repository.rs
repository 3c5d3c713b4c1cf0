use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::{types::CacheEntry, CacheBackend, CacheError};

/// Typed facade over a backend. Cache keys are built by the caller.
pub struct CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    backend: B,
    default_ttl: Option<Duration>,
    _phantom: PhantomData<T>,
}

impl<T, B> CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    pub fn new(backend: B, default_ttl: Option<Duration>) -> Self {
        Self {
            backend,
            default_ttl,
            _phantom: PhantomData,
        }
    }

    /// Raw entry, so callers can tell a negative hit from a miss.
    pub async fn get_entry(&self, cache_key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        self.backend
            .get(cache_key)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn set_positive(&self, cache_key: &str, value: &T) -> Result<(), CacheError> {
        let entry = Arc::new(CacheEntry::Positive(Arc::new(value.clone())));
        self.backend
            .set(cache_key, entry, self.default_ttl)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn set_negative(&self, cache_key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.backend
            .set(cache_key, Arc::new(CacheEntry::Negative), Some(ttl))
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn delete(&self, cache_key: &str) -> Result<(), CacheError> {
        self.backend
            .delete(cache_key)
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend
            .clear()
            .await
            .map_err(|e| CacheError::BackendError(e.to_string()))
    }
}

impl<T, B> Clone for CacheRepository<T, B>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    B: CacheBackend<T>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            default_ttl: self.default_ttl,
            _phantom: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::cache::memory::MemoryCacheBackend;
    use crate::service::cache::types::CacheToken;
    use crate::schema::enum_def::TokenStatus;

    fn cached_token() -> CacheToken {
        CacheToken {
            id: 4,
            user_id: 9,
            name: "ci".to_string(),
            status: TokenStatus::Enabled,
            expired_time: -1,
            remain_quota: 100,
            unlimited_quota: false,
            models: None,
            subnet: None,
        }
    }

    #[tokio::test]
    async fn test_positive_entry_round_trip() {
        let repo = CacheRepository::new(MemoryCacheBackend::new(), None);
        repo.set_positive("token:key:abc", &cached_token()).await.unwrap();

        let entry = repo.get_entry("token:key:abc").await.unwrap().unwrap();
        match &*entry {
            CacheEntry::Positive(token) => assert_eq!(token.id, 4),
            CacheEntry::Negative => panic!("expected a positive entry"),
        }
    }

    #[tokio::test]
    async fn test_negative_entry_is_distinct_from_miss() {
        let repo: CacheRepository<CacheToken, _> = CacheRepository::new(MemoryCacheBackend::new(), None);
        repo.set_negative("token:key:none", Duration::from_secs(60)).await.unwrap();

        let entry = repo.get_entry("token:key:none").await.unwrap();
        assert!(matches!(entry.as_deref(), Some(CacheEntry::Negative)));
        assert!(repo.get_entry("token:key:other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = CacheRepository::new(MemoryCacheBackend::new(), None);
        repo.set_positive("token:key:abc", &cached_token()).await.unwrap();
        repo.delete("token:key:abc").await.unwrap();
        assert!(repo.get_entry("token:key:abc").await.unwrap().is_none());
    }
}
