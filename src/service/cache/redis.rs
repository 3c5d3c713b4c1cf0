use async_trait::async_trait;
use bb8_redis::bb8;
use bb8_redis::redis::{self, AsyncCommands, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend, CacheError};
use crate::service::redis::RedisPool;

#[derive(Debug, Error)]
pub enum RedisCacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("Codec error: {0}")]
    Codec(#[from] CacheError),
    #[error("Pool error: {0}")]
    Pool(#[from] bb8::RunError<RedisError>),
}

fn encode<T: Clone + Serialize + DeserializeOwned>(entry: &CacheEntry<T>) -> Result<Vec<u8>, CacheError> {
    Ok(bincode::serde::encode_to_vec(entry, bincode::config::standard())?)
}

fn decode<T: Clone + Serialize + DeserializeOwned>(bytes: &[u8]) -> Result<CacheEntry<T>, CacheError> {
    let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(entry)
}

#[derive(Clone)]
pub struct RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    pool: RedisPool,
    metrics: CacheMetrics,
    key_prefix: String,
    _phantom: PhantomData<T>,
}

impl<T> RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    pub fn new(pool: RedisPool, key_prefix: String) -> Self {
        Self {
            pool,
            metrics: CacheMetrics::new(),
            key_prefix,
            _phantom: PhantomData,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl<T> CacheBackend<T> for RedisCacheBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    type Error = RedisCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let mut conn = self.pool.get().await?;
        let raw: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        match raw {
            Some(bytes) => {
                self.metrics.record_hit();
                Ok(Some(Arc::new(decode(&bytes)?)))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let bytes = encode(&value)?;
        let mut conn = self.pool.get().await?;
        let full_key = self.full_key(key);
        match ttl {
            // SETEX rejects a zero expiry.
            Some(ttl) => conn.set_ex::<_, _, ()>(full_key, bytes, ttl.as_secs().max(1)).await?,
            None => conn.set::<_, _, ()>(full_key, bytes).await?,
        }
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(self.full_key(key)).await?;
        self.metrics.record_delete();
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{}*", self.key_prefix);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        if !keys.is_empty() {
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.del(key);
            }
            pipe.query_async::<()>(&mut *conn).await?;
            cyder_tools::log::info!(
                "Cleared {} keys from Redis cache with prefix '{}'",
                keys.len(),
                self.key_prefix
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_survive_the_wire_codec() {
        let positive = CacheEntry::Positive(Arc::new(vec![1i64, 2, 3]));
        let bytes = encode(&positive).unwrap();
        assert_eq!(decode::<Vec<i64>>(&bytes).unwrap(), positive);

        let negative: CacheEntry<Vec<i64>> = CacheEntry::Negative;
        let bytes = encode(&negative).unwrap();
        assert_eq!(decode::<Vec<i64>>(&bytes).unwrap(), CacheEntry::Negative);
    }
}
