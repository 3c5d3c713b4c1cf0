use bb8::Pool;
use bb8_redis::{redis, RedisConnectionManager};
use cyder_tools::log::{error, info};
use tokio::sync::OnceCell;

use crate::config::{RedisConfig, CONFIG};

pub type RedisPool = Pool<RedisConnectionManager>;

static POOL: OnceCell<Option<RedisPool>> = OnceCell::const_new();

async fn connect(redis_config: &RedisConfig) -> Result<RedisPool, String> {
    let manager = RedisConnectionManager::new(redis_config.url.as_str())
        .map_err(|e| format!("failed to create redis manager: {}", e))?;
    let pool = Pool::builder()
        .max_size(redis_config.pool_size as u32)
        .build(manager)
        .await
        .map_err(|e| format!("failed to create redis pool: {}", e))?;

    {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| format!("failed to check out redis connection: {}", e))?;
        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| format!("failed to ping redis: {}", e))?;
    }
    Ok(pool)
}

async fn initialize_pool() -> Option<RedisPool> {
    let redis_config = CONFIG.redis.as_ref()?;
    match connect(redis_config).await {
        Ok(pool) => {
            info!("Redis connection pool initialized");
            Some(pool)
        }
        Err(e) => {
            error!("Redis unavailable: {}", e);
            None
        }
    }
}

/// The shared pool, or `None` when redis is not configured or unreachable.
pub async fn get_pool() -> Option<RedisPool> {
    POOL.get_or_init(initialize_pool).await.as_ref().cloned()
}
