use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use cyder_tools::log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{CacheBackendType, FinalConfig, CONFIG};
use crate::database::ability::{Ability, AbilityCandidate};
use crate::database::channel::Channel;
use crate::database::token::Token;
use crate::database::user::User;
use crate::database::DbResult;
use crate::schema::enum_def::{ChannelStatus, TokenStatus};
use crate::service::batch::BatchUpdater;
use crate::service::cache::memory::MemoryCacheBackend;
use crate::service::cache::redis::RedisCacheBackend;
use crate::service::cache::repository::CacheRepository;
use crate::service::cache::types::{CacheCandidates, CacheEntry, CacheToken};
use crate::service::cache::CacheError;
use crate::service::distributor::ChannelDistributor;
use crate::service::ledger::{LedgerSettings, QuotaLedger};
use crate::service::monitor::{ChannelMonitor, MonitorSettings};
use crate::service::notify::{HttpTransport, NotificationTransport, Notifier};
use crate::service::redis::{self, RedisPool};
use crate::service::relay::{PassthroughRelay, Relay};
use crate::service::store::{AccountStore, ChannelDirectory, StoreError, TokenStore};
use crate::service::token_auth::TokenAuthenticator;

enum CacheKey<'a> {
    Token(&'a str),
    Channel(i64),
    Candidates(&'a str, &'a str),
    AccountGroup(i64),
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Token(hash) => write!(f, "token:key:{}", hash),
            CacheKey::Channel(id) => write!(f, "channel:id:{}", id),
            CacheKey::Candidates(group, model) => write!(f, "candidates:{}/{}", group, model),
            CacheKey::AccountGroup(id) => write!(f, "account_group:{}", id),
        }
    }
}

#[derive(Clone)]
enum AnyCacheRepo<T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static> {
    Memory(CacheRepository<T, MemoryCacheBackend<T>>),
    Redis(CacheRepository<T, RedisCacheBackend<T>>),
}

impl<T> AnyCacheRepo<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
{
    async fn get_entry(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.get_entry(key).await,
            AnyCacheRepo::Redis(repo) => repo.get_entry(key).await,
        }
    }

    async fn set_positive(&self, key: &str, value: &T) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_positive(key, value).await,
            AnyCacheRepo::Redis(repo) => repo.set_positive(key, value).await,
        }
    }

    async fn set_negative(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.set_negative(key, ttl).await,
            AnyCacheRepo::Redis(repo) => repo.set_negative(key, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.delete(key).await,
            AnyCacheRepo::Redis(repo) => repo.delete(key).await,
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        match self {
            AnyCacheRepo::Memory(repo) => repo.clear().await,
            AnyCacheRepo::Redis(repo) => repo.clear().await,
        }
    }
}

type CacheRepo<T> = AnyCacheRepo<T>;

impl From<CacheError> for StoreError {
    fn from(e: CacheError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Runs a blocking diesel call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> DbResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(format!("database task failed: {}", e)))?
        .map_err(|e| StoreError::Backend(e.to_string()))
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Database-backed store with a read-through cache in front of the hot lookups:
/// tokens by key, channels by id, routing candidates and account groups.
/// Quota reads and writes always go to the database.
#[derive(Clone)]
pub struct CachedStore {
    token_cache: CacheRepo<CacheToken>,
    channel_cache: CacheRepo<Channel>,
    candidates_cache: CacheRepo<CacheCandidates>,
    account_group_cache: CacheRepo<String>,
    negative_cache_ttl: Duration,
}

impl CachedStore {
    pub async fn new() -> Self {
        let negative_cache_ttl = CONFIG.cache.negative_ttl();
        let ttl = Some(CONFIG.cache.ttl());

        let redis_pool = redis::get_pool().await;
        let use_redis = CONFIG.cache.backend == CacheBackendType::Redis && redis_pool.is_some();
        if use_redis {
            info!("Using Redis cache backend.");
        } else if CONFIG.cache.backend == CacheBackendType::Redis {
            info!("Redis is configured, but connection failed. Falling back to in-memory cache.");
        } else {
            info!("Using in-memory cache backend.");
        }
        let pool = redis_pool.as_ref().filter(|_| use_redis);

        Self {
            token_cache: Self::create_repo(ttl, pool),
            channel_cache: Self::create_repo(ttl, pool),
            candidates_cache: Self::create_repo(ttl, pool),
            account_group_cache: Self::create_repo(ttl, pool),
            negative_cache_ttl,
        }
    }

    fn create_repo<T>(ttl: Option<Duration>, pool: Option<&RedisPool>) -> CacheRepo<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Clone + 'static,
    {
        match (pool, CONFIG.redis.as_ref()) {
            (Some(pool), Some(redis_config)) => {
                let key_prefix = format!("{}{}", redis_config.key_prefix, CONFIG.cache.redis.key_prefix);
                AnyCacheRepo::Redis(CacheRepository::new(RedisCacheBackend::new(pool.clone(), key_prefix), ttl))
            }
            _ => AnyCacheRepo::Memory(CacheRepository::new(MemoryCacheBackend::new(), ttl)),
        }
    }

    /// Warms the channel and candidate caches from the database.
    pub async fn reload(&self) {
        info!("Reloading cache: starting refresh...");
        let mut stats: HashMap<&'static str, usize> = HashMap::new();

        match blocking(Channel::list_all).await {
            Ok(channels) => {
                stats.insert("Channels", channels.len());
                let mut pairs: Vec<(String, String)> = Vec::new();
                for channel in &channels {
                    let key = CacheKey::Channel(channel.id).to_string();
                    if let Err(e) = self.channel_cache.set_positive(&key, channel).await {
                        warn!("failed to cache channel #{}: {}", channel.id, e);
                    }
                    for group in split_list(&channel.channel_group) {
                        for model in split_list(&channel.models) {
                            pairs.push((group.to_string(), model.to_string()));
                        }
                    }
                }
                pairs.sort();
                pairs.dedup();
                stats.insert("Routing pairs", pairs.len());
                for (group, model) in pairs {
                    if let Err(e) = self.refresh_candidates(&group, &model).await {
                        warn!("failed to cache candidates for {}/{}: {}", group, model, e);
                    }
                }
            }
            Err(e) => error!("failed to list channels for cache reload: {}", e),
        }

        for (name, count) in &stats {
            info!("  {}: {}", name, count);
        }
        info!("Reloading cache: done.");
    }

    pub async fn clear_cache(&self) {
        let results = [
            self.token_cache.clear().await,
            self.channel_cache.clear().await,
            self.candidates_cache.clear().await,
            self.account_group_cache.clear().await,
        ];
        for result in results {
            if let Err(e) = result {
                warn!("failed to clear cache: {}", e);
            }
        }
    }

    async fn refresh_candidates(&self, group: &str, model: &str) -> Result<CacheCandidates, StoreError> {
        let (g, m) = (group.to_string(), model.to_string());
        let candidates = blocking(move || Ability::list_candidates(&g, &m)).await?;
        let key = CacheKey::Candidates(group, model).to_string();
        self.candidates_cache.set_positive(&key, &candidates).await?;
        Ok(candidates)
    }

    /// Cached tokens carry the balance `validate` checks, so every quota or
    /// status write drops the entry.
    async fn invalidate_token(&self, id: i64) {
        match blocking(move || Token::get_by_id(id)).await {
            Ok(Some(token)) => {
                let hashed = hash_key(&token.key);
                let key = CacheKey::Token(&hashed).to_string();
                debug!("invalidate: {}", key);
                if let Err(e) = self.token_cache.delete(&key).await {
                    warn!("failed to invalidate token #{}: {}", id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load token #{} for invalidation: {}", id, e),
        }
    }

    /// Drops the cached channel and every candidate list it appears in.
    async fn invalidate_channel(&self, id: i64) {
        let key = CacheKey::Channel(id).to_string();
        debug!("invalidate: {}", key);
        if let Err(e) = self.channel_cache.delete(&key).await {
            warn!("failed to invalidate channel #{}: {}", id, e);
        }
        let abilities = match blocking(move || Ability::list_by_channel(id)).await {
            Ok(abilities) => abilities,
            Err(e) => {
                warn!("failed to load abilities of channel #{} for invalidation: {}", id, e);
                return;
            }
        };
        for ability in &abilities {
            let key = CacheKey::Candidates(&ability.ability_group, &ability.model).to_string();
            if let Err(e) = self.candidates_cache.delete(&key).await {
                warn!("failed to invalidate candidates {}: {}", key, e);
            }
        }
    }
}

#[async_trait]
impl TokenStore for CachedStore {
    async fn find_token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError> {
        let hashed = hash_key(key);
        let cache_key = CacheKey::Token(&hashed).to_string();
        if let Some(entry) = self.token_cache.get_entry(&cache_key).await? {
            return Ok(match entry.as_ref() {
                CacheEntry::Positive(cached) => {
                    let mut token = Token::from(cached.as_ref().clone());
                    token.key = key.to_string();
                    Some(token)
                }
                CacheEntry::Negative => None,
            });
        }

        let owned = key.to_string();
        match blocking(move || Token::get_by_key(&owned)).await? {
            Some(token) => {
                self.token_cache
                    .set_positive(&cache_key, &CacheToken::from(token.clone()))
                    .await?;
                Ok(Some(token))
            }
            None => {
                self.token_cache.set_negative(&cache_key, self.negative_cache_ttl).await?;
                Ok(None)
            }
        }
    }

    async fn get_token(&self, id: i64) -> Result<Option<Token>, StoreError> {
        blocking(move || Token::get_by_id(id)).await
    }

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError> {
        blocking(move || Token::update_status(id, status)).await?;
        self.invalidate_token(id).await;
        Ok(())
    }

    async fn try_consume_token_quota(&self, id: i64, quota: i64) -> Result<bool, StoreError> {
        let consumed = blocking(move || Token::try_consume_quota(id, quota)).await?;
        if consumed {
            self.invalidate_token(id).await;
        }
        Ok(consumed)
    }

    async fn adjust_token_quota(&self, id: i64, delta: i64) -> Result<(), StoreError> {
        blocking(move || Token::adjust_quota(id, delta)).await?;
        self.invalidate_token(id).await;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for CachedStore {
    async fn get_account(&self, id: i64) -> Result<Option<User>, StoreError> {
        blocking(move || User::get_by_id(id)).await
    }

    async fn get_account_quota(&self, id: i64) -> Result<Option<i64>, StoreError> {
        blocking(move || User::get_quota(id)).await
    }

    async fn get_root_email(&self) -> Result<Option<String>, StoreError> {
        blocking(User::get_root_user_email).await
    }

    async fn try_consume_account_quota(&self, id: i64, quota: i64) -> Result<Option<i64>, StoreError> {
        blocking(move || User::try_consume_quota(id, quota)).await
    }

    async fn adjust_account_quota(&self, id: i64, delta: i64) -> Result<(), StoreError> {
        blocking(move || User::adjust_quota(id, delta)).await
    }

    async fn add_account_usage(&self, id: i64, quota: i64, requests: i64) -> Result<(), StoreError> {
        blocking(move || User::add_usage(id, quota, requests)).await
    }
}

#[async_trait]
impl ChannelDirectory for CachedStore {
    async fn get_channel_by_id(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        let cache_key = CacheKey::Channel(id).to_string();
        if let Some(entry) = self.channel_cache.get_entry(&cache_key).await? {
            return Ok(match entry.as_ref() {
                CacheEntry::Positive(channel) => Some(channel.as_ref().clone()),
                CacheEntry::Negative => None,
            });
        }
        match blocking(move || Channel::get_by_id(id)).await? {
            Some(channel) => {
                self.channel_cache.set_positive(&cache_key, &channel).await?;
                Ok(Some(channel))
            }
            None => {
                self.channel_cache.set_negative(&cache_key, self.negative_cache_ttl).await?;
                Ok(None)
            }
        }
    }

    async fn satisfied_candidates(&self, group: &str, model: &str) -> Result<Vec<AbilityCandidate>, StoreError> {
        let cache_key = CacheKey::Candidates(group, model).to_string();
        if let Some(CacheEntry::Positive(candidates)) = self
            .candidates_cache
            .get_entry(&cache_key)
            .await?
            .as_deref()
        {
            return Ok(candidates.as_ref().clone());
        }
        self.refresh_candidates(group, model).await
    }

    async fn group_for_account(&self, account_id: i64) -> Result<Option<String>, StoreError> {
        let cache_key = CacheKey::AccountGroup(account_id).to_string();
        if let Some(entry) = self.account_group_cache.get_entry(&cache_key).await? {
            return Ok(match entry.as_ref() {
                CacheEntry::Positive(group) => Some(group.as_ref().clone()),
                CacheEntry::Negative => None,
            });
        }
        match blocking(move || User::get_by_id(account_id)).await? {
            Some(user) => {
                self.account_group_cache.set_positive(&cache_key, &user.user_group).await?;
                Ok(Some(user.user_group))
            }
            None => {
                self.account_group_cache
                    .set_negative(&cache_key, self.negative_cache_ttl)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn update_channel_status(&self, id: i64, status: ChannelStatus) -> Result<bool, StoreError> {
        let updated = blocking(move || Channel::update_status(id, status)).await?;
        if updated {
            self.invalidate_channel(id).await;
        }
        Ok(updated)
    }

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        blocking(move || Channel::add_used_quota(id, quota)).await
    }
}

/// The services one relay request passes through, shared by every handler.
pub struct AppState {
    pub tokens: Arc<dyn TokenStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub directory: Arc<dyn ChannelDirectory>,
    pub authenticator: TokenAuthenticator,
    pub distributor: ChannelDistributor,
    pub ledger: QuotaLedger,
    pub monitor: ChannelMonitor,
    pub relay: Arc<dyn Relay>,
    pub pre_consumed_quota: i64,
    pub display_in_currency: bool,
    pub quota_per_unit: f64,
    pub secret_key: String,
    /// Set when the stores are the cached database; admin cache routes use it.
    pub cache: Option<Arc<CachedStore>>,
}

pub struct AppStateParts {
    pub tokens: Arc<dyn TokenStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub directory: Arc<dyn ChannelDirectory>,
    pub transport: Arc<dyn NotificationTransport>,
    pub relay: Arc<dyn Relay>,
    pub batch: Option<Arc<BatchUpdater>>,
}

impl AppState {
    pub fn from_parts(parts: AppStateParts, config: &FinalConfig) -> Self {
        let AppStateParts {
            tokens,
            accounts,
            directory,
            transport,
            relay,
            batch,
        } = parts;

        let root_email = Some(config.notify.root_user_email.clone());
        let notifier = Notifier::spawn(transport, accounts.clone(), root_email, config.notify.timeout());

        // pending batch deltas make the stored balance stale
        let authenticator = TokenAuthenticator::new(tokens.clone(), batch.is_none());
        let distributor = ChannelDistributor::new(directory.clone(), config.monitor.directory_timeout());
        let mut ledger = QuotaLedger::new(
            tokens.clone(),
            accounts.clone(),
            directory.clone(),
            notifier.clone(),
            LedgerSettings {
                remind_threshold: config.quota.remind_threshold,
                server_address: config.notify.server_address.clone(),
                system_name: config.notify.system_name.clone(),
            },
        );
        if let Some(batch) = batch {
            ledger = ledger.with_batch(batch);
        }
        let monitor = ChannelMonitor::new(
            directory.clone(),
            notifier,
            MonitorSettings::from_config(&config.monitor, &config.notify.system_name),
        );

        Self {
            tokens,
            accounts,
            directory,
            authenticator,
            distributor,
            ledger,
            monitor,
            relay,
            pre_consumed_quota: config.quota.pre_consumed_quota,
            display_in_currency: config.quota.display_in_currency,
            quota_per_unit: config.quota.quota_per_unit,
            secret_key: config.secret_key.clone(),
            cache: None,
        }
    }
}

pub async fn create_app_state() -> Result<Arc<AppState>, String> {
    let store = Arc::new(CachedStore::new().await);
    store.clear_cache().await;
    store.reload().await;

    let transport = HttpTransport::from_config(&CONFIG.notify)
        .map_err(|e| format!("failed to build notification transport: {}", e))?;
    let relay = PassthroughRelay::new(CONFIG.proxy.as_deref())
        .map_err(|e| format!("failed to build relay client: {}", e))?;

    let batch = if CONFIG.quota.batch_update_enabled {
        let batch = Arc::new(BatchUpdater::new());
        batch.clone().spawn_flush_task(
            CONFIG.quota.batch_update_interval(),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        Some(batch)
    } else {
        None
    };

    let mut state = AppState::from_parts(
        AppStateParts {
            tokens: store.clone(),
            accounts: store.clone(),
            directory: store.clone(),
            transport: Arc::new(transport),
            relay: Arc::new(relay),
            batch,
        },
        &CONFIG,
    );
    state.cache = Some(store);
    Ok(Arc::new(state))
}

pub type StateRouter = Router<Arc<AppState>>;

pub fn create_state_router() -> StateRouter {
    Router::<Arc<AppState>>::new()
}
