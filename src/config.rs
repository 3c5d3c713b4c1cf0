use std::{fs, path::Path, time::Duration};

use once_cell::sync::Lazy;
use rand::{distr::Alphanumeric, rng, Rng};
use serde::{Deserialize, Serialize};

// --- START REDIS CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRedisConfig {
    pub url: Option<String>,
    pub pool_size: Option<usize>,
    pub key_prefix: Option<String>,
}

impl PartialRedisConfig {
    fn merge_into(self, final_config: &mut RedisConfig) {
        if let Some(url) = self.url {
            final_config.url = url;
        }
        if let Some(pool_size) = self.pool_size {
            final_config.pool_size = pool_size;
        }
        if let Some(key_prefix) = self.key_prefix {
            final_config.key_prefix = key_prefix;
        }
    }
}

// --- START CACHE CONFIG ---

/// Cache backend type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendType {
    #[default]
    Memory,
    Redis,
}

/// Redis cache specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRedisConfig {
    #[serde(default = "default_cache_redis_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheRedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_cache_redis_key_prefix(),
        }
    }
}

/// Overall cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendType,
    #[serde(default = "default_ttl_seconds")]
    pub ttl: u64,
    #[serde(default = "default_negative_ttl_seconds")]
    pub negative_ttl: u64,
    #[serde(default)]
    pub redis: CacheRedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendType::default(),
            ttl: default_ttl_seconds(),
            negative_ttl: default_negative_ttl_seconds(),
            redis: CacheRedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialCacheRedisConfig {
    pub key_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialCacheConfig {
    pub backend: Option<CacheBackendType>,
    pub ttl: Option<u64>,
    pub negative_ttl: Option<u64>,
    pub redis: Option<PartialCacheRedisConfig>,
}

impl PartialCacheConfig {
    fn merge_into(self, final_config: &mut CacheConfig) {
        if let Some(backend) = self.backend {
            final_config.backend = backend;
        }
        if let Some(ttl) = self.ttl {
            final_config.ttl = ttl;
        }
        if let Some(negative_ttl) = self.negative_ttl {
            final_config.negative_ttl = negative_ttl;
        }
        if let Some(redis) = self.redis {
            if let Some(key_prefix) = redis.key_prefix {
                final_config.redis.key_prefix = key_prefix;
            }
        }
    }
}

// --- START QUOTA CONFIG ---

/// Settings consumed by the quota ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Owners are reminded once their balance drops below this many credit units.
    #[serde(default = "default_quota_remind_threshold")]
    pub remind_threshold: i64,
    /// Estimate reserved before the upstream call when the caller has no better guess.
    #[serde(default = "default_pre_consumed_quota")]
    pub pre_consumed_quota: i64,
    #[serde(default)]
    pub batch_update_enabled: bool,
    /// Seconds between two flushes of the pending batch records.
    #[serde(default = "default_batch_update_interval")]
    pub batch_update_interval: u64,
    #[serde(default = "default_true")]
    pub display_in_currency: bool,
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            remind_threshold: default_quota_remind_threshold(),
            pre_consumed_quota: default_pre_consumed_quota(),
            batch_update_enabled: false,
            batch_update_interval: default_batch_update_interval(),
            display_in_currency: true,
            quota_per_unit: default_quota_per_unit(),
        }
    }
}

impl QuotaConfig {
    pub fn batch_update_interval(&self) -> Duration {
        Duration::from_secs(self.batch_update_interval.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialQuotaConfig {
    pub remind_threshold: Option<i64>,
    pub pre_consumed_quota: Option<i64>,
    pub batch_update_enabled: Option<bool>,
    pub batch_update_interval: Option<u64>,
    pub display_in_currency: Option<bool>,
    pub quota_per_unit: Option<f64>,
}

impl PartialQuotaConfig {
    fn merge_into(self, final_config: &mut QuotaConfig) {
        if let Some(v) = self.remind_threshold { final_config.remind_threshold = v; }
        if let Some(v) = self.pre_consumed_quota { final_config.pre_consumed_quota = v; }
        if let Some(v) = self.batch_update_enabled { final_config.batch_update_enabled = v; }
        if let Some(v) = self.batch_update_interval { final_config.batch_update_interval = v; }
        if let Some(v) = self.display_in_currency { final_config.display_in_currency = v; }
        if let Some(v) = self.quota_per_unit { final_config.quota_per_unit = v; }
    }
}

// --- START MONITOR CONFIG ---

/// Settings consumed by the channel health monitor and the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Size of the rolling outcome window kept per channel.
    #[serde(default = "default_metric_queue_size")]
    pub metric_queue_size: usize,
    #[serde(default = "default_metric_success_rate_threshold")]
    pub metric_success_rate_threshold: f64,
    #[serde(default)]
    pub automatic_disable_channel_enabled: bool,
    #[serde(default)]
    pub automatic_enable_channel_enabled: bool,
    #[serde(default = "default_directory_timeout_ms")]
    pub directory_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metric_queue_size: default_metric_queue_size(),
            metric_success_rate_threshold: default_metric_success_rate_threshold(),
            automatic_disable_channel_enabled: false,
            automatic_enable_channel_enabled: false,
            directory_timeout_ms: default_directory_timeout_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialMonitorConfig {
    pub metric_queue_size: Option<usize>,
    pub metric_success_rate_threshold: Option<f64>,
    pub automatic_disable_channel_enabled: Option<bool>,
    pub automatic_enable_channel_enabled: Option<bool>,
    pub directory_timeout_ms: Option<u64>,
}

impl PartialMonitorConfig {
    fn merge_into(self, final_config: &mut MonitorConfig) {
        if let Some(v) = self.metric_queue_size { final_config.metric_queue_size = v; }
        if let Some(v) = self.metric_success_rate_threshold { final_config.metric_success_rate_threshold = v; }
        if let Some(v) = self.automatic_disable_channel_enabled { final_config.automatic_disable_channel_enabled = v; }
        if let Some(v) = self.automatic_enable_channel_enabled { final_config.automatic_enable_channel_enabled = v; }
        if let Some(v) = self.directory_timeout_ms { final_config.directory_timeout_ms = v; }
    }
}

// --- START NOTIFY CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Message pusher endpoint. Empty disables push and falls back to email.
    #[serde(default)]
    pub message_pusher_address: String,
    #[serde(default)]
    pub message_pusher_token: String,
    /// Resolved from the root account when left empty.
    #[serde(default)]
    pub root_user_email: String,
    /// HTTP mail relay accepting `{to, subject, content}` JSON.
    #[serde(default)]
    pub email_relay_url: String,
    #[serde(default)]
    pub email_relay_token: String,
    #[serde(default = "default_server_address")]
    pub server_address: String,
    #[serde(default = "default_system_name")]
    pub system_name: String,
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            message_pusher_address: String::new(),
            message_pusher_token: String::new(),
            root_user_email: String::new(),
            email_relay_url: String::new(),
            email_relay_token: String::new(),
            server_address: default_server_address(),
            system_name: default_system_name(),
            timeout_ms: default_notify_timeout_ms(),
        }
    }
}

impl NotifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialNotifyConfig {
    pub message_pusher_address: Option<String>,
    pub message_pusher_token: Option<String>,
    pub root_user_email: Option<String>,
    pub email_relay_url: Option<String>,
    pub email_relay_token: Option<String>,
    pub server_address: Option<String>,
    pub system_name: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl PartialNotifyConfig {
    fn merge_into(self, final_config: &mut NotifyConfig) {
        if let Some(v) = self.message_pusher_address { final_config.message_pusher_address = v; }
        if let Some(v) = self.message_pusher_token { final_config.message_pusher_token = v; }
        if let Some(v) = self.root_user_email { final_config.root_user_email = v; }
        if let Some(v) = self.email_relay_url { final_config.email_relay_url = v; }
        if let Some(v) = self.email_relay_token { final_config.email_relay_token = v; }
        if let Some(v) = self.server_address { final_config.server_address = v; }
        if let Some(v) = self.system_name { final_config.system_name = v; }
        if let Some(v) = self.timeout_ms { final_config.timeout_ms = v; }
    }
}

// Default values
fn default_ttl_seconds() -> u64 {
    3600 // 1 hour
}

fn default_negative_ttl_seconds() -> u64 {
    60 // 1 minute
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "relay:".to_string()
}

fn default_cache_redis_key_prefix() -> String {
    "cache:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_quota_remind_threshold() -> i64 {
    1000
}

fn default_pre_consumed_quota() -> i64 {
    500
}

fn default_batch_update_interval() -> u64 {
    5
}

fn default_quota_per_unit() -> f64 {
    500_000.0
}

fn default_true() -> bool {
    true
}

fn default_metric_queue_size() -> usize {
    10
}

fn default_metric_success_rate_threshold() -> f64 {
    0.8
}

fn default_directory_timeout_ms() -> u64 {
    3000
}

fn default_server_address() -> String {
    "http://localhost:8000".to_string()
}

fn default_system_name() -> String {
    "Relay Gateway".to_string()
}

fn default_notify_timeout_ms() -> u64 {
    5000
}

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_path: Option<String>,
    pub secret_key: Option<String>,
    pub db_url: Option<String>,
    pub proxy: Option<String>,
    pub log_level: Option<String>,
    pub redis: Option<PartialRedisConfig>,
    pub cache: Option<PartialCacheConfig>,
    pub quota: Option<PartialQuotaConfig>,
    pub monitor: Option<PartialMonitorConfig>,
    pub notify: Option<PartialNotifyConfig>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config, overwriting existing values.
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host { final_config.host = host; }
        if let Some(port) = self.port { final_config.port = port; }
        if let Some(base_path) = self.base_path { final_config.base_path = base_path; }
        if let Some(secret_key) = self.secret_key { final_config.secret_key = secret_key; }
        if let Some(db_url) = self.db_url { final_config.db_url = db_url; }
        if let Some(proxy) = self.proxy { final_config.proxy = Some(proxy); }
        if let Some(log_level) = self.log_level { final_config.log_level = log_level; }
        if let Some(redis) = self.redis {
            redis.merge_into(final_config.redis.get_or_insert_with(Default::default));
        }
        if let Some(cache) = self.cache {
            cache.merge_into(&mut final_config.cache)
        }
        if let Some(quota) = self.quota {
            quota.merge_into(&mut final_config.quota)
        }
        if let Some(monitor) = self.monitor {
            monitor.merge_into(&mut final_config.monitor)
        }
        if let Some(notify) = self.notify {
            notify.merge_into(&mut final_config.notify)
        }
    }
}

// The fully resolved configuration used by the application.
// This is also the format for the default configuration file.
#[derive(Debug, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub secret_key: String,
    pub db_url: String,
    pub proxy: Option<String>,
    pub log_level: String,
    pub redis: Option<RedisConfig>,
    pub cache: CacheConfig,
    pub quota: QuotaConfig,
    pub monitor: MonitorConfig,
    pub notify: NotifyConfig,
}

fn generate_random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_config_from_env() -> PartialConfig {
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        base_path: get_env_var("BASE_PATH"),
        secret_key: get_env_var("SECRET_KEY"),
        db_url: get_env_var("DB_URL"),
        proxy: get_env_var("PROXY"),
        log_level: get_env_var("LOG_LEVEL"),
        redis: None,
        cache: None,
        quota: Some(PartialQuotaConfig {
            batch_update_enabled: get_env_var("BATCH_UPDATE_ENABLED"),
            batch_update_interval: get_env_var("BATCH_UPDATE_INTERVAL"),
            ..Default::default()
        }),
        monitor: None,
        notify: Some(PartialNotifyConfig {
            message_pusher_address: get_env_var("MESSAGE_PUSHER_ADDRESS"),
            root_user_email: get_env_var("ROOT_USER_EMAIL"),
            ..Default::default()
        }),
    }
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(|| {
    let default_config_path = Path::new("config.default.yaml");
    let user_config_path_primary = Path::new("config.local.yaml");
    let user_config_path_fallback = Path::new("config.yaml");

    let user_config_path = if user_config_path_primary.exists() {
        user_config_path_primary
    } else {
        user_config_path_fallback
    };

    // Create a FinalConfig with programmatic defaults.
    let mut effective_default_config = FinalConfig {
        host: "0.0.0.0".to_string(),
        port: 8000,
        base_path: "/".to_string(),
        secret_key: generate_random_string(48),
        db_url: "./storage/sqlite.db".to_string(),
        proxy: None,
        log_level: "info".to_string(),
        redis: None,
        cache: CacheConfig::default(),
        quota: QuotaConfig::default(),
        monitor: MonitorConfig::default(),
        notify: NotifyConfig::default(),
    };

    // If a default config file exists, load it as partial and merge it over the programmatic defaults.
    if default_config_path.exists() {
        if let Ok(config_str) = fs::read_to_string(default_config_path) {
            let file_defaults: PartialConfig = serde_yaml::from_str(&config_str)
                .unwrap_or_else(|e| panic!("Failed to parse default configuration file at {:?}: {}", default_config_path, e));

            file_defaults.merge_into(&mut effective_default_config);
        }
    }

    // Write the (potentially updated) defaults back so new fields show up in config.default.yaml.
    let yaml_str = serde_yaml::to_string(&effective_default_config)
        .unwrap_or_else(|err| panic!("Failed to serialize default configuration: {}", err));
    fs::write(default_config_path, yaml_str)
        .unwrap_or_else(|err| panic!("Failed to write default configuration file: {}", err));

    let mut final_config = effective_default_config;

    // The user's config is optional and overrides the defaults.
    if user_config_path.exists() {
        if let Ok(config_str) = fs::read_to_string(user_config_path) {
            let user_config: PartialConfig = serde_yaml::from_str(&config_str)
                .unwrap_or_else(|e| panic!("Failed to parse user configuration file at {:?}: {}", user_config_path, e));

            user_config.merge_into(&mut final_config);
        }
    }

    // Environment variables have the highest priority.
    get_config_from_env().merge_into(&mut final_config);

    if final_config.redis.is_none() && final_config.cache.backend == CacheBackendType::Redis {
        final_config.cache.backend = CacheBackendType::Memory;
    }

    final_config
});
