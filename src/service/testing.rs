//! In-memory fakes for the storage and notification seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{CacheConfig, FinalConfig, MonitorConfig, NotifyConfig, QuotaConfig};
use crate::database::ability::{Ability, AbilityCandidate};
use crate::database::channel::Channel;
use crate::database::token::Token;
use crate::database::user::{User, ROLE_ADMIN, ROLE_COMMON, ROLE_ROOT};
use crate::schema::enum_def::{ChannelStatus, TokenStatus};
use crate::service::app_state::{AppState, AppStateParts};
use crate::service::distributor::RoutingContext;
use crate::service::notify::{Message, NotificationTransport, NotifyError};
use crate::service::relay::{Relay, RelayError, RelayRequest, RelayResponse};
use crate::service::store::{AccountStore, ChannelDirectory, StoreError, TokenStore};
use crate::utils::billing::parse_usage_info;

const ROOT_ID: i64 = i64::MAX;

#[derive(Default)]
struct State {
    tokens: HashMap<i64, Token>,
    accounts: HashMap<i64, User>,
    channels: HashMap<i64, Channel>,
    abilities: Vec<Ability>,
    fail_lookups: bool,
    fail_account_writes: bool,
    latency: Option<Duration>,
    pending_drain: HashMap<i64, i64>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn not_found(what: &str, id: i64) -> StoreError {
    StoreError::Backend(format!("{} #{} not found", what, id))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn insert_account(&self, id: i64, group: &str, quota: i64) {
        self.with(|s| {
            s.accounts.insert(
                id,
                User {
                    id,
                    username: format!("user{}", id),
                    role: ROLE_COMMON,
                    status: 1,
                    user_group: group.to_string(),
                    quota,
                    ..Default::default()
                },
            )
        });
    }

    pub fn set_account_email(&self, id: i64, email: &str) {
        self.with(|s| {
            if let Some(account) = s.accounts.get_mut(&id) {
                account.email = Some(email.to_string());
            }
        });
    }

    pub fn make_admin(&self, id: i64) {
        self.with(|s| {
            if let Some(account) = s.accounts.get_mut(&id) {
                account.role = ROLE_ADMIN;
            }
        });
    }

    pub fn insert_root(&self, email: &str) {
        self.with(|s| {
            s.accounts.insert(
                ROOT_ID,
                User {
                    id: ROOT_ID,
                    username: "root".to_string(),
                    email: Some(email.to_string()),
                    role: ROLE_ROOT,
                    status: 1,
                    user_group: "default".to_string(),
                    ..Default::default()
                },
            )
        });
    }

    pub fn account_quota(&self, id: i64) -> i64 {
        self.with(|s| s.accounts[&id].quota)
    }

    /// `(used_quota, request_count)`
    pub fn account_usage(&self, id: i64) -> (i64, i64) {
        self.with(|s| {
            let account = &s.accounts[&id];
            (account.used_quota, account.request_count)
        })
    }

    /// Takes `amount` off the account right before the next conditional charge.
    pub fn drain_account_before_next_charge(&self, id: i64, amount: i64) {
        self.with(|s| s.pending_drain.insert(id, amount));
    }

    pub fn fail_account_writes(&self, fail: bool) {
        self.with(|s| s.fail_account_writes = fail);
    }

    pub fn insert_token(&self, token: Token) {
        self.with(|s| s.tokens.insert(token.id, token));
    }

    pub fn token(&self, id: i64) -> Token {
        self.with(|s| s.tokens[&id].clone())
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.with(|s| s.fail_lookups = fail);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.with(|s| s.latency = Some(latency));
    }

    pub fn insert_channel(&self, id: i64, name: &str, groups: &[&str], models: &[&str], weight: i32) {
        self.insert_channel_with(Channel {
            id,
            name: name.to_string(),
            key: format!("sk-channel-{}", id),
            weight,
            models: models.join(","),
            channel_group: groups.join(","),
            ..Default::default()
        });
    }

    /// Inserts the channel plus one ability per group and model it lists.
    pub fn insert_channel_with(&self, channel: Channel) {
        self.with(|s| {
            let enabled = channel.is_enabled();
            for group in channel.channel_group.split(',').map(str::trim).filter(|g| !g.is_empty()) {
                for model in channel.models.split(',').map(str::trim).filter(|m| !m.is_empty()) {
                    s.abilities.push(Ability {
                        ability_group: group.to_string(),
                        model: model.to_string(),
                        channel_id: channel.id,
                        enabled,
                    });
                }
            }
            s.channels.insert(channel.id, channel);
        });
    }

    /// An ability row whose channel does not exist.
    pub fn insert_dangling_ability(&self, group: &str, model: &str, channel_id: i64) {
        self.with(|s| {
            s.abilities.push(Ability {
                ability_group: group.to_string(),
                model: model.to_string(),
                channel_id,
                enabled: true,
            })
        });
    }

    pub fn channel_status(&self, id: i64) -> ChannelStatus {
        self.with(|s| s.channels[&id].status)
    }

    pub fn channel_used_quota(&self, id: i64) -> i64 {
        self.with(|s| s.channels[&id].used_quota)
    }

    pub fn set_channel_status(&self, id: i64, status: ChannelStatus) {
        self.with(|s| apply_channel_status(s, id, status));
    }

    /// Changes the channel row only, leaving its abilities out of sync.
    pub fn set_channel_status_without_abilities(&self, id: i64, status: ChannelStatus) {
        self.with(|s| {
            if let Some(channel) = s.channels.get_mut(&id) {
                channel.status = status;
            }
        });
    }

    async fn delay(&self) {
        let latency = self.with(|s| s.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn account_write<R>(&self, f: impl FnOnce(&mut State) -> Result<R, StoreError>) -> Result<R, StoreError> {
        self.with(|s| {
            if s.fail_account_writes {
                return Err(StoreError::Backend("account writes disabled".to_string()));
            }
            f(s)
        })
    }
}

fn apply_channel_status(state: &mut State, id: i64, status: ChannelStatus) -> bool {
    let Some(channel) = state.channels.get_mut(&id) else {
        return false;
    };
    channel.status = status;
    for ability in state.abilities.iter_mut().filter(|a| a.channel_id == id) {
        ability.enabled = status == ChannelStatus::Enabled;
    }
    true
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn find_token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError> {
        self.with(|s| {
            if s.fail_lookups {
                return Err(StoreError::Backend("lookups disabled".to_string()));
            }
            Ok(s.tokens.values().find(|t| t.key == key).cloned())
        })
    }

    async fn get_token(&self, id: i64) -> Result<Option<Token>, StoreError> {
        Ok(self.with(|s| s.tokens.get(&id).cloned()))
    }

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError> {
        self.with(|s| {
            let token = s.tokens.get_mut(&id).ok_or_else(|| not_found("token", id))?;
            token.status = status;
            Ok(())
        })
    }

    async fn try_consume_token_quota(&self, id: i64, quota: i64) -> Result<bool, StoreError> {
        self.with(|s| {
            let token = s.tokens.get_mut(&id).ok_or_else(|| not_found("token", id))?;
            if token.remain_quota < quota {
                return Ok(false);
            }
            token.remain_quota -= quota;
            token.used_quota += quota;
            Ok(true)
        })
    }

    async fn adjust_token_quota(&self, id: i64, delta: i64) -> Result<(), StoreError> {
        self.with(|s| {
            let token = s.tokens.get_mut(&id).ok_or_else(|| not_found("token", id))?;
            token.remain_quota += delta;
            token.used_quota -= delta;
            Ok(())
        })
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.with(|s| s.accounts.get(&id).cloned()))
    }

    async fn get_account_quota(&self, id: i64) -> Result<Option<i64>, StoreError> {
        Ok(self.with(|s| s.accounts.get(&id).map(|a| a.quota)))
    }

    async fn get_root_email(&self) -> Result<Option<String>, StoreError> {
        Ok(self.with(|s| {
            s.accounts
                .values()
                .find(|a| a.role == ROLE_ROOT)
                .and_then(|a| a.email.clone())
        }))
    }

    async fn try_consume_account_quota(&self, id: i64, quota: i64) -> Result<Option<i64>, StoreError> {
        self.account_write(|s| {
            let drain = s.pending_drain.remove(&id).unwrap_or(0);
            let account = s.accounts.get_mut(&id).ok_or_else(|| not_found("account", id))?;
            account.quota -= drain;
            if account.quota < quota {
                return Ok(None);
            }
            account.quota -= quota;
            Ok(Some(account.quota))
        })
    }

    async fn adjust_account_quota(&self, id: i64, delta: i64) -> Result<(), StoreError> {
        self.account_write(|s| {
            let account = s.accounts.get_mut(&id).ok_or_else(|| not_found("account", id))?;
            account.quota += delta;
            Ok(())
        })
    }

    async fn add_account_usage(&self, id: i64, quota: i64, requests: i64) -> Result<(), StoreError> {
        self.account_write(|s| {
            let account = s.accounts.get_mut(&id).ok_or_else(|| not_found("account", id))?;
            account.used_quota += quota;
            account.request_count += requests;
            Ok(())
        })
    }
}

#[async_trait]
impl ChannelDirectory for MemoryStore {
    async fn get_channel_by_id(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        self.delay().await;
        Ok(self.with(|s| s.channels.get(&id).cloned()))
    }

    async fn satisfied_candidates(&self, group: &str, model: &str) -> Result<Vec<AbilityCandidate>, StoreError> {
        self.delay().await;
        Ok(self.with(|s| {
            s.abilities
                .iter()
                .filter(|a| a.enabled && a.ability_group == group && a.model == model)
                .map(|a| AbilityCandidate {
                    channel_id: a.channel_id,
                    weight: s.channels.get(&a.channel_id).map(|c| c.weight),
                })
                .collect()
        }))
    }

    async fn group_for_account(&self, account_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self.with(|s| s.accounts.get(&account_id).map(|a| a.user_group.clone())))
    }

    async fn update_channel_status(&self, id: i64, status: ChannelStatus) -> Result<bool, StoreError> {
        Ok(self.with(|s| apply_channel_status(s, id, status)))
    }

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        self.with(|s| {
            let channel = s.channels.get_mut(&id).ok_or_else(|| not_found("channel", id))?;
            channel.used_quota += quota;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushMode {
    Working,
    Failing,
    Disabled,
}

/// Records what would have been sent.
pub struct RecordingTransport {
    mode: PushMode,
    pushes: Mutex<Vec<Message>>,
    emails: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    fn new(mode: PushMode) -> Self {
        Self {
            mode,
            pushes: Mutex::new(Vec::new()),
            emails: Mutex::new(Vec::new()),
        }
    }

    pub fn with_push() -> Self {
        Self::new(PushMode::Working)
    }

    pub fn with_failing_push() -> Self {
        Self::new(PushMode::Failing)
    }

    pub fn without_push() -> Self {
        Self::new(PushMode::Disabled)
    }

    pub fn pushes(&self) -> Vec<Message> {
        self.pushes.lock().unwrap().clone()
    }

    /// `(to, subject)` of every mail sent.
    pub fn emails(&self) -> Vec<(String, String)> {
        self.emails.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    fn push_enabled(&self) -> bool {
        self.mode != PushMode::Disabled
    }

    async fn push(&self, message: &Message) -> Result<(), NotifyError> {
        match self.mode {
            PushMode::Working => {
                self.pushes.lock().unwrap().push(message.clone());
                Ok(())
            }
            PushMode::Failing => Err(NotifyError::Rejected("pusher down".to_string())),
            PushMode::Disabled => Err(NotifyError::NotConfigured),
        }
    }

    async fn email(&self, to: &str, subject: &str, _content: &str) -> Result<(), NotifyError> {
        self.emails.lock().unwrap().push((to.to_string(), subject.to_string()));
        Ok(())
    }
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Configuration with every section at its defaults and automatic disabling on.
pub fn test_config() -> FinalConfig {
    FinalConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        base_path: "/".to_string(),
        secret_key: "test-secret".to_string(),
        db_url: ":memory:".to_string(),
        proxy: None,
        log_level: "debug".to_string(),
        redis: None,
        cache: CacheConfig::default(),
        quota: QuotaConfig {
            pre_consumed_quota: 100,
            display_in_currency: false,
            ..Default::default()
        },
        monitor: MonitorConfig {
            automatic_disable_channel_enabled: true,
            automatic_enable_channel_enabled: true,
            ..Default::default()
        },
        notify: NotifyConfig::default(),
    }
}

/// Answers every relay call with the same upstream response.
pub struct StubRelay {
    status: u16,
    body: serde_json::Value,
    calls: Mutex<Vec<(i64, serde_json::Value)>>,
}

impl StubRelay {
    pub fn ok(body: serde_json::Value) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(channel id, request body)` of every call.
    pub fn calls(&self) -> Vec<(i64, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Relay for StubRelay {
    async fn relay(&self, context: &RoutingContext, request: RelayRequest) -> Result<RelayResponse, RelayError> {
        self.calls.lock().unwrap().push((context.channel_id, request.body));
        let usage = if (200..300).contains(&self.status) {
            parse_usage_info(&self.body)
        } else {
            None
        };
        Ok(RelayResponse {
            status: self.status,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(self.body.to_string()),
            usage,
        })
    }
}

/// An [`AppState`] over `store` with a recording transport.
pub fn test_state(store: &Arc<MemoryStore>, relay: Arc<StubRelay>, config: &FinalConfig) -> Arc<AppState> {
    Arc::new(AppState::from_parts(
        AppStateParts {
            tokens: store.clone(),
            accounts: store.clone(),
            directory: store.clone(),
            transport: Arc::new(RecordingTransport::with_push()),
            relay,
            batch: None,
        },
        config,
    ))
}
