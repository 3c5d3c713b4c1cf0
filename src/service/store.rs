//! Storage seams the gateway core talks through. Production wires these to
//! [`crate::service::app_state::AppState`]; tests use the in-memory fakes in
//! `service::testing`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::database::ability::AbilityCandidate;
use crate::database::channel::Channel;
use crate::database::token::Token;
use crate::database::user::User;
use crate::schema::enum_def::{ChannelStatus, TokenStatus};
use crate::utils::weighted::select_weighted;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Lookup by secret. May be served from cache.
    async fn find_token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError>;

    /// Fresh read of the token row, quota columns included.
    async fn get_token(&self, id: i64) -> Result<Option<Token>, StoreError>;

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError>;

    /// Conditional decrement; false when the remaining quota does not cover `quota`.
    async fn try_consume_token_quota(&self, id: i64, quota: i64) -> Result<bool, StoreError>;

    /// Unconditional `remain += delta`, `used -= delta`.
    async fn adjust_token_quota(&self, id: i64, delta: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn get_account_quota(&self, id: i64) -> Result<Option<i64>, StoreError>;

    async fn get_root_email(&self) -> Result<Option<String>, StoreError>;

    /// Conditional decrement returning the new balance, or `None` when the
    /// balance does not cover `quota`.
    async fn try_consume_account_quota(&self, id: i64, quota: i64) -> Result<Option<i64>, StoreError>;

    async fn adjust_account_quota(&self, id: i64, delta: i64) -> Result<(), StoreError>;

    async fn add_account_usage(&self, id: i64, quota: i64, requests: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn get_channel_by_id(&self, id: i64) -> Result<Option<Channel>, StoreError>;

    /// Enabled abilities for `(group, model)`.
    async fn satisfied_candidates(&self, group: &str, model: &str) -> Result<Vec<AbilityCandidate>, StoreError>;

    async fn group_for_account(&self, account_id: i64) -> Result<Option<String>, StoreError>;

    /// Returns false when no channel has `id`.
    async fn update_channel_status(&self, id: i64, status: ChannelStatus) -> Result<bool, StoreError>;

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError>;

    /// Weighted random pick among the satisfied candidates. The returned id is
    /// not re-checked against the channel table.
    async fn random_satisfied_channel(&self, group: &str, model: &str) -> Result<Option<i64>, StoreError> {
        let candidates = self.satisfied_candidates(group, model).await?;
        let picked = select_weighted(&candidates, |c| c.weight.unwrap_or(0).max(0) as u32);
        Ok(picked.map(|c| c.channel_id))
    }
}
