use serde::{de, Deserialize, Serialize};
use serde_with::serde_as;
use std::sync::Arc;

use crate::database::ability::AbilityCandidate;
use crate::database::token::Token;
use crate::schema::enum_def::TokenStatus;

/// Either a cached value or a marker recording that the store has no such row.
#[serde_as]
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum CacheEntry<T: Clone + Serialize + de::DeserializeOwned> {
    Positive(#[serde_as(as = "Arc<serde_with::Same>")] Arc<T>),
    Negative,
}

/// Token fields the authenticator needs. The secret itself is not cached;
/// entries are keyed by its sha256 digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheToken {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: TokenStatus,
    pub expired_time: i64,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub models: Option<String>,
    pub subnet: Option<String>,
}

/// Enabled candidates for one (group, model) pair.
pub type CacheCandidates = Vec<AbilityCandidate>;

impl From<Token> for CacheToken {
    fn from(db: Token) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            name: db.name,
            status: db.status,
            expired_time: db.expired_time,
            remain_quota: db.remain_quota,
            unlimited_quota: db.unlimited_quota,
            models: db.models,
            subnet: db.subnet,
        }
    }
}

impl From<CacheToken> for Token {
    fn from(cached: CacheToken) -> Self {
        Self {
            id: cached.id,
            user_id: cached.user_id,
            name: cached.name,
            status: cached.status,
            expired_time: cached.expired_time,
            remain_quota: cached.remain_quota,
            unlimited_quota: cached.unlimited_quota,
            models: cached.models,
            subnet: cached.subnet,
            ..Default::default()
        }
    }
}
