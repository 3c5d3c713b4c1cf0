use std::sync::Arc;

use cyder_tools::log::{debug, error, warn};
use thiserror::Error;

use crate::database::now_timestamp;
use crate::database::token::Token;
use crate::schema::enum_def::TokenStatus;
use crate::service::store::TokenStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no token provided")]
    NoCredential,
    #[error("invalid token")]
    InvalidCredential,
    #[error("token verification failed")]
    VerificationFailed,
    #[error("the token is unavailable")]
    Disabled,
    #[error("the token has expired")]
    Expired,
    #[error("the quota of token {name} (#{id}) is used up")]
    Exhausted { name: String, id: i64 },
}

pub struct TokenAuthenticator {
    tokens: Arc<dyn TokenStore>,
    persist_status: bool,
}

impl TokenAuthenticator {
    /// `persist_status` writes lazily discovered `expired`/`exhausted` states
    /// back to the store. Leave it off when quota is counted elsewhere.
    pub fn new(tokens: Arc<dyn TokenStore>, persist_status: bool) -> Self {
        Self { tokens, persist_status }
    }

    pub async fn validate(&self, key: &str) -> Result<Token, AuthError> {
        if key.is_empty() {
            return Err(AuthError::NoCredential);
        }
        let token = match self.tokens.find_token_by_key(key).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(AuthError::InvalidCredential),
            Err(e) => {
                error!("failed to look up token: {}", e);
                return Err(AuthError::VerificationFailed);
            }
        };

        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Exhausted => {
                return Err(AuthError::Exhausted {
                    name: token.name,
                    id: token.id,
                });
            }
            TokenStatus::Expired => return Err(AuthError::Expired),
            TokenStatus::Disabled => return Err(AuthError::Disabled),
        }

        if token.is_expired_at(now_timestamp()) {
            self.mark(token.id, TokenStatus::Expired).await;
            return Err(AuthError::Expired);
        }
        if !token.unlimited_quota && token.remain_quota <= 0 {
            self.mark(token.id, TokenStatus::Exhausted).await;
            return Err(AuthError::Exhausted {
                name: token.name,
                id: token.id,
            });
        }
        debug!("token #{} accepted", token.id);
        Ok(token)
    }

    async fn mark(&self, token_id: i64, status: TokenStatus) {
        if !self.persist_status {
            return;
        }
        if let Err(e) = self.tokens.set_token_status(token_id, status).await {
            warn!("failed to mark token #{} as {}: {}", token_id, status, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::MemoryStore;

    fn authenticator(store: &Arc<MemoryStore>, persist: bool) -> TokenAuthenticator {
        TokenAuthenticator::new(store.clone(), persist)
    }

    #[tokio::test]
    async fn empty_and_unknown_keys() {
        let store = Arc::new(MemoryStore::new());
        let auth = authenticator(&store, true);
        assert_eq!(auth.validate("").await.err(), Some(AuthError::NoCredential));
        assert_eq!(auth.validate("sk-nope").await.err(), Some(AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn store_failure_is_not_leaked() {
        let store = Arc::new(MemoryStore::new());
        store.fail_lookups(true);
        let auth = authenticator(&store, true);
        assert_eq!(auth.validate("sk-any").await.err(), Some(AuthError::VerificationFailed));
    }

    #[tokio::test]
    async fn stored_statuses_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.insert_account(1, "default", 1_000);
        for (id, status) in [
            (1, TokenStatus::Disabled),
            (2, TokenStatus::Expired),
            (3, TokenStatus::Exhausted),
        ] {
            store.insert_token(Token {
                id,
                user_id: 1,
                key: format!("sk-{}", id),
                name: format!("t{}", id),
                status,
                expired_time: Token::NEVER_EXPIRES,
                remain_quota: 100,
                ..Default::default()
            });
        }
        let auth = authenticator(&store, true);
        assert_eq!(auth.validate("sk-1").await.err(), Some(AuthError::Disabled));
        assert_eq!(auth.validate("sk-2").await.err(), Some(AuthError::Expired));
        let exhausted = auth.validate("sk-3").await.unwrap_err();
        assert_eq!(exhausted, AuthError::Exhausted { name: "t3".to_string(), id: 3 });
        assert!(exhausted.to_string().contains("t3"));
        assert!(exhausted.to_string().contains("#3"));
    }

    #[tokio::test]
    async fn lazily_expires_and_persists() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token(Token {
            id: 5,
            user_id: 1,
            key: "sk-old".to_string(),
            expired_time: 1,
            remain_quota: 100,
            ..Default::default()
        });
        let auth = authenticator(&store, true);
        assert_eq!(auth.validate("sk-old").await.err(), Some(AuthError::Expired));
        assert_eq!(store.token(5).status, TokenStatus::Expired);
    }

    #[tokio::test]
    async fn exhaustion_is_not_persisted_without_local_authority() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token(Token {
            id: 6,
            user_id: 1,
            key: "sk-empty".to_string(),
            name: "empty".to_string(),
            expired_time: Token::NEVER_EXPIRES,
            remain_quota: 0,
            ..Default::default()
        });
        let auth = authenticator(&store, false);
        assert!(matches!(auth.validate("sk-empty").await, Err(AuthError::Exhausted { .. })));
        assert_eq!(store.token(6).status, TokenStatus::Enabled);
    }

    #[tokio::test]
    async fn lazily_exhausts_and_persists() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token(Token {
            id: 8,
            user_id: 1,
            key: "sk-spent".to_string(),
            name: "spent".to_string(),
            expired_time: Token::NEVER_EXPIRES,
            remain_quota: 0,
            ..Default::default()
        });
        let auth = authenticator(&store, true);
        assert_eq!(
            auth.validate("sk-spent").await.err(),
            Some(AuthError::Exhausted { name: "spent".to_string(), id: 8 })
        );
        assert_eq!(store.token(8).status, TokenStatus::Exhausted);

        // The stored status now rejects the token before the balance is looked at.
        assert!(matches!(auth.validate("sk-spent").await, Err(AuthError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn unlimited_tokens_ignore_balance() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token(Token {
            id: 7,
            user_id: 1,
            key: "sk-free".to_string(),
            expired_time: Token::NEVER_EXPIRES,
            remain_quota: 0,
            unlimited_quota: true,
            ..Default::default()
        });
        let auth = authenticator(&store, true);
        assert_eq!(auth.validate("sk-free").await.unwrap().id, 7);
    }
}
