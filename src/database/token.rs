use std::net::IpAddr;

use diesel::prelude::*;

use super::{get_connection, now_timestamp, DbResult};
use crate::controller::BaseError;
use crate::schema::enum_def::TokenStatus;
use crate::utils::subnet::is_ip_in_subnets;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable)]
    #[diesel(table_name = tokens)]
    pub struct Token {
        pub id: i64,
        pub user_id: i64,
        pub key: String,
        pub status: TokenStatus,
        pub name: String,
        pub created_time: i64,
        pub accessed_time: i64,
        pub expired_time: i64,
        pub remain_quota: i64,
        pub unlimited_quota: bool,
        pub used_quota: i64,
        pub models: Option<String>,
        pub subnet: Option<String>,
    }
}

impl Token {
    /// `expired_time` value of a token that never expires.
    pub const NEVER_EXPIRES: i64 = -1;

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expired_time != Self::NEVER_EXPIRES && self.expired_time < now
    }

    /// An empty or missing allow-list admits every model.
    pub fn allows_model(&self, model: &str) -> bool {
        match self.models.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(models) => models.split(',').any(|m| m.trim() == model),
        }
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        match self.subnet.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(subnets) => is_ip_in_subnets(ip, subnets),
        }
    }

    pub fn get_by_key(key_value: &str) -> DbResult<Option<Token>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let db_token = tokens::table
                .filter(tokens::dsl::key.eq(key_value))
                .select(TokenDb::as_select())
                .first::<TokenDb>(conn)
                .optional()
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Error fetching token by key: {}", e)))
                })?;
            Ok(db_token.map(|t| t.from_db()))
        })
    }

    pub fn get_by_id(id_value: i64) -> DbResult<Option<Token>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let db_token = tokens::table
                .find(id_value)
                .select(TokenDb::as_select())
                .first::<TokenDb>(conn)
                .optional()
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Error fetching token {}: {}", id_value, e)))
                })?;
            Ok(db_token.map(|t| t.from_db()))
        })
    }

    /// Writes only `status` and `accessed_time`, leaving the quota columns to the ledger.
    pub fn update_status(id_value: i64, status_value: TokenStatus) -> DbResult<()> {
        let conn = &mut get_connection()?;
        let now = now_timestamp();
        db_execute!(conn, {
            diesel::update(tokens::table.find(id_value))
                .set((
                    tokens::dsl::status.eq(status_value),
                    tokens::dsl::accessed_time.eq(now),
                ))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Failed to update status of token {}: {}",
                        id_value, e
                    )))
                })?;
            Ok(())
        })
    }

    /// Adds `delta` to the remaining quota and subtracts it from the used quota.
    /// A negative delta is a charge, a positive one a refund.
    pub fn adjust_quota(id_value: i64, delta: i64) -> DbResult<()> {
        let conn = &mut get_connection()?;
        let now = now_timestamp();
        db_execute!(conn, {
            let affected = diesel::update(tokens::table.find(id_value))
                .set((
                    tokens::dsl::remain_quota.eq(tokens::dsl::remain_quota + delta),
                    tokens::dsl::used_quota.eq(tokens::dsl::used_quota - delta),
                    tokens::dsl::accessed_time.eq(now),
                ))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Failed to adjust quota of token {}: {}",
                        id_value, e
                    )))
                })?;
            if affected == 0 {
                return Err(BaseError::NotFound(Some(format!("token {} not found", id_value))));
            }
            Ok(())
        })
    }

    /// Charges `quota` only if the remaining quota covers it. Returns whether the row changed.
    pub fn try_consume_quota(id_value: i64, quota: i64) -> DbResult<bool> {
        let conn = &mut get_connection()?;
        let now = now_timestamp();
        db_execute!(conn, {
            let affected = diesel::update(
                tokens::table
                    .filter(tokens::dsl::id.eq(id_value))
                    .filter(tokens::dsl::remain_quota.ge(quota)),
            )
            .set((
                tokens::dsl::remain_quota.eq(tokens::dsl::remain_quota - quota),
                tokens::dsl::used_quota.eq(tokens::dsl::used_quota + quota),
                tokens::dsl::accessed_time.eq(now),
            ))
            .execute(conn)
            .map_err(|e| {
                BaseError::DatabaseFatal(Some(format!(
                    "Failed to consume quota of token {}: {}",
                    id_value, e
                )))
            })?;
            Ok(affected == 1)
        })
    }
}

#[cfg(test)]
impl Token {
    pub fn insert(token: &Token) -> DbResult<()> {
        let conn = &mut get_connection()?;
        let t = token.clone();
        db_execute!(conn, {
            diesel::insert_into(tokens::table)
                .values((
                    tokens::dsl::id.eq(t.id),
                    tokens::dsl::user_id.eq(t.user_id),
                    tokens::dsl::key.eq(t.key),
                    tokens::dsl::status.eq(t.status),
                    tokens::dsl::name.eq(t.name),
                    tokens::dsl::created_time.eq(t.created_time),
                    tokens::dsl::accessed_time.eq(t.accessed_time),
                    tokens::dsl::expired_time.eq(t.expired_time),
                    tokens::dsl::remain_quota.eq(t.remain_quota),
                    tokens::dsl::unlimited_quota.eq(t.unlimited_quota),
                    tokens::dsl::used_quota.eq(t.used_quota),
                    tokens::dsl::models.eq(t.models),
                    tokens::dsl::subnet.eq(t.subnet),
                ))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to insert token: {}", e))))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        Token {
            id: 1,
            user_id: 7,
            key: "sk-test".to_string(),
            name: "ci".to_string(),
            expired_time: Token::NEVER_EXPIRES,
            ..Default::default()
        }
    }

    #[test]
    fn sentinel_never_expires() {
        assert!(!token().is_expired_at(i64::MAX));
    }

    #[test]
    fn past_expiry_is_expired() {
        let t = Token { expired_time: 100, ..token() };
        assert!(t.is_expired_at(101));
        assert!(!t.is_expired_at(100));
    }

    #[test]
    fn model_allow_list() {
        let open = token();
        assert!(open.allows_model("gpt-4o"));

        let restricted = Token {
            models: Some("gpt-4o, gpt-4o-mini".to_string()),
            ..token()
        };
        assert!(restricted.allows_model("gpt-4o-mini"));
        assert!(!restricted.allows_model("claude-3-opus"));
    }

    #[test]
    fn subnet_restriction() {
        let t = Token {
            subnet: Some("10.0.0.0/8".to_string()),
            ..token()
        };
        assert!(t.allows_ip("10.1.2.3".parse().unwrap()));
        assert!(!t.allows_ip("192.168.1.1".parse().unwrap()));
        assert!(token().allows_ip("192.168.1.1".parse().unwrap()));
    }
}
