use diesel::prelude::*;

use super::{get_connection, now_timestamp, DbResult};
use crate::controller::BaseError;
use crate::{db_execute, db_object};

pub const ROLE_COMMON: i32 = 1;
pub const ROLE_ADMIN: i32 = 10;
pub const ROLE_ROOT: i32 = 100;

db_object! {
    #[derive(Queryable, Selectable, Identifiable)]
    #[diesel(table_name = users)]
    pub struct User {
        pub id: i64,
        pub username: String,
        pub email: Option<String>,
        pub role: i32,
        pub status: i32,
        pub user_group: String,
        pub quota: i64,
        pub used_quota: i64,
        pub request_count: i64,
        pub created_at: i64,
        pub updated_at: i64,
    }
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role >= ROLE_ADMIN
    }

    pub fn get_by_id(id_value: i64) -> DbResult<Option<User>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let db_user = users::table
                .find(id_value)
                .select(UserDb::as_select())
                .first::<UserDb>(conn)
                .optional()
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Error fetching user {}: {}", id_value, e)))
                })?;
            Ok(db_user.map(|u| u.from_db()))
        })
    }

    pub fn get_quota(id_value: i64) -> DbResult<Option<i64>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            users::table
                .find(id_value)
                .select(users::dsl::quota)
                .first::<i64>(conn)
                .optional()
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Error fetching quota of user {}: {}",
                        id_value, e
                    )))
                })
        })
    }

    pub fn get_root_user_email() -> DbResult<Option<String>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let email = users::table
                .filter(users::dsl::role.eq(ROLE_ROOT))
                .order(users::dsl::id.asc())
                .select(users::dsl::email)
                .first::<Option<String>>(conn)
                .optional()
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Error fetching root user email: {}", e)))
                })?;
            Ok(email.flatten())
        })
    }

    /// Adds `delta` to the balance. A negative delta is a charge.
    pub fn adjust_quota(id_value: i64, delta: i64) -> DbResult<()> {
        let conn = &mut get_connection()?;
        let now = now_timestamp();
        db_execute!(conn, {
            let affected = diesel::update(users::table.find(id_value))
                .set((
                    users::dsl::quota.eq(users::dsl::quota + delta),
                    users::dsl::updated_at.eq(now),
                ))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Failed to adjust quota of user {}: {}",
                        id_value, e
                    )))
                })?;
            if affected == 0 {
                return Err(BaseError::NotFound(Some(format!("user {} not found", id_value))));
            }
            Ok(())
        })
    }

    /// Charges `quota` only if the balance covers it and returns the new balance.
    pub fn try_consume_quota(id_value: i64, quota_value: i64) -> DbResult<Option<i64>> {
        let conn = &mut get_connection()?;
        let now = now_timestamp();
        db_execute!(conn, {
            diesel::update(
                users::table
                    .filter(users::dsl::id.eq(id_value))
                    .filter(users::dsl::quota.ge(quota_value)),
            )
            .set((
                users::dsl::quota.eq(users::dsl::quota - quota_value),
                users::dsl::updated_at.eq(now),
            ))
            .returning(users::dsl::quota)
            .get_result::<i64>(conn)
            .optional()
            .map_err(|e| {
                BaseError::DatabaseFatal(Some(format!(
                    "Failed to consume quota of user {}: {}",
                    id_value, e
                )))
            })
        })
    }

    pub fn add_usage(id_value: i64, quota_value: i64, requests: i64) -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(users::table.find(id_value))
                .set((
                    users::dsl::used_quota.eq(users::dsl::used_quota + quota_value),
                    users::dsl::request_count.eq(users::dsl::request_count + requests),
                ))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Failed to record usage of user {}: {}",
                        id_value, e
                    )))
                })?;
            Ok(())
        })
    }
}

#[cfg(test)]
impl User {
    pub fn insert(user: &User) -> DbResult<()> {
        let conn = &mut get_connection()?;
        let u = user.clone();
        db_execute!(conn, {
            diesel::insert_into(users::table)
                .values((
                    users::dsl::id.eq(u.id),
                    users::dsl::username.eq(u.username),
                    users::dsl::email.eq(u.email),
                    users::dsl::role.eq(u.role),
                    users::dsl::status.eq(u.status),
                    users::dsl::user_group.eq(u.user_group),
                    users::dsl::quota.eq(u.quota),
                    users::dsl::used_quota.eq(u.used_quota),
                    users::dsl::request_count.eq(u.request_count),
                    users::dsl::created_at.eq(u.created_at),
                    users::dsl::updated_at.eq(u.updated_at),
                ))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to insert user: {}", e))))?;
            Ok(())
        })
    }
}
