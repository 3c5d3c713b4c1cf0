use diesel::prelude::*;

use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::{db_execute, db_object};

// One row per (group, model) a channel serves, mirroring the channel's status.
db_object! {
    #[derive(Queryable, Selectable)]
    #[diesel(table_name = abilities)]
    pub struct Ability {
        pub ability_group: String,
        pub model: String,
        pub channel_id: i64,
        pub enabled: bool,
    }
}

/// A routing candidate as the store of record sees it. `weight` is `None`
/// when the ability points at a channel row that no longer exists.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AbilityCandidate {
    pub channel_id: i64,
    pub weight: Option<i32>,
}

impl Ability {
    pub fn list_candidates(group: &str, model_name: &str) -> DbResult<Vec<AbilityCandidate>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = abilities::table
                .left_join(channels::table)
                .filter(abilities::dsl::ability_group.eq(group))
                .filter(abilities::dsl::model.eq(model_name))
                .filter(abilities::dsl::enabled.eq(true))
                .select((abilities::dsl::channel_id, channels::dsl::weight.nullable()))
                .load::<(i64, Option<i32>)>(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Error listing abilities for {}/{}: {}",
                        group, model_name, e
                    )))
                })?;
            Ok(rows
                .into_iter()
                .map(|(channel_id, weight)| AbilityCandidate { channel_id, weight })
                .collect())
        })
    }

    /// Every (group, model) row of a channel, whatever its enabled flag.
    pub fn list_by_channel(channel_id_value: i64) -> DbResult<Vec<Ability>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = abilities::table
                .filter(abilities::dsl::channel_id.eq(channel_id_value))
                .select(AbilityDb::as_select())
                .load::<AbilityDb>(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Error listing abilities of channel {}: {}",
                        channel_id_value, e
                    )))
                })?;
            Ok(rows.into_iter().map(|a| a.from_db()).collect())
        })
    }
}
