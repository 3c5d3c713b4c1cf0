use std::collections::HashMap;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::{get_connection, DbResult};
use crate::controller::BaseError;
use crate::schema::enum_def::{ChannelStatus, ChannelType};
use crate::{db_execute, db_object};
use cyder_tools::log::warn;

db_object! {
    #[derive(Queryable, Selectable, Identifiable)]
    #[diesel(table_name = channels)]
    pub struct Channel {
        pub id: i64,
        pub channel_type: i32,
        pub key: String,
        pub status: ChannelStatus,
        pub name: String,
        pub weight: i32,
        pub created_time: i64,
        pub test_time: i64,
        pub response_time: i32,
        pub base_url: Option<String>,
        pub other: Option<String>,
        pub models: String,
        pub channel_group: String,
        pub used_quota: i64,
        pub model_mapping: Option<String>,
        pub config: String,
        pub system_prompt: Option<String>,
    }
}

/// Per-channel settings stored as a JSON document in `channels.config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sk: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ak: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub library_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plugin: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vertex_ai_project_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vertex_ai_adc: String,
}

impl Channel {
    pub fn kind(&self) -> ChannelType {
        ChannelType::from_code(self.channel_type)
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    /// Configured base URL, or the vendor default when none is set.
    pub fn effective_base_url(&self) -> String {
        match self.base_url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => self.kind().default_base_url().to_string(),
        }
    }

    pub fn load_config(&self) -> Result<ChannelConfig, serde_json::Error> {
        if self.config.trim().is_empty() {
            return Ok(ChannelConfig::default());
        }
        serde_json::from_str(&self.config)
    }

    /// Model rename table. Malformed JSON yields an empty table.
    pub fn model_mapping_table(&self) -> HashMap<String, String> {
        match self.model_mapping.as_deref().map(str::trim) {
            None | Some("") | Some("{}") => HashMap::new(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                warn!("channel {} has malformed model_mapping: {}", self.id, e);
                HashMap::new()
            }),
        }
    }

    pub fn get_by_id(id_value: i64) -> DbResult<Option<Channel>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let db_channel = channels::table
                .find(id_value)
                .select(ChannelDb::as_select())
                .first::<ChannelDb>(conn)
                .optional()
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Error fetching channel {}: {}", id_value, e)))
                })?;
            Ok(db_channel.map(|c| c.from_db()))
        })
    }

    pub fn list_all() -> DbResult<Vec<Channel>> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            let rows = channels::table
                .order(channels::dsl::id.asc())
                .select(ChannelDb::as_select())
                .load::<ChannelDb>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Error listing channels: {}", e))))?;
            Ok(rows.into_iter().map(|c| c.from_db()).collect())
        })
    }

    /// Updates the channel row and the `enabled` flag of its abilities together.
    /// Returns false when no channel has `id_value`.
    pub fn update_status(id_value: i64, status_value: ChannelStatus) -> DbResult<bool> {
        let conn = &mut get_connection()?;
        let enabled = status_value == ChannelStatus::Enabled;
        db_execute!(conn, {
            conn.transaction::<bool, diesel::result::Error, _>(|conn| {
                let affected = diesel::update(channels::table.find(id_value))
                    .set(channels::dsl::status.eq(status_value))
                    .execute(conn)?;
                if affected == 0 {
                    return Ok(false);
                }
                diesel::update(abilities::table.filter(abilities::dsl::channel_id.eq(id_value)))
                    .set(abilities::dsl::enabled.eq(enabled))
                    .execute(conn)?;
                Ok(true)
            })
            .map_err(|e| {
                BaseError::DatabaseFatal(Some(format!(
                    "Failed to update status of channel {}: {}",
                    id_value, e
                )))
            })
        })
    }

    pub fn add_used_quota(id_value: i64, quota_value: i64) -> DbResult<()> {
        let conn = &mut get_connection()?;
        db_execute!(conn, {
            diesel::update(channels::table.find(id_value))
                .set(channels::dsl::used_quota.eq(channels::dsl::used_quota + quota_value))
                .execute(conn)
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!(
                        "Failed to add used quota of channel {}: {}",
                        id_value, e
                    )))
                })?;
            Ok(())
        })
    }
}
