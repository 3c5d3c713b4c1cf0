use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cyder_tools::log::{debug, error, warn};
use serde::Serialize;
use thiserror::Error;

use crate::database::channel::{Channel, ChannelConfig};
use crate::schema::enum_def::ChannelType;
use crate::service::store::{ChannelDirectory, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("invalid channel id")]
    BadChannelId,
    #[error("this channel has been disabled")]
    ChannelDisabled,
    #[error("no available channel for model {model} in group {group}")]
    NoChannelForModelAndGroup { group: String, model: String },
    #[error("channel data is inconsistent, please contact the administrator")]
    DirectoryInconsistent { channel_id: i64 },
    #[error("channel directory is temporarily unavailable")]
    DirectoryUnavailable,
}

/// Everything the relay needs to call the selected channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingContext {
    pub channel_type: ChannelType,
    pub channel_id: i64,
    pub channel_name: String,
    pub system_prompt: Option<String>,
    pub model_mapping: HashMap<String, String>,
    pub requested_model: String,
    pub upstream_model: String,
    #[serde(skip)]
    pub authorization: String,
    pub base_url: String,
    #[serde(skip)]
    pub config: ChannelConfig,
}

/// Config fields that older channels stored in the single `other` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatField {
    ApiVersion,
    LibraryId,
    Plugin,
}

const LEGACY_FIELDS: &[(ChannelType, CompatField)] = &[
    (ChannelType::Azure, CompatField::ApiVersion),
    (ChannelType::Xunfei, CompatField::ApiVersion),
    (ChannelType::Gemini, CompatField::ApiVersion),
    (ChannelType::AIProxyLibrary, CompatField::LibraryId),
    (ChannelType::Ali, CompatField::Plugin),
];

pub fn legacy_field(channel_type: ChannelType) -> Option<CompatField> {
    LEGACY_FIELDS
        .iter()
        .find(|(kind, _)| *kind == channel_type)
        .map(|(_, field)| *field)
}

/// Copies the legacy `other` value into its structured field when that field is empty.
pub fn backfill_legacy_config(channel_type: ChannelType, other: Option<&str>, config: &mut ChannelConfig) {
    let Some(other) = other.filter(|o| !o.is_empty()) else {
        return;
    };
    let Some(field) = legacy_field(channel_type) else {
        return;
    };
    let slot = match field {
        CompatField::ApiVersion => &mut config.api_version,
        CompatField::LibraryId => &mut config.library_id,
        CompatField::Plugin => &mut config.plugin,
    };
    if slot.is_empty() {
        *slot = other.to_string();
    }
}

impl RoutingContext {
    pub fn for_channel(channel: &Channel, requested_model: &str) -> Self {
        let channel_type = channel.kind();
        let mut config = channel.load_config().unwrap_or_else(|e| {
            warn!("channel #{} has malformed config: {}", channel.id, e);
            ChannelConfig::default()
        });
        backfill_legacy_config(channel_type, channel.other.as_deref(), &mut config);

        let model_mapping = channel.model_mapping_table();
        let upstream_model = model_mapping
            .get(requested_model)
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| requested_model.to_string());

        Self {
            channel_type,
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            system_prompt: channel.system_prompt.clone().filter(|p| !p.is_empty()),
            model_mapping,
            requested_model: requested_model.to_string(),
            upstream_model,
            authorization: format!("Bearer {}", channel.key),
            base_url: channel.effective_base_url(),
            config,
        }
    }
}

pub struct ChannelDistributor {
    directory: Arc<dyn ChannelDirectory>,
    lookup_timeout: Duration,
}

impl ChannelDistributor {
    pub fn new(directory: Arc<dyn ChannelDirectory>, lookup_timeout: Duration) -> Self {
        Self {
            directory,
            lookup_timeout,
        }
    }

    async fn bounded<T, F>(&self, lookup: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.lookup_timeout, lookup)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.lookup_timeout)))
    }

    /// Picks the channel for one request. `explicit_channel_id` is the raw
    /// override as presented by the caller.
    pub async fn distribute(
        &self,
        group: &str,
        model: &str,
        explicit_channel_id: Option<&str>,
    ) -> Result<RoutingContext, AdmissionError> {
        let channel = match explicit_channel_id {
            Some(raw) => self.explicit_channel(raw).await?,
            None => self.random_channel(group, model).await?,
        };
        debug!(
            "group: {}, request model: {}, using channel #{}",
            group, model, channel.id
        );
        Ok(RoutingContext::for_channel(&channel, model))
    }

    async fn explicit_channel(&self, raw: &str) -> Result<Channel, AdmissionError> {
        let id: i64 = raw.trim().parse().map_err(|_| AdmissionError::BadChannelId)?;
        let channel = self
            .bounded(self.directory.get_channel_by_id(id))
            .await
            .map_err(|e| {
                error!("failed to load channel #{}: {}", id, e);
                AdmissionError::DirectoryUnavailable
            })?
            .ok_or(AdmissionError::BadChannelId)?;
        if !channel.is_enabled() {
            return Err(AdmissionError::ChannelDisabled);
        }
        Ok(channel)
    }

    async fn random_channel(&self, group: &str, model: &str) -> Result<Channel, AdmissionError> {
        let picked = self
            .bounded(self.directory.random_satisfied_channel(group, model))
            .await
            .map_err(|e| {
                error!("failed to select channel for {}/{}: {}", group, model, e);
                AdmissionError::DirectoryUnavailable
            })?;
        let Some(channel_id) = picked else {
            return Err(AdmissionError::NoChannelForModelAndGroup {
                group: group.to_string(),
                model: model.to_string(),
            });
        };

        let resolved = self
            .bounded(self.directory.get_channel_by_id(channel_id))
            .await
            .map_err(|e| {
                error!("failed to load channel #{}: {}", channel_id, e);
                AdmissionError::DirectoryUnavailable
            })?;
        match resolved {
            Some(channel) if channel.is_enabled() => Ok(channel),
            Some(_) => {
                error!("channel #{} selected for {}/{} is not enabled", channel_id, group, model);
                Err(AdmissionError::DirectoryInconsistent { channel_id })
            }
            None => {
                error!("channel does not exist: #{}", channel_id);
                Err(AdmissionError::DirectoryInconsistent { channel_id })
            }
        }
    }
}
