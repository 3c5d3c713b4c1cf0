use std::sync::Arc;

use cyder_tools::log::{error, info, warn};
use serde::Deserialize;

use crate::config::MonitorConfig;
use crate::schema::enum_def::ChannelStatus;
use crate::service::metric::MetricWindow;
use crate::service::notify::{email_template, escape_html, Notifier};
use crate::service::store::ChannelDirectory;

const STATUS_CHANGE_SUBJECT: &str = "Channel status change alert!";

/// What an upstream said when a relayed call failed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamFailure {
    #[serde(skip)]
    pub status: u16,
    #[serde(default, rename = "type")]
    pub error_type: String,
    #[serde(default, deserialize_with = "code_as_string")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

fn code_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl UpstreamFailure {
    /// Reads an OpenAI-style `{"error": {...}}` body, keeping whatever fields exist.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: UpstreamFailure,
        }
        let mut failure = serde_json::from_slice::<Envelope>(body)
            .map(|e| e.error)
            .unwrap_or_else(|_| UpstreamFailure {
                message: String::from_utf8_lossy(body).chars().take(512).collect(),
                ..Default::default()
            });
        failure.status = status;
        failure
    }
}

const DISABLING_MESSAGES: &[&str] = &[
    "your access was terminated",
    "violation of our policies",
    "your credit balance is too low",
    "organization has been disabled",
    "credit",
    "balance",
    "permission denied",
    "organization has been restricted",
    "api key not valid",
    "api key expired",
    "已欠费",
];

/// Whether a failure means the channel's credentials or account are unusable.
pub fn should_disable_channel(failure: &UpstreamFailure) -> bool {
    if failure.status == 401 {
        return true;
    }
    if matches!(
        failure.error_type.as_str(),
        "insufficient_quota" | "authentication_error" | "permission_error" | "forbidden"
    ) {
        return true;
    }
    if matches!(failure.code.as_str(), "invalid_api_key" | "account_deactivated") {
        return true;
    }
    let message = failure.message.to_lowercase();
    DISABLING_MESSAGES.iter().any(|needle| message.contains(needle))
}

/// A probe that completed without transport error or upstream error proves the channel usable.
pub fn should_enable_channel(transport_ok: bool, failure: Option<&UpstreamFailure>) -> bool {
    transport_ok && failure.is_none()
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub metric_queue_size: usize,
    pub metric_success_rate_threshold: f64,
    pub automatic_disable: bool,
    pub automatic_enable: bool,
    pub system_name: String,
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig, system_name: &str) -> Self {
        Self {
            metric_queue_size: config.metric_queue_size,
            metric_success_rate_threshold: config.metric_success_rate_threshold,
            automatic_disable: config.automatic_disable_channel_enabled,
            automatic_enable: config.automatic_enable_channel_enabled,
            system_name: system_name.to_string(),
        }
    }
}

pub struct ChannelMonitor {
    directory: Arc<dyn ChannelDirectory>,
    notifier: Notifier,
    window: MetricWindow,
    settings: MonitorSettings,
}

impl ChannelMonitor {
    pub fn new(directory: Arc<dyn ChannelDirectory>, notifier: Notifier, settings: MonitorSettings) -> Self {
        let window = MetricWindow::new(settings.metric_queue_size, settings.metric_success_rate_threshold);
        Self {
            directory,
            notifier,
            window,
            settings,
        }
    }

    async fn set_status(&self, channel_id: i64, status: ChannelStatus) -> bool {
        match self.directory.update_channel_status(channel_id, status).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("channel #{} not found, status {} not applied", channel_id, status);
                false
            }
            Err(e) => {
                error!("failed to set channel #{} to {}: {}", channel_id, status, e);
                false
            }
        }
    }

    pub async fn disable_channel(&self, channel_id: i64, channel_name: &str, reason: &str) {
        if !self.set_status(channel_id, ChannelStatus::AutoDisabled).await {
            return;
        }
        info!("channel #{} has been disabled: {}", channel_id, reason);
        let body = format!(
            r#"<p>Hello!</p>
<p>The channel "<strong>{}</strong>" (#{}) has been disabled.</p>
<p>Reason for ban:</p>
<p style="background-color: #f8f8f8; padding: 10px; border-radius: 4px;">{}</p>"#,
            escape_html(channel_name),
            channel_id,
            escape_html(reason)
        );
        self.notifier.notify_root(
            STATUS_CHANGE_SUBJECT,
            email_template(&self.settings.system_name, STATUS_CHANGE_SUBJECT, &body),
        );
    }

    pub async fn metric_disable_channel(&self, channel_id: i64, success_rate: f64) {
        if !self.set_status(channel_id, ChannelStatus::AutoDisabled).await {
            return;
        }
        info!(
            "channel #{} has been disabled due to low success rate: {:.2}%",
            channel_id,
            success_rate * 100.0
        );
        let body = format!(
            r#"<p>Hello!</p>
<p>Channel #{} has been automatically disabled by the system.</p>
<p>Reason for ban:</p>
<p style="background-color: #f8f8f8; padding: 10px; border-radius: 4px;">This channel's success rate in the last {} calls: <strong>{:.2}%</strong>, below system threshold <strong>{:.2}%</strong>.</p>"#,
            channel_id,
            self.window.size(),
            success_rate * 100.0,
            self.window.threshold() * 100.0
        );
        self.notifier.notify_root(
            STATUS_CHANGE_SUBJECT,
            email_template(&self.settings.system_name, STATUS_CHANGE_SUBJECT, &body),
        );
    }

    pub async fn enable_channel(&self, channel_id: i64, channel_name: &str) {
        if !self.set_status(channel_id, ChannelStatus::Enabled).await {
            return;
        }
        self.window.reset(channel_id);
        info!("channel #{} has been enabled", channel_id);
        let body = format!(
            r#"<p>Hello!</p>
<p>Channel "<strong>{}</strong>" (#{}) has been re-enabled.</p>
<p>You can continue using the channel now.</p>"#,
            escape_html(channel_name),
            channel_id
        );
        self.notifier.notify_root(
            STATUS_CHANGE_SUBJECT,
            email_template(&self.settings.system_name, STATUS_CHANGE_SUBJECT, &body),
        );
    }

    /// Feeds the rolling success-rate window of a channel.
    pub async fn record_outcome(&self, channel_id: i64, success: bool) {
        if !self.settings.automatic_disable {
            return;
        }
        if let Some(rate) = self.window.record(channel_id, success) {
            self.metric_disable_channel(channel_id, rate).await;
        }
    }

    /// Disables the channel right away when the failure says its credentials are dead.
    pub async fn handle_failure(&self, channel_id: i64, channel_name: &str, failure: &UpstreamFailure) {
        if self.settings.automatic_disable && should_disable_channel(failure) {
            let reason = format!("status {}: {}", failure.status, failure.message);
            self.disable_channel(channel_id, channel_name, &reason).await;
        }
    }

    /// Re-enables an auto-disabled channel after a clean probe.
    pub async fn handle_probe(
        &self,
        channel_id: i64,
        channel_name: &str,
        status: ChannelStatus,
        transport_ok: bool,
        failure: Option<&UpstreamFailure>,
    ) {
        if self.settings.automatic_enable
            && status == ChannelStatus::AutoDisabled
            && should_enable_channel(transport_ok, failure)
        {
            self.enable_channel(channel_id, channel_name).await;
        }
    }
}
