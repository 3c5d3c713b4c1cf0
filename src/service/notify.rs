use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cyder_tools::log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::NotifyConfig;
use crate::service::store::AccountStore;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport not configured")]
    NotConfigured,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub title: String,
    pub description: String,
    pub content: String,
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn push_enabled(&self) -> bool;
    async fn push(&self, message: &Message) -> Result<(), NotifyError>;
    async fn email(&self, to: &str, subject: &str, content: &str) -> Result<(), NotifyError>;
}

/// Push through a message-pusher endpoint, mail through an HTTP mail relay.
pub struct HttpTransport {
    client: reqwest::Client,
    pusher_address: String,
    pusher_token: String,
    relay_url: String,
    relay_token: String,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    title: &'a str,
    description: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    token: &'a str,
}

#[derive(Deserialize)]
struct PushResponse {
    success: bool,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct MailRequest<'a> {
    to: &'a str,
    subject: &'a str,
    content: &'a str,
}

impl HttpTransport {
    pub fn from_config(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            pusher_address: config.message_pusher_address.clone(),
            pusher_token: config.message_pusher_token.clone(),
            relay_url: config.email_relay_url.clone(),
            relay_token: config.email_relay_token.clone(),
        })
    }
}

#[async_trait]
impl NotificationTransport for HttpTransport {
    fn push_enabled(&self) -> bool {
        !self.pusher_address.is_empty()
    }

    async fn push(&self, message: &Message) -> Result<(), NotifyError> {
        if !self.push_enabled() {
            return Err(NotifyError::NotConfigured);
        }
        let body = PushRequest {
            title: &message.title,
            description: &message.description,
            content: &message.content,
            token: &self.pusher_token,
        };
        let response: PushResponse = self
            .client
            .post(&self.pusher_address)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(NotifyError::Rejected(response.message))
        }
    }

    async fn email(&self, to: &str, subject: &str, content: &str) -> Result<(), NotifyError> {
        if self.relay_url.is_empty() {
            return Err(NotifyError::NotConfigured);
        }
        let mut request = self
            .client
            .post(&self.relay_url)
            .json(&MailRequest { to, subject, content });
        if !self.relay_token.is_empty() {
            request = request.bearer_auth(&self.relay_token);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Escapes text interpolated into mail HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wraps a body fragment in the HTML layout used by every outgoing mail.
pub fn email_template(system_name: &str, title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; color: #333; line-height: 1.6;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="border-bottom: 1px solid #eee; padding-bottom: 10px;">{title}</h2>
    <div>{body}</div>
    <p style="color: #999; font-size: 12px; margin-top: 30px;">This message was sent automatically by {system_name}.</p>
  </div>
</body>
</html>"#
    )
}

#[derive(Debug)]
enum Notification {
    Root { subject: String, content: String },
    Account { email: String, subject: String, content: String },
}

/// Cheap handle onto the notification queue. Sending never blocks the caller;
/// a full queue drops the message with a warning.
#[derive(Clone)]
pub struct Notifier {
    sender: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn spawn(
        transport: Arc<dyn NotificationTransport>,
        accounts: Arc<dyn AccountStore>,
        root_email: Option<String>,
        timeout: Duration,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Notification>(QUEUE_CAPACITY);
        let mut worker = NotifyWorker {
            transport,
            accounts,
            root_email: root_email.filter(|e| !e.is_empty()),
            timeout,
        };
        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                worker.deliver(notification).await;
            }
            debug!("notification queue closed");
        });
        Self { sender }
    }

    pub fn notify_root(&self, subject: impl Into<String>, content: impl Into<String>) {
        self.enqueue(Notification::Root {
            subject: subject.into(),
            content: content.into(),
        });
    }

    pub fn notify_account(&self, email: impl Into<String>, subject: impl Into<String>, content: impl Into<String>) {
        self.enqueue(Notification::Account {
            email: email.into(),
            subject: subject.into(),
            content: content.into(),
        });
    }

    fn enqueue(&self, notification: Notification) {
        if let Err(e) = self.sender.try_send(notification) {
            warn!("dropping notification: {}", e);
        }
    }
}

struct NotifyWorker {
    transport: Arc<dyn NotificationTransport>,
    accounts: Arc<dyn AccountStore>,
    root_email: Option<String>,
    timeout: Duration,
}

impl NotifyWorker {
    async fn deliver(&mut self, notification: Notification) {
        match notification {
            Notification::Root { subject, content } => self.notify_root(&subject, &content).await,
            Notification::Account { email, subject, content } => {
                self.send_email(&email, &subject, &content).await;
            }
        }
    }

    async fn notify_root(&mut self, subject: &str, content: &str) {
        if self.transport.push_enabled() {
            let message = Message {
                title: subject.to_string(),
                description: content.to_string(),
                content: content.to_string(),
            };
            match tokio::time::timeout(self.timeout, self.transport.push(&message)).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => error!("failed to push message: {}", e),
                Err(_) => error!("pushing message timed out after {:?}", self.timeout),
            }
        }

        match self.root_email().await {
            Some(to) => self.send_email(&to, subject, content).await,
            None => warn!("no root email known, dropping notification '{}'", subject),
        }
    }

    async fn send_email(&self, to: &str, subject: &str, content: &str) {
        match tokio::time::timeout(self.timeout, self.transport.email(to, subject, content)).await {
            Ok(Ok(())) => debug!("notification '{}' mailed", subject),
            Ok(Err(e)) => error!("failed to send email: {}", e),
            Err(_) => error!("sending email timed out after {:?}", self.timeout),
        }
    }

    /// Configured address, else the root account's, looked up once and kept.
    async fn root_email(&mut self) -> Option<String> {
        if self.root_email.is_none() {
            match self.accounts.get_root_email().await {
                Ok(email) => self.root_email = email.filter(|e| !e.is_empty()),
                Err(e) => error!("failed to look up root email: {}", e),
            }
        }
        self.root_email.clone()
    }
}
