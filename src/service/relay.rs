use async_trait::async_trait;
use bytes::Bytes;
use cyder_tools::log::{debug, error};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Proxy;
use serde_json::{json, Value};
use thiserror::Error;

use crate::schema::enum_def::ChannelType;
use crate::service::distributor::RoutingContext;
use crate::utils::billing::{parse_usage_info, UsageInfo};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to build upstream request: {0}")]
    Build(String),
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A relay call as the handler hands it over: the OpenAI path and the JSON body.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub endpoint: String,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub usage: Option<UsageInfo>,
}

impl RelayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Relay: Send + Sync {
    async fn relay(&self, context: &RoutingContext, request: RelayRequest) -> Result<RelayResponse, RelayError>;
}

/// Rewrites the model, injects the channel's system prompt and forwards the
/// body to an OpenAI-compatible upstream.
pub fn prepare_body(context: &RoutingContext, endpoint: &str, mut body: Value) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(context.upstream_model.clone()));
        obj.remove("stream");
    }
    if let Some(prompt) = &context.system_prompt {
        if endpoint.ends_with("/chat/completions") {
            if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
                let has_system = messages
                    .first()
                    .and_then(|m| m.get("role"))
                    .and_then(Value::as_str)
                    == Some("system");
                if has_system {
                    messages[0]["content"] = Value::String(prompt.clone());
                } else {
                    messages.insert(0, json!({"role": "system", "content": prompt}));
                }
            }
        }
    }
    body
}

/// Target URL for a call. Azure deployments carry the model in the path.
pub fn upstream_url(context: &RoutingContext, endpoint: &str) -> String {
    let base = context.base_url.trim_end_matches('/');
    match context.channel_type {
        ChannelType::Azure => {
            let task = endpoint.trim_start_matches("/v1");
            let api_version = if context.config.api_version.is_empty() {
                "2024-02-01"
            } else {
                context.config.api_version.as_str()
            };
            format!(
                "{}/openai/deployments/{}{}?api-version={}",
                base,
                context.upstream_model.replace('.', ""),
                task,
                api_version
            )
        }
        _ => format!("{}{}", base, endpoint),
    }
}

pub struct PassthroughRelay {
    client: reqwest::Client,
}

impl PassthroughRelay {
    pub fn new(proxy_url: Option<&str>) -> Result<Self, RelayError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy_url) = proxy_url.filter(|u| !u.is_empty()) {
            let proxy = Proxy::https(proxy_url).map_err(|e| {
                error!("Invalid proxy URL '{}': {}", proxy_url, e);
                RelayError::Build(format!("invalid proxy configuration: {}", e))
            })?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Relay for PassthroughRelay {
    async fn relay(&self, context: &RoutingContext, request: RelayRequest) -> Result<RelayResponse, RelayError> {
        let url = upstream_url(context, &request.endpoint);
        let body = prepare_body(context, &request.endpoint, request.body);
        debug!("relaying to channel #{}: {}", context.channel_id, url);

        let mut builder = self.client.post(&url).json(&body);
        builder = match context.channel_type {
            ChannelType::Azure => builder.header("api-key", context.authorization.trim_start_matches("Bearer ")),
            _ => builder.header(AUTHORIZATION, &context.authorization),
        };
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        let usage = if (200..300).contains(&status) {
            serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|v| parse_usage_info(&v))
        } else {
            None
        };
        Ok(RelayResponse {
            status,
            content_type,
            body: bytes,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::{Channel, ChannelConfig};

    fn context(channel_type: ChannelType, system_prompt: Option<&str>) -> RoutingContext {
        let channel = Channel {
            id: 1,
            channel_type: channel_type.code(),
            key: "k".to_string(),
            base_url: Some("https://upstream.example.com/".to_string()),
            system_prompt: system_prompt.map(str::to_string),
            model_mapping: Some(r#"{"gpt-4":"gpt-4.1"}"#.to_string()),
            ..Default::default()
        };
        RoutingContext::for_channel(&channel, "gpt-4")
    }

    #[test]
    fn body_uses_upstream_model_and_prompt() {
        let ctx = context(ChannelType::OpenAI, Some("be brief"));
        let body = prepare_body(
            &ctx,
            "/v1/chat/completions",
            json!({"model": "gpt-4", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        );
        assert_eq!(body["model"], "gpt-4.1");
        assert!(body.get("stream").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn existing_system_message_is_replaced() {
        let ctx = context(ChannelType::OpenAI, Some("channel prompt"));
        let body = prepare_body(
            &ctx,
            "/v1/chat/completions",
            json!({"messages": [{"role": "system", "content": "user prompt"}]}),
        );
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"], "channel prompt");
    }

    #[test]
    fn urls_per_channel_type() {
        let ctx = context(ChannelType::OpenAI, None);
        assert_eq!(
            upstream_url(&ctx, "/v1/embeddings"),
            "https://upstream.example.com/v1/embeddings"
        );

        let mut azure = context(ChannelType::Azure, None);
        azure.config = ChannelConfig {
            api_version: "2023-05-15".to_string(),
            ..Default::default()
        };
        assert_eq!(
            upstream_url(&azure, "/v1/chat/completions"),
            "https://upstream.example.com/openai/deployments/gpt-41/chat/completions?api-version=2023-05-15"
        );
    }
}
