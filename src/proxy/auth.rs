use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use cyder_tools::log::{error, warn};
use serde::Deserialize;

use super::error::ProxyError;
use crate::service::app_state::AppState;

pub const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Who is calling, attached to the request by [`token_auth_middleware`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub token_id: i64,
    pub token_name: String,
    pub account_id: i64,
    /// Raw channel override from `<key>-<channel id>`, admins only.
    pub specific_channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestModel(pub String);

/// Splits `Bearer sk-<key>[-<channel id>]` into the key and the optional override.
pub fn split_credential(header: &str) -> (String, Option<String>) {
    let raw = header.trim();
    let raw = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    let raw = raw.strip_prefix("sk-").unwrap_or(raw);
    let mut parts = raw.split('-');
    let key = parts.next().unwrap_or_default().to_string();
    let channel = parts.next().map(str::to_string);
    (key, channel)
}

#[derive(Deserialize)]
struct ModelField {
    #[serde(default)]
    model: String,
}

pub async fn token_auth_middleware(
    State(app_state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let (key, specific_channel_id) = split_credential(header);
    let token = app_state.authenticator.validate(&key).await?;

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ip_allowed = match client_ip {
        Some(ip) => token.allows_ip(ip),
        None => token.subnet.as_deref().is_none_or(|s| s.trim().is_empty()),
    };
    if !ip_allowed {
        warn!("token #{} used from disallowed address {:?}", token.id, client_ip);
        return Err(ProxyError::ip_not_allowed());
    }

    let (mut parts, body) = request.into_parts();
    let bytes = to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|e| ProxyError::bad_request(format!("failed to read request body: {}", e)))?;
    let model = serde_json::from_slice::<ModelField>(&bytes)
        .map_err(|e| ProxyError::bad_request(format!("invalid request body: {}", e)))?
        .model;
    if model.is_empty() {
        return Err(ProxyError::bad_request("model is required"));
    }
    if !token.allows_model(&model) {
        return Err(ProxyError::model_not_allowed(&model));
    }

    if specific_channel_id.is_some() {
        let is_admin = match app_state.accounts.get_account(token.user_id).await {
            Ok(account) => account.is_some_and(|a| a.is_admin()),
            Err(e) => {
                error!("failed to load account #{}: {}", token.user_id, e);
                false
            }
        };
        if !is_admin {
            return Err(ProxyError::new(
                axum::http::StatusCode::FORBIDDEN,
                "channel_override_forbidden",
                "only administrators can specify a channel",
            ));
        }
    }

    parts.extensions.insert(AuthContext {
        token_id: token.id,
        token_name: token.name,
        account_id: token.user_id,
        specific_channel_id,
    });
    parts.extensions.insert(RequestModel(model));
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
