use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use cyder_tools::log::{error, info, warn};
use serde_json::Value;

use super::auth::{AuthContext, BODY_LIMIT};
use super::error::ProxyError;
use crate::service::app_state::AppState;
use crate::service::distributor::RoutingContext;
use crate::service::monitor::UpstreamFailure;
use crate::service::relay::{RelayRequest, RelayResponse};
use crate::utils::quota::format_quota;

/// Reserves the estimate, relays, then settles against the reported usage.
pub async fn relay_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(context): Extension<RoutingContext>,
    request: Request,
) -> Result<Response, ProxyError> {
    let endpoint = request.uri().path().to_string();
    let bytes = to_bytes(request.into_body(), BODY_LIMIT)
        .await
        .map_err(|e| ProxyError::bad_request(format!("failed to read request body: {}", e)))?;
    let body: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ProxyError::bad_request(format!("invalid request body: {}", e)))?;

    let estimate = app_state.pre_consumed_quota;
    app_state.ledger.pre_consume(auth.token_id, estimate).await?;

    let outcome = app_state
        .relay
        .relay(&context, RelayRequest { endpoint, body })
        .await;

    let response = match outcome {
        Ok(response) if response.is_success() => response,
        Ok(response) => {
            refund(&app_state, &auth, estimate).await;
            let failure = UpstreamFailure::from_response(response.status, &response.body);
            warn!(
                "channel #{} ({}) failed with status {}: {}",
                context.channel_id, context.channel_name, failure.status, failure.message
            );
            app_state
                .monitor
                .handle_failure(context.channel_id, &context.channel_name, &failure)
                .await;
            app_state.monitor.record_outcome(context.channel_id, false).await;
            return Ok(passthrough(response));
        }
        Err(e) => {
            refund(&app_state, &auth, estimate).await;
            error!("relay to channel #{} failed: {}", context.channel_id, e);
            app_state.monitor.record_outcome(context.channel_id, false).await;
            return Err(ProxyError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unreachable",
                "failed to reach the upstream service",
            ));
        }
    };

    let actual = response.usage.map(|u| u.quota()).unwrap_or(estimate);
    if let Err(e) = app_state.ledger.post_consume(auth.token_id, actual - estimate).await {
        error!(
            "failed to settle token #{} (account #{}) for {}: {}",
            auth.token_id, auth.account_id, actual, e
        );
    }
    if let Err(e) = app_state
        .ledger
        .record_usage(auth.account_id, context.channel_id, actual)
        .await
    {
        error!("failed to record usage of account #{}: {}", auth.account_id, e);
    }
    app_state.monitor.record_outcome(context.channel_id, true).await;
    info!(
        "token {} used {} on channel #{} ({})",
        auth.token_name,
        format_quota(actual, app_state.display_in_currency, app_state.quota_per_unit),
        context.channel_id,
        context.upstream_model
    );
    Ok(passthrough(response))
}

async fn refund(app_state: &AppState, auth: &AuthContext, estimate: i64) {
    if let Err(e) = app_state.ledger.post_consume(auth.token_id, -estimate).await {
        error!(
            "failed to refund {} to token #{} (account #{}): {}",
            estimate, auth.token_id, auth.account_id, e
        );
    }
}

fn passthrough(response: RelayResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .content_type
        .unwrap_or_else(|| "application/json".to_string());
    (status, [(CONTENT_TYPE, content_type)], Body::from(response.body)).into_response()
}
