use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
};
use cyder_tools::log::{error, info};
use serde::Serialize;

use super::BaseError;
use crate::schema::enum_def::ChannelStatus;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::HttpResult;

#[derive(Debug, Serialize)]
struct ChannelStatusView {
    id: i64,
    name: String,
    status: ChannelStatus,
}

async fn load_channel_name(app_state: &AppState, id: i64) -> Result<String, BaseError> {
    match app_state.directory.get_channel_by_id(id).await? {
        Some(channel) => Ok(channel.name),
        None => Err(BaseError::NotFound(Some(format!("channel {} not found", id)))),
    }
}

async fn enable(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<HttpResult<ChannelStatusView>, BaseError> {
    let name = load_channel_name(&app_state, id).await?;
    app_state.monitor.enable_channel(id, &name).await;
    let status = app_state
        .directory
        .get_channel_by_id(id)
        .await?
        .map(|c| c.status)
        .ok_or_else(|| BaseError::NotFound(Some(format!("channel {} not found", id))))?;
    if status != ChannelStatus::Enabled {
        error!("channel #{} could not be enabled", id);
        return Err(BaseError::InternalServerError(Some("failed to enable channel".to_string())));
    }
    Ok(HttpResult::new(ChannelStatusView { id, name, status }))
}

async fn disable(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<HttpResult<ChannelStatusView>, BaseError> {
    let name = load_channel_name(&app_state, id).await?;
    if !app_state
        .directory
        .update_channel_status(id, ChannelStatus::ManuallyDisabled)
        .await?
    {
        return Err(BaseError::NotFound(Some(format!("channel {} not found", id))));
    }
    info!("channel #{} ({}) disabled by an administrator", id, name);
    Ok(HttpResult::new(ChannelStatusView {
        id,
        name,
        status: ChannelStatus::ManuallyDisabled,
    }))
}

pub fn create_channel_router() -> StateRouter {
    create_state_router().nest(
        "/channel",
        create_state_router()
            .route("/{id}/enable", post(enable))
            .route("/{id}/disable", post(disable)),
    )
}
