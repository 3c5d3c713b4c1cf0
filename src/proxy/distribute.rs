use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use cyder_tools::log::error;

use super::auth::{AuthContext, RequestModel};
use super::error::ProxyError;
use crate::service::app_state::AppState;
use crate::service::distributor::AdmissionError;

pub const DEFAULT_GROUP: &str = "default";

/// Resolves the caller's group and attaches the chosen channel's `RoutingContext`.
pub async fn distribute_middleware(
    State(app_state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let (auth, model) = match (
        request.extensions().get::<AuthContext>(),
        request.extensions().get::<RequestModel>(),
    ) {
        (Some(auth), Some(RequestModel(model))) => (auth.clone(), model.clone()),
        _ => {
            error!("distribute middleware reached without an authenticated request");
            return Err(AdmissionError::DirectoryUnavailable.into());
        }
    };

    let group = match app_state.directory.group_for_account(auth.account_id).await {
        Ok(group) => group
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
        Err(e) => {
            error!("failed to resolve group of account #{}: {}", auth.account_id, e);
            return Err(AdmissionError::DirectoryUnavailable.into());
        }
    };

    let context = app_state
        .distributor
        .distribute(&group, &model, auth.specific_channel_id.as_deref())
        .await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
