use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http,
    middleware::Next,
    response::Response,
};
use cyder_tools::log::warn;

use super::BaseError;
use crate::service::app_state::AppState;

/// Admin routes take `Authorization: Bearer <secret_key>`.
pub async fn secret_key_middleware(
    State(app_state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, BaseError> {
    let provided = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);
    match provided {
        Some(key) if !key.is_empty() && key == app_state.secret_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("admin request with a wrong secret key");
            Err(BaseError::Unauthorized(Some("invalid secret key".to_string())))
        }
        None => Err(BaseError::Unauthorized(None)),
    }
}
