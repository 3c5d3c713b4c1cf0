use std::sync::Arc;

use axum::{http, middleware, response::IntoResponse};

use crate::service::app_state::{create_state_router, AppState, StateRouter};
use auth::secret_key_middleware;
use channel::create_channel_router;
use system::create_system_router;

mod auth;
mod channel;
mod error;
mod system;

pub use error::BaseError;

pub fn create_manager_router(app_state: Arc<AppState>) -> StateRouter {
    let api_router = create_state_router().nest(
        "/api",
        create_state_router()
            .merge(create_channel_router())
            .merge(create_system_router())
            .layer(middleware::from_fn_with_state(app_state, secret_key_middleware)),
    );

    create_state_router().nest("/manager", api_router)
}

pub async fn handle_404() -> impl IntoResponse {
    (http::StatusCode::NOT_FOUND, "not found")
}
