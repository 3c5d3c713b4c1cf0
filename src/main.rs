use std::net::SocketAddr;

use config::CONFIG;
use controller::{create_manager_router, handle_404};
use proxy::create_proxy_router;
use service::app_state::{create_app_state, create_state_router};

use cyder_tools::log::{error, info, LocalLogger};

mod config;
mod controller;
mod database;
mod proxy;
mod schema;
mod service;
mod utils;

#[tokio::main]
async fn main() {
    LocalLogger::init(&CONFIG.log_level);
    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);

    let app_state = match create_app_state().await {
        Ok(state) => state,
        Err(e) => {
            error!("failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    let routes = create_state_router()
        .merge(create_proxy_router(app_state.clone()))
        .merge(create_manager_router(app_state.clone()));
    let base_path = CONFIG.base_path.trim_end_matches('/');
    let app = if base_path.is_empty() {
        routes
    } else {
        create_state_router().nest(base_path, routes)
    }
    .fallback(handle_404)
    .with_state(app_state);

    info!("server start at {}", &addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("failed to start server");
}
