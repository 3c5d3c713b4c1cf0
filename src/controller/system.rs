use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
};
use serde::Serialize;

use super::BaseError;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::service::batch::BatchUpdateRecord;
use crate::utils::HttpResult;

async fn reload_cache(State(app_state): State<Arc<AppState>>) -> Result<HttpResult<()>, BaseError> {
    let Some(cache) = app_state.cache.as_ref() else {
        return Err(BaseError::NotFound(Some("no cache configured".to_string())));
    };
    cache.clear_cache().await;
    cache.reload().await;
    Ok(HttpResult::new(()))
}

#[derive(Debug, Serialize)]
struct PendingBatch {
    enabled: bool,
    records: Vec<BatchUpdateRecord>,
}

async fn pending_batch(State(app_state): State<Arc<AppState>>) -> HttpResult<PendingBatch> {
    let view = match app_state.ledger.batch() {
        Some(batch) => PendingBatch {
            enabled: true,
            records: batch.snapshot(),
        },
        None => PendingBatch {
            enabled: false,
            records: Vec::new(),
        },
    };
    HttpResult::new(view)
}

pub fn create_system_router() -> StateRouter {
    create_state_router()
        .route("/cache/reload", post(reload_cache))
        .route("/batch/pending", get(pending_batch))
}
