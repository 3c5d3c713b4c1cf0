use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::service::store::StoreError;

#[derive(Debug)]
pub enum BaseError {
    ParamInvalid(Option<String>),
    DatabaseFatal(Option<String>),
    NotFound(Option<String>),
    Unauthorized(Option<String>),
    StoreError(Option<String>),
    InternalServerError(Option<String>),
}

impl std::fmt::Display for BaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, msg) = match self {
            BaseError::ParamInvalid(msg) => ("param invalid", msg),
            BaseError::DatabaseFatal(msg) => ("database error", msg),
            BaseError::NotFound(msg) => ("not found", msg),
            BaseError::Unauthorized(msg) => ("unauthorized", msg),
            BaseError::StoreError(msg) => ("store error", msg),
            BaseError::InternalServerError(msg) => ("internal server error", msg),
        };
        match msg {
            Some(msg) => write!(f, "{}: {}", kind, msg),
            None => f.write_str(kind),
        }
    }
}

impl std::error::Error for BaseError {}

impl From<StoreError> for BaseError {
    fn from(err: StoreError) -> Self {
        BaseError::StoreError(Some(err.to_string()))
    }
}

impl From<diesel::result::Error> for BaseError {
    fn from(err: diesel::result::Error) -> Self {
        BaseError::DatabaseFatal(Some(err.to_string()))
    }
}

impl IntoResponse for BaseError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message) = match self {
            BaseError::ParamInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                1001,
                msg.unwrap_or_else(|| "request params invalid".to_string()),
            ),
            BaseError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                1002,
                msg.unwrap_or_else(|| "data not found".to_string()),
            ),
            BaseError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                1003,
                msg.unwrap_or_else(|| "Unauthorized".to_string()),
            ),
            // Database and store details stay in the log.
            BaseError::DatabaseFatal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                1100,
                "database unknown error".to_string(),
            ),
            BaseError::StoreError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                1200,
                "store operation failed".to_string(),
            ),
            BaseError::InternalServerError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                0,
                msg.unwrap_or_else(|| "internal server error".to_string()),
            ),
        };
        let body = Json(json!({
            "code": error_code,
            "msg": error_message,
        }));
        (status, body).into_response()
    }
}
