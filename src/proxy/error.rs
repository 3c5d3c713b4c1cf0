use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::service::distributor::AdmissionError;
use crate::service::ledger::{FundsScope, LedgerError};
use crate::service::token_auth::AuthError;

const ERROR_TYPE: &str = "gateway_error";

/// A rejected relay request, rendered in the OpenAI error envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ProxyError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn model_not_allowed(model: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "model_not_allowed",
            format!("this token has no access to model {}", model),
        )
    }

    pub fn ip_not_allowed() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "ip_not_allowed",
            "this token cannot be used from your IP address",
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": ERROR_TYPE,
                "code": self.code,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<AuthError> for ProxyError {
    fn from(err: AuthError) -> Self {
        let (status, code) = match &err {
            AuthError::NoCredential => (StatusCode::UNAUTHORIZED, "no_credential"),
            AuthError::InvalidCredential => (StatusCode::UNAUTHORIZED, "invalid_credential"),
            AuthError::VerificationFailed => (StatusCode::UNAUTHORIZED, "verification_failed"),
            AuthError::Disabled => (StatusCode::UNAUTHORIZED, "token_disabled"),
            AuthError::Expired => (StatusCode::UNAUTHORIZED, "token_expired"),
            AuthError::Exhausted { .. } => (StatusCode::UNAUTHORIZED, "token_exhausted"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<AdmissionError> for ProxyError {
    fn from(err: AdmissionError) -> Self {
        let (status, code) = match &err {
            AdmissionError::BadChannelId => (StatusCode::BAD_REQUEST, "bad_channel_id"),
            AdmissionError::ChannelDisabled => (StatusCode::FORBIDDEN, "channel_disabled"),
            AdmissionError::NoChannelForModelAndGroup { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_channel_for_model_and_group")
            }
            AdmissionError::DirectoryInconsistent { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "directory_inconsistent")
            }
            AdmissionError::DirectoryUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "directory_unavailable"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<LedgerError> for ProxyError {
    fn from(err: LedgerError) -> Self {
        let (status, code) = match &err {
            LedgerError::NegativeQuota => (StatusCode::BAD_REQUEST, "negative_quota"),
            LedgerError::UnknownToken(_) => (StatusCode::UNAUTHORIZED, "unknown_token"),
            LedgerError::InsufficientFunds(FundsScope::Token) => {
                (StatusCode::FORBIDDEN, "insufficient_token_quota")
            }
            LedgerError::InsufficientFunds(FundsScope::Account) => {
                (StatusCode::FORBIDDEN, "insufficient_account_quota")
            }
            LedgerError::PersistenceFailed => (StatusCode::INTERNAL_SERVER_ERROR, "persistence_failed"),
        };
        // ids stay in the log
        let message = match &err {
            LedgerError::UnknownToken(_) => "token not found".to_string(),
            _ => err.to_string(),
        };
        Self::new(status, code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[tokio::test]
    async fn renders_openai_envelope() {
        let response = ProxyError::from(AdmissionError::ChannelDisabled).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "channel_disabled");
        assert_eq!(value["error"]["type"], "gateway_error");
        assert_eq!(value["error"]["message"], "this channel has been disabled");
    }

    #[test]
    fn internal_ids_are_not_exposed() {
        let err = ProxyError::from(LedgerError::UnknownToken(4242));
        assert!(!err.message.contains("4242"));
        let err = ProxyError::from(AdmissionError::DirectoryInconsistent { channel_id: 77 });
        assert!(!err.message.contains("77"));
    }
}
