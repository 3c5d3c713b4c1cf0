use std::sync::Arc;

use axum::{middleware, routing::post};

use super::auth::token_auth_middleware;
use super::distribute::distribute_middleware;
use super::handler::relay_handler;
use crate::service::app_state::{create_state_router, AppState, StateRouter};

/// OpenAI-compatible relay endpoints behind token auth and channel distribution.
pub fn create_proxy_router(app_state: Arc<AppState>) -> StateRouter {
    create_state_router()
        .route("/v1/chat/completions", post(relay_handler))
        .route("/v1/completions", post(relay_handler))
        .route("/v1/embeddings", post(relay_handler))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), distribute_middleware))
        .route_layer(middleware::from_fn_with_state(app_state, token_auth_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::token::Token;
    use crate::schema::enum_def::ChannelStatus;
    use crate::service::testing::{test_config, test_state, MemoryStore, StubRelay};
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    struct Harness {
        store: Arc<MemoryStore>,
        relay: Arc<StubRelay>,
        state: Arc<AppState>,
    }

    fn harness(relay: StubRelay) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.insert_account(1, "default", 1_000);
        store.insert_token(Token {
            id: 10,
            user_id: 1,
            key: "abc123".to_string(),
            name: "ci".to_string(),
            expired_time: Token::NEVER_EXPIRES,
            remain_quota: 1_000,
            ..Default::default()
        });
        store.insert_channel(5, "primary", &["default"], &["gpt-4o"], 1);
        let relay = Arc::new(relay);
        let state = test_state(&store, relay.clone(), &test_config());
        Harness { store, relay, state }
    }

    async fn call(state: &Arc<AppState>, auth: Option<&str>, body: Value) -> Response {
        let mut builder = Request::post("/v1/chat/completions").header("content-type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        create_proxy_router(state.clone())
            .with_state(state.clone())
            .oneshot(request)
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn chat() -> Value {
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]})
    }

    #[tokio::test]
    async fn rejects_missing_credentials() {
        let h = harness(StubRelay::ok(json!({})));
        let response = call(&h.state, None, chat()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "no_credential");
        assert!(h.relay.calls().is_empty());
    }

    #[tokio::test]
    async fn relays_and_settles_reported_usage() {
        let h = harness(StubRelay::ok(json!({
            "choices": [],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        })));

        let response = call(&h.state, Some("Bearer sk-abc123"), chat()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["usage"]["total_tokens"], 30);
        assert_eq!(h.relay.calls()[0].0, 5);
        assert_eq!(h.store.account_quota(1), 970);
        assert_eq!(h.store.token(10).remain_quota, 970);
        assert_eq!(h.store.account_usage(1), (30, 1));
        assert_eq!(h.store.channel_used_quota(5), 30);
    }

    #[tokio::test]
    async fn token_model_allow_list_is_enforced() {
        let h = harness(StubRelay::ok(json!({})));
        let mut token = h.store.token(10);
        token.models = Some("gpt-3.5-turbo".to_string());
        h.store.insert_token(token);

        let response = call(&h.state, Some("Bearer sk-abc123"), chat()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"]["code"], "model_not_allowed");
    }

    #[tokio::test]
    async fn subnet_restricted_tokens_check_the_peer() {
        let h = harness(StubRelay::ok(json!({})));
        let mut token = h.store.token(10);
        token.subnet = Some("10.0.0.0/8".to_string());
        h.store.insert_token(token);

        let mut request = Request::post("/v1/chat/completions")
            .header("authorization", "Bearer sk-abc123")
            .body(Body::from(chat().to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("192.168.1.4:5000".parse::<SocketAddr>().unwrap()));
        let response = create_proxy_router(h.state.clone())
            .with_state(h.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"]["code"], "ip_not_allowed");
    }

    #[tokio::test]
    async fn unknown_model_has_no_channel() {
        let h = harness(StubRelay::ok(json!({})));
        let response = call(&h.state, Some("Bearer sk-abc123"), json!({"model": "claude-3"})).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            json_body(response).await["error"]["code"],
            "no_channel_for_model_and_group"
        );
    }

    #[tokio::test]
    async fn channel_override_needs_an_admin() {
        let h = harness(StubRelay::ok(json!({})));
        h.store.insert_channel(6, "backup", &["vip"], &["gpt-4o"], 1);

        let response = call(&h.state, Some("Bearer sk-abc123-6"), chat()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        h.store.make_admin(1);
        let response = call(&h.state, Some("Bearer sk-abc123-6"), chat()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.relay.calls()[0].0, 6);
    }

    #[tokio::test]
    async fn dead_credentials_disable_the_channel_and_refund() {
        let h = harness(StubRelay::with_status(
            401,
            json!({"error": {"type": "invalid_request_error", "code": "invalid_api_key", "message": "Incorrect API key"}}),
        ));

        let response = call(&h.state, Some("Bearer sk-abc123"), chat()).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "invalid_api_key");
        assert_eq!(h.store.channel_status(5), ChannelStatus::AutoDisabled);
        assert_eq!(h.store.account_quota(1), 1_000);
        assert_eq!(h.store.token(10).remain_quota, 1_000);
    }

    #[tokio::test]
    async fn broke_accounts_are_turned_away_before_relaying() {
        let h = harness(StubRelay::ok(json!({})));
        h.store.insert_account(1, "default", 20);

        let response = call(&h.state, Some("Bearer sk-abc123"), chat()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"]["code"], "insufficient_account_quota");
        assert!(h.relay.calls().is_empty());
    }
}
