// Internal HTTP surface: the delivery trigger called by the
// notification-persistence workflow once a notification is durably
// stored. Delivery is best-effort to currently-connected clients; the
// caller learns how many sockets the push reached.

use crate::auth::{
    jwt::JwtTokenService,
    middleware::{require_bearer_auth, AuthenticatedCaller},
};
use crate::ws::Broker;
use axum::{
    extract::State, middleware, response::IntoResponse, routing::post, Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
struct ApiState {
    broker: Arc<Broker>,
}

#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub user_id: i64,
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmitResponse {
    pub delivered: usize,
}

pub fn router(jwt_service: Arc<JwtTokenService>, broker: Arc<Broker>) -> Router {
    let auth_layer = middleware::from_fn_with_state(jwt_service, require_bearer_auth);

    Router::new()
        .route("/v1/notifications/emit", post(emit_notification).route_layer(auth_layer))
        .with_state(ApiState { broker })
}

async fn emit_notification(
    State(state): State<ApiState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(request): Json<EmitRequest>,
) -> impl IntoResponse {
    let delivered = state.broker.emit(request.user_id, request.payload).await;
    info!(
        subject_id = caller.subject_id,
        user_id = request.user_id,
        delivered,
        "notification emit"
    );

    Json(EmitResponse { delivered })
}

#[cfg(test)]
mod tests {
    use super::{router, EmitResponse};
    use crate::auth::jwt::JwtTokenService;
    use crate::ws::Broker;
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
    };
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "beacon_test_secret_that_is_definitely_long_enough";

    fn emit_request(token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/v1/notifications/emit")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request should build")
    }

    #[tokio::test]
    async fn emit_requires_a_bearer_token() {
        let jwt = Arc::new(JwtTokenService::new(TEST_SECRET).expect("jwt should initialize"));
        let app = router(jwt, Arc::new(Broker::new()));

        let response = app
            .oneshot(emit_request(None, json!({"user_id": 7, "payload": {}})))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn emit_for_a_disconnected_user_reports_zero_deliveries() {
        let jwt = Arc::new(JwtTokenService::new(TEST_SECRET).expect("jwt should initialize"));
        let token = jwt.issue_user_token(1).expect("token should be issued");
        let app = router(jwt, Arc::new(Broker::new()));

        let response = app
            .oneshot(emit_request(Some(&token), json!({"user_id": 7, "payload": {"id": 3}})))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: EmitResponse =
            serde_json::from_slice(&body).expect("response should be valid json");
        assert_eq!(parsed.delivered, 0);
    }

    #[tokio::test]
    async fn emit_delivers_to_registered_connections() {
        let jwt = Arc::new(JwtTokenService::new(TEST_SECRET).expect("jwt should initialize"));
        let token = jwt.issue_user_token(1).expect("token should be issued");
        let broker = Arc::new(Broker::new());
        let mut receiver = broker.register_notification(Uuid::new_v4(), 7).await;
        let app = router(jwt, Arc::clone(&broker));

        let response = app
            .oneshot(emit_request(Some(&token), json!({"user_id": 7, "payload": {"id": 3}})))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: EmitResponse =
            serde_json::from_slice(&body).expect("response should be valid json");
        assert_eq!(parsed.delivered, 1);

        let frame = receiver.recv().await.expect("connection should receive the push");
        let value: serde_json::Value =
            serde_json::from_str(&frame).expect("frame should be valid json");
        assert_eq!(value["type"], "notification");
        assert_eq!(value["payload"]["id"], 3);
    }
}
