mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod metrics;
mod notify;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::jwt::JwtTokenService;
use crate::config::BrokerConfig;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::notify::backlog::NotificationBacklog;
use crate::ws::Broker;

const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BrokerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    metrics::set_global_metrics(Arc::new(metrics::BrokerMetrics::default()));

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set BEACON_BROKER_JWT_SECRET in production");
    }

    let jwt_service =
        Arc::new(JwtTokenService::new(&config.jwt_secret).context("invalid broker JWT secret")?);
    let broker = Arc::new(Broker::new());
    let backlog = NotificationBacklog::from_env()
        .await
        .context("failed to initialize the notification backlog")?;

    let app = build_router(Arc::clone(&broker), jwt_service, backlog);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind broker listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting broker");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("broker exited unexpectedly")?;

    broker.shutdown().await;
    Ok(())
}

fn build_router(
    broker: Arc<Broker>,
    jwt_service: Arc<JwtTokenService>,
    backlog: NotificationBacklog,
) -> Router {
    let ws_state = ws::WsState::new(Arc::clone(&broker), Arc::clone(&jwt_service), backlog);

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(ws_state))
            .merge(api::router(jwt_service, broker)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(cors::cors_layer())
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
