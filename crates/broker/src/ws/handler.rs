use crate::auth::{jwt::JwtTokenService, middleware::extract_bearer_token};
use crate::metrics;
use crate::notify::backlog::NotificationBacklog;
use crate::ws::registry::{Broker, ConnectionId, OutboundReceiver, UserId};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use beacon_common::protocol::ws::{decode_signal_frame, pong_frame, NotifyMessage, SignalFrame};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub(crate) const AUTH_FAILED_CLOSE_CODE: u16 = 4401;

#[derive(Clone)]
pub struct WsState {
    pub broker: Arc<Broker>,
    pub jwt: Arc<JwtTokenService>,
    pub backlog: NotificationBacklog,
    /// Liveness ping cadence; tests inject a much shorter interval.
    pub heartbeat_interval: Duration,
}

impl WsState {
    pub fn new(
        broker: Arc<Broker>,
        jwt: Arc<JwtTokenService>,
        backlog: NotificationBacklog,
    ) -> Self {
        Self {
            broker,
            jwt,
            backlog,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        }
    }
}

pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/", get(signaling_upgrade))
        .route("/socket/notifications", get(notification_upgrade))
        .with_state(state)
}

async fn signaling_upgrade(
    State(state): State<WsState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling_socket(state, socket))
}

#[derive(Debug, Deserialize)]
struct NotificationUpgradeQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn notification_upgrade(
    State(state): State<WsState>,
    Query(query): Query<NotificationUpgradeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.token.or_else(|| bearer_token_from_headers(&headers));
    let user_id = token.and_then(|token| state.jwt.verify_user_token(&token).ok());

    // The upgrade is accepted at the transport level even when
    // authentication fails; the close frame carries the reason.
    ws.on_upgrade(move |socket| async move {
        match user_id {
            Some(user_id) => handle_notification_socket(state, socket, user_id).await,
            None => close_unauthenticated(socket).await,
        }
    })
}

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_owned)
}

async fn close_unauthenticated(mut socket: WebSocket) {
    metrics::increment_auth_rejects();
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: AUTH_FAILED_CLOSE_CODE,
            reason: "authentication failed".into(),
        })))
        .await;
}

async fn handle_signaling_socket(state: WsState, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let mut outbound = state.broker.register_signaling(connection_id).await;
    debug!(conn_id = %connection_id, "signaling connection established");

    drive_socket(&state, connection_id, SocketRole::Signaling, &mut socket, &mut outbound).await;

    state.broker.remove(connection_id).await;
    debug!(conn_id = %connection_id, "signaling connection closed");
}

async fn handle_notification_socket(state: WsState, mut socket: WebSocket, user_id: UserId) {
    let connection_id = Uuid::new_v4();
    let mut outbound = state.broker.register_notification(connection_id, user_id).await;
    debug!(conn_id = %connection_id, user_id, "notification connection established");

    // Backlog first: a fetch failure degrades to an empty init payload
    // rather than failing the connection. Live pushes queued while the
    // fetch runs sit in the outbound queue until the loop starts, so the
    // init frame is always delivered first.
    let payload = match state.backlog.for_user(user_id).await {
        Ok(backlog) => backlog,
        Err(error) => {
            warn!(conn_id = %connection_id, user_id, error = ?error, "backlog fetch failed, sending empty init");
            Vec::new()
        }
    };
    if send_notify_message(&mut socket, &NotifyMessage::NotificationsInit { payload })
        .await
        .is_err()
    {
        state.broker.remove(connection_id).await;
        return;
    }

    drive_socket(&state, connection_id, SocketRole::Notification, &mut socket, &mut outbound).await;

    state.broker.remove(connection_id).await;
    debug!(conn_id = %connection_id, user_id, "notification connection closed");
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SocketRole {
    Signaling,
    Notification,
}

/// The per-connection event loop: liveness heartbeat, outbound queue
/// drain, and inbound frame dispatch. Returns when the connection should
/// close; the caller performs registry cleanup.
async fn drive_socket(
    state: &WsState,
    connection_id: ConnectionId,
    role: SocketRole,
    socket: &mut WebSocket,
    outbound: &mut OutboundReceiver,
) {
    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.reset(); // skip immediate first tick
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    warn!(conn_id = %connection_id, "liveness pong missed, disconnecting");
                    metrics::increment_forced_closes();
                    break;
                }
                awaiting_pong = true;
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // The registry dropped our sender: evicted or shutdown.
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        if role == SocketRole::Signaling
                            && handle_signal_frame(state, connection_id, socket, raw.as_str())
                                .await
                                .is_err()
                        {
                            break;
                        }
                        // Notification sockets define no inbound messages.
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        awaiting_pong = false;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }
}

/// Dispatch one inbound signaling frame. `Err` means the socket failed
/// mid-reply and the connection should close.
async fn handle_signal_frame(
    state: &WsState,
    connection_id: ConnectionId,
    socket: &mut WebSocket,
    raw: &str,
) -> Result<(), ()> {
    let frame = match decode_signal_frame(raw) {
        Ok(frame) => frame,
        Err(reason) => {
            // Protocol errors are ignored without a response.
            trace!(conn_id = %connection_id, %reason, "dropping unrecognized frame");
            return Ok(());
        }
    };

    match frame {
        SignalFrame::Subscribe { topics } => {
            metrics::record_signal_frame("subscribe");
            state.broker.subscribe(connection_id, &topics).await;
        }
        SignalFrame::Unsubscribe { topics } => {
            metrics::record_signal_frame("unsubscribe");
            state.broker.unsubscribe(connection_id, &topics).await;
        }
        SignalFrame::Publish { topic, envelope } => {
            metrics::record_signal_frame("publish");
            if state.broker.publish(&topic, envelope).await.is_none() {
                trace!(conn_id = %connection_id, topic, "publish to unknown topic dropped");
            }
        }
        SignalFrame::Ping => {
            // Application-level echo, unrelated to the liveness heartbeat.
            metrics::record_signal_frame("ping");
            socket.send(Message::Text(pong_frame().into())).await.map_err(|_| ())?;
        }
    }

    Ok(())
}

async fn send_notify_message(socket: &mut WebSocket, message: &NotifyMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
