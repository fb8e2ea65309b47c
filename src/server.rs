//! Control-plane HTTP surface
//!
//! Agents attach to a port with `GET /tcp/{port}` or `GET /udp/{port}`,
//! authenticated by `Authorization: Bearer <key>`, and keep that WebSocket
//! open as their control channel. For each announced session they open
//! `GET /session/{id}` with the same key and exchange the session's bytes
//! as binary frames.

use crate::ws_channel::WebSocketChannel;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use rtun_control::{
    AgentLink, AuthError, BinderError, Service, Session, SessionError, SessionStore,
};
use rtun_proto::{Protocol, ServerConfig, SessionId};
use rtun_server_tcp::TcpService;
use rtun_server_udp::UdpService;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frames buffered in each direction of a session relay
const RELAY_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    tcp: Arc<TcpService>,
    udp: Arc<UdpService>,
    sessions: Arc<SessionStore>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_services(TcpService::new(config), UdpService::new(config))
    }

    pub fn with_services(tcp: TcpService, udp: UdpService) -> Self {
        Self {
            tcp: Arc::new(tcp),
            udp: Arc::new(udp),
            sessions: Arc::new(SessionStore::new()),
        }
    }

    pub fn tcp(&self) -> &Arc<TcpService> {
        &self.tcp
    }

    pub fn udp(&self) -> &Arc<UdpService> {
        &self.udp
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    fn service(&self, protocol: Protocol) -> &dyn Service {
        match protocol {
            Protocol::Tcp => self.tcp.as_ref(),
            Protocol::Udp => self.udp.as_ref(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tcp/{port}", get(tcp_handler))
        .route("/udp/{port}", get(udp_handler))
        .route("/session/{id}", get(session_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::trim)
}

fn auth_status(err: &AuthError) -> StatusCode {
    match err {
        AuthError::UnauthorizedKey => StatusCode::UNAUTHORIZED,
        AuthError::InsufficientScope { .. } => StatusCode::FORBIDDEN,
    }
}

async fn tcp_handler(
    ws: WebSocketUpgrade,
    Path(port): Path<u16>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    attach_agent(&state, Protocol::Tcp, port, remote, &headers, ws)
}

async fn udp_handler(
    ws: WebSocketUpgrade,
    Path(port): Path<u16>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    attach_agent(&state, Protocol::Udp, port, remote, &headers, ws)
}

/// Authorize before upgrading, then run the binder for the connection's
/// lifetime
fn attach_agent(
    state: &AppState,
    protocol: Protocol,
    port: u16,
    remote: SocketAddr,
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(key) = bearer_key(headers) else {
        warn!("Agent {} requested {}/{} without a key", remote, protocol, port);
        return (StatusCode::UNAUTHORIZED, "missing bearer key").into_response();
    };

    let binder = match state.service(protocol).get_binder(key, port) {
        Ok(binder) => binder,
        Err(e) => return (auth_status(&e), e.to_string()).into_response(),
    };

    let store = state.sessions.clone();
    let agent = format!("{}@{}/{}", remote, protocol, port);

    ws.on_upgrade(move |socket| async move {
        let channel = WebSocketChannel::new(socket, agent.clone());
        info!("Agent {} connected", agent);

        match binder.start(channel.clone(), store).await {
            Ok(()) => {}
            Err(BinderError::ListenerClosed) | Err(BinderError::Detached) => {
                info!("Agent {} disconnected", agent);
            }
            Err(e) => warn!("Agent {} stopped: {}", agent, e),
        }
        channel.close().await;
    })
}

/// Only a key authorized for the session's tunnel port may pick it up
async fn session_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<SessionId>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(key) = bearer_key(&headers) else {
        warn!("{} requested session {} without a key", remote, id);
        return (StatusCode::UNAUTHORIZED, "missing bearer key").into_response();
    };

    let Some(session) = state.sessions.get(id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    if let Err(e) = state
        .service(session.protocol())
        .authorize(key, session.tunnel_port())
    {
        warn!("{} rejected for session {}: {}", remote, id, e);
        return (auth_status(&e), e.to_string()).into_response();
    }

    let store = state.sessions.clone();
    ws.on_upgrade(move |socket| relay_session(socket, id, session, store))
}

/// Bridge the agent's session WebSocket to the session's relay
async fn relay_session(
    socket: WebSocket,
    id: SessionId,
    session: Arc<dyn Session>,
    store: Arc<SessionStore>,
) {
    let (link, agent_tx, mut agent_rx) = AgentLink::pair(RELAY_CHANNEL_CAPACITY);
    let (mut sink, mut source) = socket.split();

    let inbound = tokio::spawn(async move {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Binary(data)) => {
                    if agent_tx.send(data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let outbound = tokio::spawn(async move {
        while let Some(data) = agent_rx.recv().await {
            if sink.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    debug!(
        "Relaying {} session {} for {}",
        session.protocol(),
        id,
        session.peer_addr()
    );

    match session.relay(link).await {
        // Another agent owns this session; leave it in the store
        Err(SessionError::AlreadyRelayed) => {
            warn!("Session {} is already being relayed", id);
        }
        result => {
            if let Err(e) = result {
                debug!("Session {} ended with error: {}", id, e);
            }
            store.remove(id);
            debug!("Session {} closed", id);
        }
    }

    let _ = outbound.await;
    inbound.abort();
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.len(),
        "tcp_ports": state.tcp.binder_count(),
        "udp_ports": state.udp.binder_count(),
    }))
}
