//! Tunnel relay — accepts agent registrations and routes public traffic.
//!
//! The relay serves two planes:
//!
//! 1. **Control** (`internal_listen`): `POST /connect`, `POST /close/{id}`,
//!    `GET /ws`, `GET /tunnels`, `GET /health`
//! 2. **Public** (`public_listen`): `GET /health`, everything else is routed by
//!    the first label of the `Host` header
//!
//! A tunnel registered over `/connect` is served by dialing its advertised
//! address directly. A tunnel registered over `/ws` owns a live session and is
//! served by writing request frames onto it and waiting on the correlation
//! table for the matching response.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path as AxumPath, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::envelope::{header_list, Frame, Registration, RequestEnvelope};
use super::pending::{PendingRequests, DEFAULT_PROXY_TIMEOUT};
use super::registry::{Registry, SessionHandle, Tunnel};
use crate::config::ServerConfig;
use crate::error::TunnelError;
use crate::routes::health::health;

/// Outbound frames buffered per session before senders wait.
const SESSION_QUEUE_DEPTH: usize = 256;

/// How long a fresh `/ws` connection may take to send its registration.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that describe one hop and are never forwarded.
pub(crate) const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type HttpClient = Client<HttpConnector, Body>;

/// Knobs for request delivery.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// How long a multiplexed request waits for its agent.
    pub proxy_timeout: Duration,
    /// Largest request body buffered into an envelope.
    pub max_body_bytes: usize,
    /// Deadline for the first frame of a multiplexed session.
    pub registration_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
            max_body_bytes: 10 * 1024 * 1024,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }
}

impl From<&ServerConfig> for RelaySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            proxy_timeout: config.proxy_timeout(),
            max_body_bytes: config.max_body_bytes,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }
}

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Registry,
    pub pending: PendingRequests,
    pub settings: RelaySettings,
    http: HttpClient,
}

impl RelayState {
    pub fn new(registry: Registry, pending: PendingRequests, settings: RelaySettings) -> Self {
        let http = Client::builder(TokioExecutor::new()).build_http();
        Self {
            registry,
            pending,
            settings,
            http,
        }
    }
}

/// Control-plane router: registration, closure, sessions, diagnostics.
pub fn control_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", any(health))
        .route("/connect", post(connect))
        .route("/close/{id}", post(close))
        .route("/ws", get(agent_ws))
        .route("/tunnels", get(list_tunnels))
        .with_state(state)
}

/// Public-plane router: health probe plus host-based tunnel routing.
pub fn public_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", any(health))
        .fallback(public_request)
        .with_state(state)
}

// ─── Control Plane ───────────────────────────────────────────────────────────

/// `POST /connect` — register a direct-proxy tunnel, answers with the bare ID.
async fn connect(State(state): State<RelayState>, body: Bytes) -> Response {
    let Ok(registration) = serde_json::from_slice::<Registration>(&body) else {
        return (StatusCode::BAD_REQUEST, "Error decoding request").into_response();
    };
    if registration.ip.is_empty() || registration.port == 0 {
        return (StatusCode::BAD_REQUEST, "ip and port are required").into_response();
    }

    let tunnel = Tunnel::new(
        registration.ip.clone(),
        registration.port,
        registration.domain.clone(),
    );
    match state
        .registry
        .register(registration.requested_id(), tunnel)
        .await
    {
        Ok(id) => id.into_response(),
        Err(e) => {
            warn!(error = %e, "Registration refused");
            e.into_response()
        }
    }
}

/// `POST /close/{id}` — always `OK`, whether or not the tunnel existed.
async fn close(State(state): State<RelayState>, AxumPath(id): AxumPath<String>) -> &'static str {
    state.registry.remove(&id.to_ascii_lowercase()).await;
    "OK"
}

/// `GET /tunnels` — live tunnels and in-flight request count.
async fn list_tunnels(State(state): State<RelayState>) -> Json<serde_json::Value> {
    let tunnels = state.registry.snapshot().await;
    Json(json!({
        "tunnels": tunnels,
        "pending_requests": state.pending.len(),
    }))
}

// ─── Tunnel Sessions ─────────────────────────────────────────────────────────

/// `GET /ws` — upgrade to a multiplexed tunnel session.
async fn agent_ws(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_ws(socket, state))
}

/// Drive one agent session: registration handshake, then serve until either
/// side closes or the registry evicts the tunnel.
async fn handle_agent_ws(socket: WebSocket, state: RelayState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let first = tokio::time::timeout(state.settings.registration_timeout, ws_stream.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            warn!("Agent disconnected before registration");
            return;
        }
        Err(_) => {
            warn!("Agent sent no registration in time");
            let _ = ws_sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "registration timeout".into(),
                })))
                .await;
            return;
        }
    };
    let registration = match serde_json::from_str::<Registration>(text.as_str()) {
        Ok(registration) => registration,
        Err(e) => {
            warn!(error = %e, "Agent sent malformed registration");
            let _ = ws_sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::INVALID,
                    reason: "malformed registration".into(),
                })))
                .await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(SESSION_QUEUE_DEPTH);
    let cancel = CancellationToken::new();
    let session = SessionHandle::new(outbound_tx, cancel.clone());
    let session_id = session.session_id();
    let tunnel = Tunnel::new(
        registration.ip.clone(),
        registration.port,
        registration.domain.clone(),
    )
    .with_session(session);

    let id = match state
        .registry
        .register(registration.requested_id(), tunnel)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Agent registration refused");
            let _ = ws_sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    // The bare ID is the first frame the agent reads.
    if ws_sink.send(Message::Text(id.clone().into())).await.is_err() {
        state.registry.remove_session(&id, session_id).await;
        return;
    }

    let span = info_span!("tunnel_session", tunnel_id = %id);
    async move {
        info!("Session serving");

        let writer_cancel = cancel.clone();
        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    () = writer_cancel.cancelled() => break,
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if ws_sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.send(Message::Close(None)).await;
        });

        loop {
            let msg = tokio::select! {
                msg = ws_stream.next() => match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "Session read failed");
                        break;
                    }
                    None => break,
                },
                () = cancel.cancelled() => {
                    info!("Session closed by relay");
                    break;
                }
            };
            match msg {
                Message::Text(text) => match Frame::decode(text.as_str()) {
                    Ok(Frame::Response {
                        id: request_id,
                        response,
                    }) => {
                        state.registry.touch(&id).await;
                        state.pending.resolve(&request_id, response);
                    }
                    Ok(Frame::Close) => {
                        info!("Agent requested close");
                        break;
                    }
                    Ok(Frame::Request { .. }) => {
                        warn!("Ignoring request frame sent by agent");
                    }
                    Err(e) => {
                        warn!(error = %e, "Tearing down session");
                        break;
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        cancel.cancel();
        state.registry.remove_session(&id, session_id).await;
        if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
            .await
            .is_err()
        {
            send_task.abort();
        }
        info!("Session ended");
    }
    .instrument(span)
    .await;
}

// ─── Public Plane ────────────────────────────────────────────────────────────

/// How a request reaches a tunnel's private service.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// The relay dials the advertised address (`http://ip:port`).
    Direct { target: String },
    /// Request and response travel as frames over the agent's session.
    Multiplexed(SessionHandle),
}

impl Delivery {
    pub fn for_tunnel(tunnel: &Tunnel) -> Self {
        match &tunnel.session {
            Some(session) => Self::Multiplexed(session.clone()),
            None => Self::Direct {
                target: format!("http://{}:{}", tunnel.address, tunnel.port),
            },
        }
    }

    pub async fn deliver(
        self,
        state: &RelayState,
        request: Request,
    ) -> Result<Response, TunnelError> {
        match self {
            Self::Direct { target } => forward_direct(&state.http, &target, request).await,
            Self::Multiplexed(session) => forward_multiplexed(state, &session, request).await,
        }
    }
}

/// Tunnel ID from a `Host` value: its first DNS label, port stripped,
/// lowercased.
pub fn tunnel_id_from_host(host: &str) -> String {
    let label = host.split('.').next().unwrap_or(host);
    label
        .split(':')
        .next()
        .unwrap_or(label)
        .to_ascii_lowercase()
}

fn request_host(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
}

/// Resolve the tunnel for `request` and deliver it.
pub async fn route(state: &RelayState, request: Request) -> Result<Response, TunnelError> {
    let id = request_host(&request)
        .map(tunnel_id_from_host)
        .unwrap_or_default();

    let tunnel = state.registry.lookup(&id).await?;
    state.registry.touch(&id).await;

    let delivery = Delivery::for_tunnel(&tunnel);
    debug!(
        tunnel_id = %id,
        mode = tunnel.mode(),
        method = %request.method(),
        uri = %request.uri(),
        "Proxying request"
    );
    delivery.deliver(state, request).await
}

/// Fallback handler for every public path except `/health`.
async fn public_request(State(state): State<RelayState>, request: Request) -> Response {
    match route(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            if !matches!(e, TunnelError::NotFound(_)) {
                warn!(error = %e, "Public request failed");
            }
            e.into_response()
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Reverse-proxy `request` to `target`, streaming the upstream response back
/// with its status and headers.
async fn forward_direct(
    http: &HttpClient,
    target: &str,
    mut request: Request,
) -> Result<Response, TunnelError> {
    let path = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let uri: Uri = format!("{target}{path}")
        .parse()
        .map_err(|e| TunnelError::UpstreamUnreachable(format!("bad target {target}: {e}")))?;

    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    strip_hop_by_hop(request.headers_mut());

    let upstream = http
        .request(request)
        .await
        .map_err(|e| TunnelError::UpstreamUnreachable(format!("{target}: {e}")))?;

    let (mut parts, body) = upstream.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Send `request` over the tunnel's session and wait for the agent's answer.
async fn forward_multiplexed(
    state: &RelayState,
    session: &SessionHandle,
    request: Request,
) -> Result<Response, TunnelError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.settings.max_body_bytes)
        .await
        .map_err(|_| TunnelError::BodyTooLarge)?;

    let envelope = RequestEnvelope {
        method: parts.method.to_string(),
        url: parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string()),
        headers: header_list(&parts.headers),
        body: body.to_vec(),
    };

    // One deadline covers queueing the frame and waiting for the answer.
    let deadline = Instant::now() + state.settings.proxy_timeout;

    // The slot must exist before the frame leaves, or a fast agent could
    // answer into an empty table.
    let waiter = state.pending.register();
    let frame = Frame::Request {
        id: waiter.request_id().to_string(),
        request: envelope,
    };
    tokio::time::timeout_at(deadline, session.send(frame))
        .await
        .map_err(|_| TunnelError::GatewayTimeout)??;

    let response = waiter
        .wait(deadline.saturating_duration_since(Instant::now()))
        .await?;
    response.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_is_first_label() {
        assert_eq!(tunnel_id_from_host("abcd1234.tunnels.example.com"), "abcd1234");
        assert_eq!(tunnel_id_from_host("abcd1234.tunnels.test:8081"), "abcd1234");
        assert_eq!(tunnel_id_from_host("localhost:8081"), "localhost");
        assert_eq!(tunnel_id_from_host("MyApp.Tunnels.Test"), "myapp");
        assert_eq!(tunnel_id_from_host(""), "");
    }

    #[test]
    fn test_delivery_follows_session_presence() {
        let direct = Tunnel::new("10.0.0.5", 9000, None);
        match Delivery::for_tunnel(&direct) {
            Delivery::Direct { target } => assert_eq!(target, "http://10.0.0.5:9000"),
            Delivery::Multiplexed(_) => panic!("expected direct delivery"),
        }

        let (tx, _rx) = mpsc::channel(1);
        let session = SessionHandle::new(tx, CancellationToken::new());
        let muxed = Tunnel::new("", 0, None).with_session(session);
        assert!(matches!(
            Delivery::for_tunnel(&muxed),
            Delivery::Multiplexed(_)
        ));
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-request-id"));
    }
}
