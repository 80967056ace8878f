//! Tunnel agent — the client half, run next to the private service.
//!
//! In direct mode the agent only registers its advertised address over
//! `POST /connect` and waits; the relay dials the service itself. In
//! multiplexed mode it holds a WebSocket to the relay, answers every request
//! frame by calling the local service, and writes back a response frame.
//!
//! Either way the tunnel is closed on shutdown (Ctrl+C / SIGTERM).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envelope::{
    header_list, header_map, Frame, Registration, RequestEnvelope, ResponseEnvelope,
};
use super::relay::HOP_BY_HOP;
use super::tcp_relay::TcpRelay;
use crate::config::{AgentConfig, AgentMode};
use crate::error::TunnelError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the session, shared by concurrent request handlers.
type WsSink = Arc<Mutex<futures_util::stream::SplitSink<WsStream, Message>>>;

/// Request headers the local call sets for itself.
const LOCAL_MANAGED: [&str; 2] = ["host", "content-length"];

pub struct Agent {
    config: AgentConfig,
    /// Control-plane calls to the relay.
    control: reqwest::Client,
    /// Calls to the local service; redirects are passed through, not followed.
    local: reqwest::Client,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, TunnelError> {
        let control = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        let local = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            config,
            control,
            local,
        })
    }

    fn control_url(&self, path: &str) -> String {
        format!(
            "{}://{}{path}",
            self.config.http_scheme(),
            self.config.endpoint.trim_end_matches('/')
        )
    }

    /// Public URL the tunnel is reachable at.
    pub fn public_url(&self, id: &str) -> String {
        match self.config.domain.as_deref().filter(|d| !d.is_empty()) {
            Some(domain) => format!("{}://{id}.{domain}", self.config.http_scheme()),
            None => format!("{}://{id}", self.config.http_scheme()),
        }
    }

    fn registration(&self) -> Registration {
        Registration {
            id: self.config.id.clone(),
            ip: self.config.ip.clone(),
            port: self.config.advertised_port(),
            domain: self.config.domain.clone(),
        }
    }

    /// `POST /connect` — register for direct-proxy delivery.
    pub async fn register_direct(&self) -> Result<String, TunnelError> {
        let resp = self
            .control
            .post(self.control_url("/connect"))
            .json(&self.registration())
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(TunnelError::Registration(format!("{status}: {}", body.trim())));
        }
        Ok(body.trim().to_string())
    }

    /// `POST /close/{id}`.
    pub async fn close(&self, id: &str) -> Result<(), TunnelError> {
        let resp = self
            .control
            .post(self.control_url(&format!("/close/{id}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(TunnelError::Registration(format!(
                "close returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Open a multiplexed session: send the registration, read back the ID.
    pub async fn connect_ws(&self) -> Result<(String, WsStream), TunnelError> {
        let url = format!(
            "{}://{}/ws",
            self.config.ws_scheme(),
            self.config.endpoint.trim_end_matches('/')
        );
        let (mut ws, _response) = tokio_tungstenite::connect_async(url).await?;

        let registration = serde_json::to_string(&self.registration())?;
        ws.send(Message::Text(registration.into())).await?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(id))) => return Ok((id.as_str().trim().to_string(), ws)),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "relay closed the session".to_string());
                    return Err(TunnelError::Registration(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TunnelError::Registration(
                        "relay closed the session".to_string(),
                    ))
                }
            }
        }
    }

    /// Answer request frames until the relay hangs up or `cancel` fires.
    /// Each request runs on its own task.
    pub async fn serve(
        self: Arc<Self>,
        ws: WsStream,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let (sink, mut stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        loop {
            let msg = tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                () = cancel.cancelled() => break,
            };

            match msg {
                Message::Text(text) => match Frame::decode(text.as_str()) {
                    Ok(Frame::Request { id, request }) => {
                        let agent = Arc::clone(&self);
                        let sink = Arc::clone(&sink);
                        tokio::spawn(async move {
                            debug!(
                                request_id = %id,
                                method = %request.method,
                                url = %request.url,
                                "Forwarding"
                            );
                            let response = agent.forward_local(request).await;
                            send_frame(&sink, &Frame::Response { id, response }).await;
                        });
                    }
                    Ok(Frame::Close) => {
                        info!("Relay closed the session");
                        return Ok(());
                    }
                    Ok(Frame::Response { id, .. }) => {
                        warn!(request_id = %id, "Ignoring response frame from relay");
                    }
                    Err(e) => warn!(error = %e, "Ignoring undecodable frame"),
                },
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }

        send_frame(&sink, &Frame::Close).await;
        let _ = sink.lock().await.send(Message::Close(None)).await;
        Ok(())
    }

    /// Call the local service; failures become a `502` envelope so the relay
    /// side is always answered.
    pub async fn forward_local(&self, request: RequestEnvelope) -> ResponseEnvelope {
        match self.call_local(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Local service call failed");
                ResponseEnvelope::bad_gateway(&e.to_string())
            }
        }
    }

    async fn call_local(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, TunnelError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TunnelError::MalformedEnvelope(format!("bad method {}", request.method)))?;
        let url = format!("http://localhost:{}{}", self.config.port, request.url);

        let mut headers = request.headers;
        headers.retain(|name, _| {
            !LOCAL_MANAGED.contains(&name.as_str()) && !HOP_BY_HOP.contains(&name.as_str())
        });

        let resp = self
            .local
            .request(method, url)
            .headers(header_map(&headers))
            .body(request.body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let mut headers = header_list(resp.headers());
        headers.retain(|name, _| !HOP_BY_HOP.contains(&name.as_str()));
        let body = resp.bytes().await?.to_vec();

        Ok(ResponseEnvelope {
            status,
            headers,
            body,
        })
    }

    /// Register, serve until `shutdown` resolves, then close the tunnel.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), TunnelError> {
        match self.config.mode {
            AgentMode::Direct => self.run_direct(shutdown).await,
            AgentMode::Ws => Arc::new(self).run_ws(shutdown).await,
        }
    }

    async fn run_direct(self, shutdown: impl Future<Output = ()>) -> Result<(), TunnelError> {
        if self.config.ip.is_empty() {
            return Err(TunnelError::Registration(
                "an advertised ip is required in direct mode".to_string(),
            ));
        }

        let relay_cancel = CancellationToken::new();
        if let Some(proxy_port) = self.config.proxy_port {
            let relay = TcpRelay::bind(
                &format!("0.0.0.0:{proxy_port}"),
                format!("127.0.0.1:{}", self.config.port),
            )
            .await?;
            tokio::spawn(relay.run(relay_cancel.clone()));
        }

        let id = self.register_direct().await?;
        println!("tunnel open: {}", self.public_url(&id));

        shutdown.await;
        println!("closing tunnel");
        relay_cancel.cancel();
        if let Err(e) = self.close(&id).await {
            eprintln!("failed to close tunnel {id}: {e}");
        }
        Ok(())
    }

    async fn run_ws(
        self: Arc<Self>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), TunnelError> {
        let (id, ws) = self.connect_ws().await?;
        println!("tunnel open: {}", self.public_url(&id));

        let cancel = CancellationToken::new();
        let mut serve = tokio::spawn(Arc::clone(&self).serve(ws, cancel.clone()));

        tokio::select! {
            result = &mut serve => {
                return match result {
                    Ok(Ok(())) => {
                        info!(tunnel_id = %id, "Session ended by relay");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(TunnelError::Registration(format!("session task failed: {e}"))),
                };
            }
            () = shutdown => {}
        }

        println!("closing tunnel");
        if let Err(e) = self.close(&id).await {
            eprintln!("failed to close tunnel {id}: {e}");
        }
        cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(1), &mut serve)
            .await
            .is_err()
        {
            serve.abort();
        }
        Ok(())
    }
}

async fn send_frame(sink: &WsSink, frame: &Frame) {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode frame");
            return;
        }
    };
    let _ = sink.lock().await.send(Message::Text(text.into())).await;
}
