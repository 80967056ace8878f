//! Error taxonomy for the relay and the agent.
//!
//! Relay-side variants map onto HTTP status codes through [`IntoResponse`],
//! so routing failures surface to the public caller as a plain-text response
//! and never escape a handler.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Everything that can go wrong while registering, routing, or serving a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// An explicit tunnel ID is already live.
    #[error("client id already exists: {0}")]
    DuplicateId(String),

    /// An explicit tunnel ID is not usable as a DNS label.
    #[error("invalid client id: {0}")]
    InvalidId(String),

    /// No live tunnel under this ID.
    #[error("Client not found: {0}")]
    NotFound(String),

    /// Direct-proxy dial or transfer failed.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The agent did not answer a multiplexed request in time.
    #[error("Request timeout")]
    GatewayTimeout,

    /// A frame could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The tunnel's duplex session went away before the request was written.
    #[error("tunnel session closed")]
    SessionClosed,

    /// Request body exceeds the multiplexed-mode limit.
    #[error("request body too large")]
    BodyTooLarge,

    /// The relay refused a registration (agent side).
    #[error("registration failed: {0}")]
    Registration(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// HTTP status the public or control plane answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateId(_) | Self::InvalidId(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamUnreachable(_)
            | Self::MalformedEnvelope(_)
            | Self::SessionClosed
            | Self::Registration(_)
            | Self::Http(_)
            | Self::WebSocket(_)
            | Self::Io(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TunnelError::DuplicateId("abc".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TunnelError::NotFound("abc".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TunnelError::UpstreamUnreachable("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::GatewayTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_not_found_names_the_tunnel() {
        let msg = TunnelError::NotFound("unknown123".into()).to_string();
        assert!(msg.contains("unknown123"));
    }
}
