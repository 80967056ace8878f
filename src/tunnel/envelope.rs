//! Wire format for one proxied HTTP exchange.
//!
//! Multiplexed tunnels carry JSON text frames over a WebSocket:
//!
//! ```text
//! agent  → relay   {"id":"myapp","ip":"10.0.0.5","port":3000}   registration
//! relay  → agent   myapp                                        bare assigned ID
//! relay  → agent   {"type":"request","id":"<uuid>","request":{...}}
//! agent  → relay   {"type":"response","id":"<uuid>","response":{...}}
//! agent  → relay   {"type":"close"}
//! ```
//!
//! Headers travel as a list of values per lowercase name, so repeated headers
//! (`set-cookie`, `vary`, ...) survive the trip. Each value byte maps to the
//! char with the same code point (Latin-1), so obs-text bytes come back
//! unchanged. Bodies are standard base64.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Header multimap: lowercase name → every value in arrival order.
pub type HeaderList = BTreeMap<String, Vec<String>>;

/// Registration data sent by an agent, either as the `POST /connect` body or
/// as the first frame of a multiplexed session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Requested tunnel ID; empty or absent means "assign one".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Address the relay dials in direct-proxy mode.
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Registration {
    /// The explicitly requested ID, treating `""` as absent.
    pub fn requested_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// A public request as forwarded to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    /// Path and query, e.g. `/api/items?page=2`.
    pub url: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// The local service's answer as returned by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    /// Plain-text `502` the agent sends when the local call fails, so the
    /// relay-side waiter is always resolved.
    pub fn bad_gateway(reason: &str) -> Self {
        let mut headers = HeaderList::new();
        headers.insert(
            "content-type".to_string(),
            vec!["text/plain; charset=utf-8".to_string()],
        );
        Self {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            headers,
            body: reason.as_bytes().to_vec(),
        }
    }

    /// Replay status, every header value, and the body onto a public response.
    pub fn into_response(self) -> Result<Response, TunnelError> {
        let status = StatusCode::from_u16(self.status).map_err(|_| {
            TunnelError::MalformedEnvelope(format!("invalid status code {}", self.status))
        })?;
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;
        *response.headers_mut() = header_map(&self.headers);
        Ok(response)
    }
}

/// One message on a multiplexed session after the registration handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: String,
        request: RequestEnvelope,
    },
    Response {
        id: String,
        response: ResponseEnvelope,
    },
    /// Agent is going away; the relay tears the session down.
    Close,
}

impl Frame {
    pub fn encode(&self) -> Result<String, TunnelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(text).map_err(|e| TunnelError::MalformedEnvelope(e.to_string()))
    }
}

/// Collect a [`HeaderMap`] into a [`HeaderList`], keeping repeated values.
pub fn header_list(headers: &HeaderMap) -> HeaderList {
    let mut list = HeaderList::new();
    for (name, value) in headers {
        list.entry(name.as_str().to_string())
            .or_default()
            .push(value.as_bytes().iter().copied().map(char::from).collect());
    }
    list
}

/// Rebuild a [`HeaderMap`]; names or values that are not valid HTTP are skipped.
pub fn header_map(list: &HeaderList) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in list {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_bytes(&latin1_bytes(value)) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

/// Inverse of the char mapping in [`header_list`]. Values with chars above
/// U+00FF are taken as UTF-8.
fn latin1_bytes(value: &str) -> Vec<u8> {
    value
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect::<Option<Vec<u8>>>()
        .unwrap_or_else(|| value.as_bytes().to_vec())
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestEnvelope {
        let mut headers = HeaderList::new();
        headers.insert("accept".into(), vec!["text/html".into()]);
        headers.insert("cookie".into(), vec!["a=1".into(), "b=2".into()]);
        RequestEnvelope {
            method: "POST".into(),
            url: "/submit?draft=true".into(),
            headers,
            body: vec![0, 159, 146, 150, b'\n'],
        }
    }

    #[test]
    fn test_request_frame_survives_the_wire() {
        let frame = Frame::Request {
            id: "req-1".into(),
            request: sample_request(),
        };
        let text = frame.encode().unwrap();
        assert!(text.contains(r#""type":"request""#));
        assert_eq!(Frame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_close_frame_is_just_a_tag() {
        assert_eq!(Frame::Close.encode().unwrap(), r#"{"type":"close"}"#);
        assert_eq!(Frame::decode(r#"{"type":"close"}"#).unwrap(), Frame::Close);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(TunnelError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Frame::decode(r#"{"type":"response","id":"x","response":{"status":200,"body":"%%%"}}"#),
            Err(TunnelError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_response_body_defaults_to_empty() {
        let frame = Frame::decode(r#"{"type":"response","id":"x","response":{"status":204}}"#)
            .unwrap();
        let Frame::Response { response, .. } = frame else {
            panic!("expected response frame");
        };
        assert_eq!(response.status, 204);
        assert!(response.body.is_empty());
        assert!(response.headers.is_empty());
    }

    #[test]
    fn test_header_list_keeps_repeated_values() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        map.insert("content-type", HeaderValue::from_static("text/plain"));

        let list = header_list(&map);
        assert_eq!(list["set-cookie"], vec!["a=1", "b=2"]);

        let back = header_map(&list);
        let cookies: Vec<_> = back.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(back["content-type"], "text/plain");
    }

    #[test]
    fn test_obs_text_header_bytes_survive() {
        let mut map = HeaderMap::new();
        map.insert("x-name", HeaderValue::from_bytes(b"caf\xe9").unwrap());

        let list = header_list(&map);
        let text = serde_json::to_string(&list).unwrap();
        let decoded: HeaderList = serde_json::from_str(&text).unwrap();

        let back = header_map(&decoded);
        assert_eq!(back["x-name"].as_bytes(), b"caf\xe9");
    }

    #[test]
    fn test_non_latin1_value_falls_back_to_utf8() {
        let mut list = HeaderList::new();
        list.insert("x-name".into(), vec!["caf\u{e9}\u{2603}".into()]);
        let back = header_map(&list);
        assert_eq!(back["x-name"].as_bytes(), "caf\u{e9}\u{2603}".as_bytes());
    }

    #[test]
    fn test_response_replay_keeps_every_header_value() {
        let mut headers = HeaderList::new();
        headers.insert("vary".into(), vec!["accept".into(), "origin".into()]);
        let response = ResponseEnvelope {
            status: 201,
            headers,
            body: b"created".to_vec(),
        }
        .into_response()
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get_all("vary").iter().count(), 2);
    }

    #[test]
    fn test_invalid_status_is_malformed() {
        let envelope = ResponseEnvelope {
            status: 42,
            headers: HeaderList::new(),
            body: Vec::new(),
        };
        assert!(matches!(
            envelope.into_response(),
            Err(TunnelError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_registration_empty_id_means_generate() {
        let reg: Registration =
            serde_json::from_str(r#"{"id":"","ip":"127.0.0.1","port":9000}"#).unwrap();
        assert_eq!(reg.requested_id(), None);
        assert_eq!(reg.port, 9000);

        let reg: Registration = serde_json::from_str(r#"{"id":"myapp"}"#).unwrap();
        assert_eq!(reg.requested_id(), Some("myapp"));
        assert!(reg.ip.is_empty());
    }
}
