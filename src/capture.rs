//! Captured request model and extraction from inbound HTTP requests

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{HeaderMap, Method, Request, Uri};
use serde::{Deserialize, Serialize};

use crate::{BasketsError, Result};

/// Query parameters, in key order, each with its values in arrival order
pub type QueryMap = BTreeMap<String, Vec<String>>;

/// Headers keyed by canonical name, each with its values in arrival order
pub type HeaderValues = BTreeMap<String, Vec<String>>;

/// One captured HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Query parameters
    pub query: QueryMap,
    /// Query string exactly as received, without the leading `?`
    #[serde(default)]
    pub raw_query: String,
    /// Request headers
    pub headers: HeaderValues,
    /// Request body, up to the capture limit
    #[serde(with = "body_text")]
    pub body: Vec<u8>,
    /// Body was cut at the capture limit
    #[serde(default)]
    pub body_truncated: bool,
    /// Declared content length, or the number of body bytes read
    pub content_length: u64,
    /// Address of the caller
    pub remote_addr: String,
    /// Capture time (Unix epoch milliseconds)
    pub date: u64,
}

/// A capture record as held by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Per-basket sequence number, starting at 1
    pub id: u64,
    /// The captured request
    #[serde(flatten)]
    pub record: CaptureRecord,
}

impl CaptureRecord {
    /// Capture an inbound request, reading at most `max_body` bytes of its body
    ///
    /// # Errors
    ///
    /// Returns error if the body stream fails
    pub async fn from_request<B>(
        request: Request<B>,
        remote_addr: SocketAddr,
        max_body: usize,
    ) -> Result<Self>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = request.into_parts();
        let (body, truncated) = read_body_truncated(body, max_body).await?;

        Ok(Self::from_parts(
            &parts.method,
            &parts.uri,
            &parts.headers,
            body.to_vec(),
            truncated,
            &remote_addr.to_string(),
        ))
    }

    /// Build a record from already extracted request parts
    #[must_use]
    pub fn from_parts(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Vec<u8>,
        body_truncated: bool,
        remote_addr: &str,
    ) -> Self {
        let content_length = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(body.len() as u64);

        let mut header_values = HeaderValues::new();
        for (name, value) in headers {
            header_values
                .entry(canonical_header_name(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            method: method.as_str().to_string(),
            path: uri.path().to_string(),
            query: uri.query().map(parse_query).unwrap_or_default(),
            raw_query: uri.query().unwrap_or_default().to_string(),
            headers: header_values,
            body,
            body_truncated,
            content_length,
            remote_addr: remote_addr.to_string(),
            date: now_millis(),
        }
    }

    /// Body as text, invalid UTF-8 replaced
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read a body up to `max_size` bytes, flagging anything beyond as truncated
///
/// # Errors
///
/// Returns error if reading a frame fails
pub async fn read_body_truncated<B>(mut body: B, max_size: usize) -> Result<(Bytes, bool)>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut buffer = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BasketsError::Other(format!("Failed to read body: {e}")))?;

        let Ok(data) = frame.into_data() else {
            continue;
        };

        let room = max_size - buffer.len();
        if data.len() > room {
            buffer.extend_from_slice(&data[..room]);
            return Ok((buffer.freeze(), true));
        }
        buffer.extend_from_slice(&data);
    }

    Ok((buffer.freeze(), false))
}

/// Parse a raw query string into a multi-valued map
#[must_use]
pub fn parse_query(raw: &str) -> QueryMap {
    let mut query = QueryMap::new();

    for pair in raw.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        query
            .entry(decode_component(key))
            .or_default()
            .push(decode_component(value));
    }

    query
}

fn decode_component(component: &str) -> String {
    let spaced = component.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

/// Canonical MIME header form: `x-test` becomes `X-Test`
#[must_use]
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Current time as Unix epoch milliseconds
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod body_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}
