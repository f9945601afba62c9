//! HTTP client reissuing captured requests

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::capture::CaptureRecord;
use crate::{BasketsError, Result};

/// Headers that describe one connection and are never relayed
const HOP_BY_HOP: [&str; 11] = [
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header must be dropped when relaying
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Shared client with connection reuse, speaking http and https
#[derive(Clone)]
pub struct RelayClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl RelayClient {
    /// Create a client with a pooled connector
    #[must_use]
    pub fn new() -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        Self { client }
    }

    /// Reissue `record` against `uri` and return the response status
    ///
    /// The response body is read to the end so the connection can be reused.
    ///
    /// # Errors
    ///
    /// Returns `Forward` if the request cannot be built or sent
    pub async fn send(&self, record: &CaptureRecord, uri: Uri) -> Result<StatusCode> {
        let method = record.method.parse::<Method>().map_err(|e| {
            BasketsError::Forward(format!("Invalid HTTP method '{}': {e}", record.method))
        })?;

        debug!("Relaying {} to {}", method, uri);

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, values) in &record.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let request = builder
            .body(Full::new(Bytes::copy_from_slice(&record.body)))
            .map_err(|e| BasketsError::Forward(format!("Failed to build request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| BasketsError::Forward(format!("Request failed: {e}")))?;

        let status = response.status();
        response
            .into_body()
            .collect()
            .await
            .map_err(|e| BasketsError::Forward(format!("Failed to read response body: {e}")))?;

        Ok(status)
    }
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Target URI for relaying `record` captured by `basket`
///
/// The record's query, exactly as received, is appended to any query of
/// `forward_url`. With `expand_path`, the captured path minus its `/<basket>`
/// prefix is appended to the forward URL path.
///
/// # Errors
///
/// Returns `Forward` if the resulting URI is invalid
pub fn build_forward_uri(
    forward_url: &str,
    record: &CaptureRecord,
    basket: &str,
    expand_path: bool,
) -> Result<Uri> {
    let base = forward_url
        .parse::<Uri>()
        .map_err(|e| BasketsError::Forward(format!("Invalid forward URL '{forward_url}': {e}")))?;

    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| BasketsError::Forward(format!("Forward URL has no host: {forward_url}")))?;

    let mut path = base.path().to_string();
    if expand_path {
        let prefix = format!("/{basket}");
        let suffix = record
            .path
            .strip_prefix(&prefix)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(&record.path);
        path = format!("{}{}", path.trim_end_matches('/'), suffix);
        if path.is_empty() {
            path.push('/');
        }
    }

    let query = [base.query().unwrap_or_default(), record.raw_query.as_str()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("&");

    let mut uri = format!("{scheme}://{authority}{path}");
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }

    uri.parse::<Uri>()
        .map_err(|e| BasketsError::Forward(format!("Invalid URI '{uri}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method};

    fn record(uri: &str) -> CaptureRecord {
        CaptureRecord::from_parts(
            &Method::GET,
            &uri.parse().unwrap(),
            &HeaderMap::new(),
            Vec::new(),
            false,
            "",
        )
    }

    #[test]
    fn test_forward_uri_plain() {
        let uri = build_forward_uri("http://example.com/hook", &record("/orders/1"), "orders", false)
            .unwrap();
        assert_eq!(uri.to_string(), "http://example.com/hook");
    }

    #[test]
    fn test_forward_uri_merges_query() {
        let uri = build_forward_uri(
            "http://example.com/hook?token=abc",
            &record("/orders?x=1&y=two%20words"),
            "orders",
            false,
        )
        .unwrap();
        assert_eq!(
            uri.to_string(),
            "http://example.com/hook?token=abc&x=1&y=two%20words"
        );
    }

    #[test]
    fn test_forward_uri_keeps_raw_query() {
        let uri = build_forward_uri(
            "http://example.com/hook",
            &record("/orders?sig=abc&b=1&a=2&b=3&flag&q=x+y"),
            "orders",
            false,
        )
        .unwrap();
        assert_eq!(
            uri.to_string(),
            "http://example.com/hook?sig=abc&b=1&a=2&b=3&flag&q=x+y"
        );
    }

    #[test]
    fn test_forward_uri_expands_path() {
        let uri = build_forward_uri(
            "https://example.com:8443/api/",
            &record("/orders/items/7"),
            "orders",
            true,
        )
        .unwrap();
        assert_eq!(uri.to_string(), "https://example.com:8443/api/items/7");

        let root = build_forward_uri("http://example.com", &record("/orders"), "orders", true)
            .unwrap();
        assert_eq!(root.to_string(), "http://example.com/");
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Host"));
        assert!(is_hop_by_hop("Content-Length"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("X-Test"));
        assert!(!is_hop_by_hop("Content-Type"));
    }
}
