//! API forwarding to the upstream backend
//!
//! Requests under the configured prefix have their path rewritten once and
//! are relayed through the connection pool. The upstream response is
//! streamed back untouched; any failure to obtain one becomes the uniform
//! `500 {"error":"Proxy error"}`.

use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::http::uri::{Authority, Uri};
use hyper::{Request, Response, Version};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PathRewrite, ProxyConfig};
use crate::error::{proxy_error_response, ResponseBody};
use crate::pool::{ConnectionPool, ForwardError, PoolConfig};

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only apply to a single connection and are never relayed
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Invalid upstream URL
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL '{0}': {1}")]
    InvalidUri(String, String),
    #[error("upstream URL '{0}' must use the http scheme")]
    UnsupportedScheme(String),
    #[error("upstream URL '{0}' has no host")]
    MissingHost(String),
}

/// The fixed backend requests are forwarded to
#[derive(Debug, Clone)]
pub struct Upstream {
    authority: Authority,
    /// Path of the base URL without a trailing slash ("" for none)
    base_path: String,
}

impl Upstream {
    pub fn parse(url: &str) -> Result<Self, UpstreamError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| {
                UpstreamError::InvalidUri(url.to_string(), e.to_string())
            })?;

        if uri.scheme_str() != Some("http") {
            return Err(UpstreamError::UnsupportedScheme(url.to_string()));
        }

        let authority = uri
            .authority()
            .filter(|a| !a.host().is_empty())
            .cloned()
            .ok_or_else(|| UpstreamError::MissingHost(url.to_string()))?;

        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            authority,
            base_path,
        })
    }

    /// Host header value sent upstream
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Absolute upstream URL for an already rewritten path and query
    pub fn url_for(&self, path_and_query: &str) -> Result<Uri, ForwardError> {
        let url = format!(
            "http://{}{}{}",
            self.authority, self.base_path, path_and_query
        );
        url.parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::RequestBuild(e.to_string()))
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http://{}{}", self.authority, self.base_path)
    }
}

impl PathRewrite {
    /// Rewrite `path_and_query` whose path is known to match `prefix`.
    /// The query string is carried over unchanged.
    pub fn apply(&self, prefix: &str, path_and_query: &str) -> String {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let remainder = if prefix == "/" {
            path
        } else {
            strip_prefix_ignore_case(path, prefix).unwrap_or(path)
        };

        let mut rewritten = match self {
            PathRewrite::Preserve => path.to_string(),
            PathRewrite::Strip => remainder.to_string(),
            PathRewrite::Replace(replacement) => format!("{}{}", replacement, remainder),
        };

        if rewritten.is_empty() {
            rewritten.push('/');
        }
        if let Some(query) = query {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        rewritten
    }
}

/// Relays requests under a path prefix to the upstream
pub struct Forwarder {
    prefix: String,
    rewrite: PathRewrite,
    upstream: Upstream,
    host_header: HeaderValue,
    pool: ConnectionPool,
    request_timeout: Duration,
    forwarded_headers: bool,
}

impl Forwarder {
    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        let upstream = Upstream::parse(&config.upstream)?;
        let host_header = HeaderValue::from_str(upstream.authority().as_str())?;

        Ok(Self {
            prefix: config.prefix.clone(),
            rewrite: config.rewrite.clone(),
            upstream,
            host_header,
            pool: ConnectionPool::new(PoolConfig::from(config)),
            request_timeout: config.request_timeout(),
            forwarded_headers: config.forwarded_headers,
        })
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Whether the path falls under the prefix on a segment boundary.
    /// The prefix compares ASCII case-insensitively.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match strip_prefix_ignore_case(path, &self.prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Upstream URL a request path would be sent to
    pub fn upstream_url(&self, path_and_query: &str) -> Result<Uri, ForwardError> {
        let rewritten = self.rewrite.apply(&self.prefix, path_and_query);
        self.upstream.url_for(&rewritten)
    }

    /// Forward one request. Never fails: upstream errors become a 500.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ResponseBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let method = req.method().clone();
        let original = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let uri = match self.upstream_url(&original) {
            Ok(uri) => uri,
            Err(e) => {
                error!(%method, path = %original, request_id, error = %e, "Proxy error");
                return proxy_error_response();
            }
        };

        info!(%method, path = %original, upstream = %uri, request_id, "Proxying request");

        let upstream_req = self.prepare_request(req, uri, &request_id, client_addr);

        match self.pool.send_request(upstream_req, self.request_timeout).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                debug!(request_id, status = %response.status(), "Upstream responded");
                response
            }
            Err(ForwardError::Timeout(timeout)) => {
                warn!(
                    %method,
                    path = %original,
                    request_id,
                    timeout_secs = timeout.as_secs(),
                    "Proxy error: upstream timed out"
                );
                proxy_error_response()
            }
            Err(e) => {
                error!(%method, path = %original, request_id, error = %e, "Proxy error");
                proxy_error_response()
            }
        }
    }

    fn prepare_request(
        &self,
        req: Request<Incoming>,
        uri: Uri,
        request_id: &str,
        client_addr: SocketAddr,
    ) -> Request<Incoming> {
        let (mut parts, body) = req.into_parts();

        parts.uri = uri;
        // The pooled client speaks HTTP/1.1 upstream whatever the client used
        parts.version = Version::HTTP_11;

        let headers = &mut parts.headers;
        strip_hop_by_hop(headers);

        let original_host = headers.get(HOST).cloned();
        headers.insert(HOST, self.host_header.clone());

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        if self.forwarded_headers {
            if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
            if let Some(host) = original_host {
                headers.insert(X_FORWARDED_HOST, host);
            }
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }

        Request::from_parts(parts, body)
    }
}

/// `str::strip_prefix` with an ASCII case-insensitive comparison
fn strip_prefix_ignore_case<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let head = path.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&path[prefix.len()..])
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop as well
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
