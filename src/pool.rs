//! Connection pool for upstream HTTP connections
//!
//! Forwarded requests reuse keep-alive connections to the upstream instead of
//! dialing once per request.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::ResponseBody;

/// Why a forwarded request produced no upstream response
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Connecting to or talking with the upstream failed
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// No response head arrived in time
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
    /// The outgoing request could not be assembled
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent upstream
    pub total_requests: AtomicU64,
    /// Requests that ended without an upstream response
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ProxyConfig> for PoolConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
        }
    }
}

/// A pooled HTTP client for the upstream backend
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request whose URI already points at the upstream, waiting at
    /// most `timeout` for the response head. The body is streamed back.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        timeout: Duration,
    ) -> Result<Response<ResponseBody>, ForwardError> {
        self.stats.record_request();

        let result = match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ForwardError::Client(e)),
            Err(_) => Err(ForwardError::Timeout(timeout)),
        };

        match result {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e)
            }
        }
    }
}
