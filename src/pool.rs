//! Keep-alive connection pool for proxied service traffic
//!
//! All services listen on loopback ports, so one pooled client serves every
//! upstream; idle connections are bounded per port.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, CONNECTION, UPGRADE};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Headers scoped to a single hop; never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum PoolError {
    /// Connecting to or talking with the upstream failed
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("could not build upstream request: {0}")]
    RequestBuild(String),
}

/// Request counters
#[derive(Debug, Default)]
pub struct PoolStats {
    requests: AtomicU64,
    failures: AtomicU64,
}

impl PoolStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream port
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 16,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: PoolStats,
}

impl ConnectionPool {
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
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Send `req` to the service listening on `127.0.0.1:<port>`
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let (parts, body) = req.into_parts();
        let listed = connection_listed(&parts.headers);
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            if !is_hop_by_hop(key, &listed) {
                builder = builder.header(key, value);
            }
        }
        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let response = self.client.request(upstream_req).await.map_err(|e| {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            PoolError::from(e)
        })?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Extra header names declared hop-by-hop via `Connection: a, b`
fn connection_listed(headers: &hyper::HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

fn is_hop_by_hop(name: &HeaderName, listed: &[String]) -> bool {
    let name = name.as_str();
    name == CONNECTION.as_str()
        || name == UPGRADE.as_str()
        || HOP_BY_HOP.contains(&name)
        || listed.iter().any(|l| l == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 16);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_pool_starts_empty() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 4,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.stats().requests(), 0);
        assert_eq!(pool.stats().failures(), 0);
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, X-Trace".parse().unwrap());
        let listed = connection_listed(&headers);

        let hop = |name: &'static str| is_hop_by_hop(&HeaderName::from_static(name), &listed);
        assert!(hop("connection"));
        assert!(hop("transfer-encoding"));
        assert!(hop("x-trace"));
        assert!(!hop("x-forwarded-host"));
        assert!(!hop("content-type"));
    }
}
