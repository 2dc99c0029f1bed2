//! Front door: subdomain routing and reverse proxying
//!
//! Every inbound connection lands here. Requests for the base domain itself
//! (and platform paths on any host) go to the platform API; requests for
//! `<name>.<base domain>` are forwarded to that service's loopback port.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::PlatformApi;
use crate::db::{Database, ServiceStatus};
use crate::error::{escape_html, html_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};

/// Setting key holding the base domain
pub const BASE_DOMAIN_KEY: &str = "base_domain";

/// Paths always served by the platform, even on a service subdomain
const PLATFORM_PREFIXES: &[&str] = &["/api/", "/css/", "/js/"];

/// Largest upgrade response head accepted from a service
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Platform,
    NotFound { name: String },
    NotLive { name: String, status: ServiceStatus },
    Live { service_id: String, name: String, port: u16 },
}

/// Base domain setting, re-read from the registry at most once per TTL
pub struct DomainCache {
    db: Arc<Database>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Option<String>)>>,
}

impl DomainCache {
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<String> {
        let mut cached = self.cached.lock();
        if let Some((read_at, domain)) = cached.as_ref() {
            if read_at.elapsed() < self.ttl {
                return domain.clone();
            }
        }

        let domain = match self.db.get_setting(BASE_DOMAIN_KEY) {
            Ok(domain) => domain.map(|d| d.to_lowercase()).filter(|d| !d.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read base domain");
                None
            }
        };
        *cached = Some((Instant::now(), domain.clone()));
        domain
    }

    /// Drop the cached value so the next read hits the registry
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

/// Lowercased hostname without port, `None` when missing or malformed
pub fn normalize_host(raw: &str) -> Option<String> {
    let hostname = raw.split(':').next()?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Alphanumeric, hyphen and dot only; anything else never reaches logs
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }
    Some(hostname.to_lowercase())
}

/// The first label of `host` when it sits under `base_domain`
pub fn subdomain_label<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let prefix = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    prefix.split('.').next().filter(|label| !label.is_empty())
}

pub struct RouteResolver {
    db: Arc<Database>,
    domains: Arc<DomainCache>,
}

impl RouteResolver {
    pub fn new(db: Arc<Database>, domains: Arc<DomainCache>) -> Self {
        Self { db, domains }
    }

    pub fn resolve(&self, host: Option<&str>, path: &str) -> Resolution {
        let Some(host) = host.and_then(normalize_host) else {
            return Resolution::Platform;
        };
        let Some(base_domain) = self.domains.get() else {
            return Resolution::Platform;
        };
        let Some(name) = subdomain_label(&host, &base_domain) else {
            return Resolution::Platform;
        };
        if PLATFORM_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
            return Resolution::Platform;
        }

        match self.db.get_service_by_name(name) {
            Ok(Some(service)) => match (service.is_live(), service.port) {
                (true, Some(port)) => Resolution::Live {
                    service_id: service.id,
                    name: service.name,
                    port,
                },
                _ => Resolution::NotLive {
                    name: service.name,
                    status: service.status,
                },
            },
            Ok(None) => Resolution::NotFound {
                name: name.to_string(),
            },
            Err(e) => {
                error!(name, error = %e, "Service lookup failed");
                Resolution::NotFound {
                    name: name.to_string(),
                }
            }
        }
    }
}

/// Forwards requests for live services
pub struct Proxy {
    resolver: RouteResolver,
    pool: ConnectionPool,
    upstream_timeout: Duration,
}

impl Proxy {
    pub fn new(resolver: RouteResolver, pool_config: PoolConfig, upstream_timeout: Duration) -> Self {
        Self {
            resolver,
            pool: ConnectionPool::new(pool_config),
            upstream_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn resolve<B>(&self, req: &Request<B>) -> Resolution {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));
        self.resolver.resolve(host.as_deref(), req.uri().path())
    }

    /// Answer a request whose resolution is not `Platform`
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        resolution: Resolution,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let (name, port) = match resolution {
            Resolution::Live { name, port, .. } => (name, port),
            Resolution::NotFound { name } => {
                return html_error_response(
                    ProxyErrorCode::UnknownService,
                    "Service Not Found",
                    &format!("No service named <b>{}</b> exists.", escape_html(&name)),
                );
            }
            Resolution::NotLive { name, status } => {
                return html_error_response(
                    ProxyErrorCode::ServiceNotLive,
                    "Service Not Running",
                    &format!(
                        "<b>{}</b> is currently <b>{}</b>.",
                        escape_html(&name),
                        status
                    ),
                );
            }
            Resolution::Platform => {
                return html_error_response(
                    ProxyErrorCode::InternalError,
                    "Internal Error",
                    "Request was not routable.",
                );
            }
        };

        let request_id = set_forwarded_headers(&mut req, client_addr);
        debug!(service = %name, port, method = %req.method(), uri = %req.uri(), request_id, "Proxying request");

        if is_upgrade_request(&req) {
            return handle_upgrade(req, name, port, request_id).await;
        }

        match tokio::time::timeout(self.upstream_timeout, self.pool.send_request(req, port)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(service = %name, port, error = %e, "Upstream request failed");
                html_error_response(
                    ProxyErrorCode::UpstreamUnavailable,
                    "Service Unavailable",
                    "The container may be stopped or still starting.",
                )
            }
            Err(_) => {
                warn!(service = %name, port, timeout_secs = self.upstream_timeout.as_secs(), "Upstream timed out");
                html_error_response(
                    ProxyErrorCode::UpstreamTimeout,
                    "Gateway Timeout",
                    &format!(
                        "The service did not respond within {} seconds.",
                        self.upstream_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// Overwrite X-Forwarded-* with values seen by this hop. Returns the request id.
fn set_forwarded_headers<B>(req: &mut Request<B>, client_addr: SocketAddr) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("Host: 127.0.0.1:{}\r\n\r\n", port));

    request.into_bytes()
}

/// Length of the response head including its blank line, once it is complete
fn response_head_len(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Status and headers of the upstream's reply to an upgrade
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

fn empty_response(builder: hyper::http::response::Builder) -> Response<BoxBody<Bytes, hyper::Error>> {
    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| {
            html_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                "Service Unavailable",
                "Invalid upgrade response from the service.",
            )
        })
}

async fn handle_upgrade(
    req: Request<Incoming>,
    name: String,
    port: u16,
    request_id: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let unavailable = |detail: &str| {
        html_error_response(ProxyErrorCode::UpstreamUnavailable, "Service Unavailable", detail)
    };

    let mut upstream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(service = %name, port, error = %e, "Upgrade connect failed");
            return unavailable("The container may be stopped or still starting.");
        }
    };

    if let Err(e) = upstream.write_all(&build_upgrade_request(&req, port)).await {
        warn!(service = %name, error = %e, "Failed to send upgrade request");
        return unavailable("The service closed the connection.");
    }

    let mut buf = Vec::with_capacity(4096);
    let head_len = loop {
        if let Some(len) = response_head_len(&buf) {
            break len;
        }
        if buf.len() >= MAX_UPGRADE_HEAD {
            return unavailable("Invalid upgrade response from the service.");
        }
        match upstream.read_buf(&mut buf).await {
            Ok(n) if n > 0 => {}
            _ => return unavailable("The service closed the connection."),
        }
    };

    let Some((status, headers)) = parse_upgrade_response(&buf[..head_len]) else {
        return unavailable("Invalid upgrade response from the service.");
    };
    // The service may speak first, in the same segment as its 101
    let early = buf.split_off(head_len);

    let mut response = Response::builder().status(status);
    for (header, value) in &headers {
        let lower = header.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response = response.header(header.as_str(), value);
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(service = %name, %status, "Service declined upgrade");
        return empty_response(response);
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => forward_bidirectional(upgraded, upstream, &early, &name, &request_id).await,
            Err(e) => warn!(service = %name, error = %e, "Client upgrade failed"),
        }
    });

    empty_response(response)
}

async fn forward_bidirectional(
    client: Upgraded,
    mut upstream: TcpStream,
    early: &[u8],
    name: &str,
    request_id: &str,
) {
    let mut client = TokioIo::new(client);
    if !early.is_empty() {
        if let Err(e) = client.write_all(early).await {
            debug!(service = name, request_id, error = %e, "Upgraded connection closed with error");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(service = name, request_id, sent, received, "Upgraded connection closed")
        }
        Err(e) => debug!(service = name, request_id, error = %e, "Upgraded connection closed with error"),
    }
}

/// The single listener for platform and service traffic
pub struct ProxyServer {
    proxy: Arc<Proxy>,
    api: Arc<PlatformApi>,
    shutdown_rx: watch::Receiver<bool>,
    header_timeout: Duration,
}

impl ProxyServer {
    pub fn new(proxy: Arc<Proxy>, api: Arc<PlatformApi>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            proxy,
            api,
            shutdown_rx,
            header_timeout: Duration::from_secs(30),
        }
    }

    /// Drop HTTP/1 connections that do not finish sending headers in time
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub async fn run(self, bind_addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Listening (HTTP/1.1 and HTTP/2)");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let proxy = Arc::clone(&self.proxy);
                            let api = Arc::clone(&self.api);
                            let header_timeout = self.header_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, proxy, api, header_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender means nobody can signal shutdown any more
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    proxy: Arc<Proxy>,
    api: Arc<PlatformApi>,
    header_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        let api = Arc::clone(&api);
        async move {
            let response = match proxy.resolve(&req) {
                Resolution::Platform => api.handle(req).await,
                resolution => proxy.handle(req, resolution, addr).await,
            };
            Ok::<_, hyper::Error>(response)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
