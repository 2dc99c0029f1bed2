//! Error taxonomy for the platform and error pages for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by deploys and lifecycle actions.
///
/// The first six variants follow the deploy pipeline's steps; the rest are
/// request-level outcomes used by the intake API.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Clone or archive extraction failed. Nothing outside the workspace changed.
    #[error("source acquisition failed: {0}")]
    SourceAcquisition(String),

    /// No runtime could be resolved for the workspace
    #[error("build plan could not be resolved: {0}")]
    BuildPlan(String),

    /// The image builder rejected the recipe or the build itself failed
    #[error("image build failed: {0}")]
    ImageBuild(String),

    /// The engine refused to create or start the container
    #[error("container failed to start: {0}")]
    ContainerStart(String),

    /// The container started but was no longer running after the grace period
    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// The container engine is not reachable
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Internal(String),
}

impl DeployError {
    /// HTTP status used when this error reaches the intake API
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeployError::SourceAcquisition(_)
            | DeployError::BuildPlan(_)
            | DeployError::InvalidState(_) => StatusCode::BAD_REQUEST,
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::Conflict(_) => StatusCode::CONFLICT,
            DeployError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeployError::ImageBuild(_)
            | DeployError::ContainerStart(_)
            | DeployError::HealthCheck(_)
            | DeployError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short kind name recorded in the audit log
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::SourceAcquisition(_) => "source_acquisition",
            DeployError::BuildPlan(_) => "build_plan",
            DeployError::ImageBuild(_) => "image_build",
            DeployError::ContainerStart(_) => "container_start",
            DeployError::HealthCheck(_) => "health_check",
            DeployError::EngineUnavailable(_) => "engine_unavailable",
            DeployError::NotFound(_) => "not_found",
            DeployError::Conflict(_) => "conflict",
            DeployError::InvalidState(_) => "invalid_state",
            DeployError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(format!("{:#}", err))
    }
}

impl From<EngineError> for DeployError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => DeployError::EngineUnavailable(msg),
            EngineError::NotFound(msg) => DeployError::NotFound(msg),
            other => DeployError::ContainerStart(other.to_string()),
        }
    }
}

/// Errors reported by a container engine implementation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine rejected request: {0}")]
    Rejected(String),
}

/// Error codes for responses generated by the proxy itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No service is registered under the requested subdomain
    UnknownService,
    /// The service exists but is not running
    ServiceNotLive,
    /// The service port refused or dropped the connection
    UpstreamUnavailable,
    /// The service did not answer in time
    UpstreamTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownService => StatusCode::NOT_FOUND,
            ProxyErrorCode::ServiceNotLive => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Hostdeck-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownService => "UNKNOWN_SERVICE",
            ProxyErrorCode::ServiceNotLive => "SERVICE_NOT_LIVE",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Escape text interpolated into error pages
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render a minimal platform-branded error page.
///
/// `detail` is HTML; callers escape any user-controlled parts with [`escape_html`].
pub fn html_error_response(
    code: ProxyErrorCode,
    title: &str,
    detail: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = code.status_code();
    let body = format!(
        "<!doctype html><html><head><title>{status} {title}</title></head>\
         <body style=\"font-family:sans-serif;text-align:center;padding:60px\">\
         <h1>{status}</h1><h2>{title}</h2><p>{detail}</p>\
         <p style=\"color:#888\">hostdeck</p></body></html>",
        status = status.as_u16(),
        title = escape_html(title),
        detail = detail,
    );

    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("X-Hostdeck-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_error_status_codes() {
        assert_eq!(
            DeployError::SourceAcquisition("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DeployError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DeployError::EngineUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            DeployError::HealthCheck("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: DeployError = EngineError::Unavailable("socket closed".into()).into();
        assert!(matches!(err, DeployError::EngineUnavailable(_)));

        let err: DeployError = EngineError::Rejected("port is already allocated".into()).into();
        assert!(matches!(err, DeployError::ContainerStart(_)));
        assert!(err.to_string().contains("port is already allocated"));
    }

    #[test]
    fn test_html_error_response() {
        let response = html_error_response(
            ProxyErrorCode::ServiceNotLive,
            "Service Not Running",
            "<b>foo</b> is currently <b>stopped</b>.",
        );

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Hostdeck-Error").unwrap(),
            "SERVICE_NOT_LIVE"
        );
        assert!(response
            .headers()
            .get("Content-Type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<script>\"x\"&'y'</script>"),
            "&lt;script&gt;&quot;x&quot;&amp;&#39;y&#39;&lt;/script&gt;"
        );
    }

    #[test]
    fn test_proxy_error_codes() {
        assert_eq!(ProxyErrorCode::UnknownService.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::UpstreamTimeout.as_header_value(),
            "UPSTREAM_TIMEOUT"
        );
    }
}
