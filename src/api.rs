//! Platform API served on the platform host
//!
//! JSON endpoints for creating services and VMs, driving their lifecycle,
//! inspecting deployments, logs and metrics, and the WebSocket event stream.
//! Every response uses the [`ApiResponse`] envelope.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::builder::sanitize_label;
use crate::config::is_valid_hostname;
use crate::control::{name_from_url, resolve_limits, NewApp, ServiceControl};
use crate::db::{Database, MetricRecord, ServiceRecord, ServiceStatus, SourceType};
use crate::error::DeployError;
use crate::lifecycle::{ContainerStats, LifecycleManager};
use crate::plan::BuildOverrides;
use crate::proxy::{is_upgrade_request, DomainCache, BASE_DOMAIN_KEY};
use crate::vm::{VmSpec, DEFAULT_VM_LIMITS};
use crate::ws::EventStream;

type ApiBody = BoxBody<Bytes, hyper::Error>;
type ApiResult = Result<Response<ApiBody>, DeployError>;

/// Uploaded archives larger than this are rejected
const MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_LOG_TAIL: usize = 200;
const MAX_LOG_TAIL: usize = 5000;
const DEFAULT_METRICS_LIMIT: usize = 60;
const DEFAULT_AUDIT_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;
const DEFAULT_VM_PORT: u16 = 8080;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Request to create a service from a git repository
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGitRequest {
    pub url: String,
    pub name: Option<String>,
    pub branch: Option<String>,
    pub root_directory: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub preset: Option<String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<i64>,
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub overrides: BuildOverrides,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmRequest {
    pub name: Option<String>,
    pub os_image: String,
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<i64>,
    pub internal_port: Option<u16>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub startup_script: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResourcesRequest {
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<i64>,
    pub preset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBuildRequest {
    #[serde(default)]
    pub overrides: BuildOverrides,
    pub branch: Option<String>,
    pub root_directory: Option<String>,
    pub restart_policy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDomainRequest {
    /// Empty or null clears the base domain
    pub domain: Option<String>,
}

/// Returned when a service is created
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedService {
    pub id: String,
    pub name: String,
    pub status: ServiceStatus,
    pub port: Option<u16>,
    pub deployment_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedDeployment {
    deployment_id: String,
    queued: usize,
}

#[derive(Debug, Serialize)]
struct ServiceMetrics {
    live: Option<ContainerStats>,
    history: Vec<MetricRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourcesUpdated {
    service: ServiceRecord,
    applied_live: bool,
}

/// Platform API
pub struct PlatformApi {
    control: Arc<ServiceControl>,
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
    domains: Arc<DomainCache>,
    stream: Arc<EventStream>,
    uploads_dir: PathBuf,
}

impl PlatformApi {
    pub fn new(
        control: Arc<ServiceControl>,
        db: Arc<Database>,
        lifecycle: Arc<LifecycleManager>,
        domains: Arc<DomainCache>,
        stream: Arc<EventStream>,
        uploads_dir: PathBuf,
    ) -> Self {
        Self {
            control,
            db,
            lifecycle,
            domains,
            stream,
            uploads_dir,
        }
    }

    /// Serve one platform request. Errors are rendered as JSON envelopes.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ApiBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!(%method, %path, "API request");

        match self.route(req, method.clone(), &path).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status_code();
                if status.is_server_error() {
                    error!(%method, %path, kind = e.kind(), error = %e, "API error");
                } else {
                    debug!(%method, %path, status = status.as_u16(), error = %e, "API request rejected");
                }
                json_error(status, e.to_string())
            }
        }
    }

    async fn route(&self, req: Request<Incoming>, method: Method, path: &str) -> ApiResult {
        if path == "/" && method == Method::GET {
            return respond(
                StatusCode::OK,
                serde_json::json!({
                    "name": "hostdeck",
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            );
        }

        let Some(rest) = path.strip_prefix("/api/") else {
            return Err(DeployError::NotFound("Not found".to_string()));
        };
        let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            (Method::GET, ["health"]) => self.health(),
            (Method::GET, ["events"]) => self.events(req),

            // Services
            (Method::GET, ["services"]) => respond(StatusCode::OK, self.db.list_services()?),
            (Method::POST, ["services", "git"]) => self.create_git(req).await,
            (Method::POST, ["services", "upload"]) => self.create_upload(req).await,
            (Method::GET, ["services", id]) => respond(StatusCode::OK, self.control.get(id)?),
            (Method::DELETE, ["services", id]) => self.delete_service(id).await,

            // Lifecycle actions
            (Method::POST, ["services", id, "start"]) => {
                respond(StatusCode::OK, self.control.start(id).await?)
            }
            (Method::POST, ["services", id, "stop"]) => {
                respond(StatusCode::OK, self.control.stop(id).await?)
            }
            (Method::POST, ["services", id, "restart"]) => {
                respond(StatusCode::OK, self.control.restart(id).await?)
            }
            (Method::POST, ["services", id, "archive"]) => {
                respond(StatusCode::OK, self.control.toggle_archive(id).await?)
            }
            (Method::POST, ["services", id, "redeploy"]) => {
                let ticket = self.control.deploy(id, "manual")?;
                self.queued(ticket.deployment_id)
            }
            (Method::POST, ["services", id, "rollback", deployment_id]) => {
                let ticket = self.control.rollback(id, deployment_id)?;
                self.queued(ticket.deployment_id)
            }

            // Deployments, logs and metrics
            (Method::GET, ["services", id, "deployments"]) => {
                let service = self.control.get(id)?;
                respond(StatusCode::OK, self.db.list_deployments(&service.id)?)
            }
            (Method::GET, ["services", id, "deployments", deployment_id]) => {
                self.get_deployment(id, deployment_id)
            }
            (Method::GET, ["services", id, "logs"]) => {
                let tail = limit_param(req.uri(), "tail", DEFAULT_LOG_TAIL, MAX_LOG_TAIL);
                self.logs(id, tail).await
            }
            (Method::GET, ["services", id, "metrics"]) => {
                let limit = limit_param(req.uri(), "limit", DEFAULT_METRICS_LIMIT, MAX_LIST_LIMIT);
                self.metrics(id, limit).await
            }

            // Configuration
            (Method::GET, ["services", id, "env"]) => {
                respond(StatusCode::OK, self.control.get(id)?.env_vars)
            }
            (Method::PUT, ["services", id, "env"]) => {
                let env: HashMap<String, String> = read_json(req).await?;
                let service = self.control.update_env(id, env).await?;
                respond(StatusCode::OK, service.env_vars)
            }
            (Method::PUT, ["services", id, "resources"]) => {
                let update: UpdateResourcesRequest = read_json(req).await?;
                let (service, applied_live) = self
                    .control
                    .update_resources(id, update.preset.as_deref(), update.cpu_limit, update.memory_limit)
                    .await?;
                respond(StatusCode::OK, ResourcesUpdated { service, applied_live })
            }
            (Method::PUT, ["services", id, "build"]) => {
                let update: UpdateBuildRequest = read_json(req).await?;
                let service = self
                    .control
                    .update_build(
                        id,
                        update.overrides,
                        update.branch,
                        update.root_directory,
                        update.restart_policy,
                    )
                    .await?;
                respond(StatusCode::OK, service)
            }

            // VMs
            (Method::POST, ["vms"]) => self.create_vm(req).await,

            // Platform settings
            (Method::GET, ["settings", "domain"]) => {
                let domain = self.db.get_setting(BASE_DOMAIN_KEY)?;
                respond(StatusCode::OK, serde_json::json!({ "domain": domain }))
            }
            (Method::PUT, ["settings", "domain"]) => self.set_domain(req).await,
            (Method::GET, ["audit"]) => {
                let limit = limit_param(req.uri(), "limit", DEFAULT_AUDIT_LIMIT, MAX_LIST_LIMIT);
                respond(StatusCode::OK, self.db.list_audit(limit)?)
            }

            _ => Err(DeployError::NotFound("Not found".to_string())),
        }
    }

    // ==================== Platform ====================

    fn health(&self) -> ApiResult {
        let engine = if self.lifecycle.is_degraded() { "degraded" } else { "ok" };
        respond(
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "engine": engine,
                "queue": self.control.queue().pending(),
            }),
        )
    }

    fn events(&self, req: Request<Incoming>) -> ApiResult {
        if !is_upgrade_request(&req) {
            return Err(DeployError::InvalidState("Expected a WebSocket upgrade".to_string()));
        }
        Ok(self.stream.accept(req))
    }

    async fn set_domain(&self, req: Request<Incoming>) -> ApiResult {
        let update: UpdateDomainRequest = read_json(req).await?;
        let domain = update
            .domain
            .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty());

        match &domain {
            Some(domain) => {
                if !is_valid_hostname(domain) {
                    return Err(DeployError::InvalidState(format!("invalid domain '{}'", domain)));
                }
                self.db.set_setting(BASE_DOMAIN_KEY, domain)?;
            }
            None => self.db.delete_setting(BASE_DOMAIN_KEY)?,
        }
        self.domains.invalidate();

        info!(domain = ?domain, "Base domain updated");
        respond(StatusCode::OK, serde_json::json!({ "domain": domain }))
    }

    // ==================== Intake ====================

    async fn create_git(&self, req: Request<Incoming>) -> ApiResult {
        let create: CreateGitRequest = read_json(req).await?;
        let url = create.url.trim().to_string();
        if url.is_empty() {
            return Err(DeployError::InvalidState("url is required".to_string()));
        }

        let name = create
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| name_from_url(&url));

        let mut new = NewApp::new(&name, SourceType::Git);
        new.source_url = Some(url);
        new.branch = create.branch;
        new.root_directory = create.root_directory;
        new.env_vars = create.env_vars;
        new.preset = create.preset;
        new.cpu_limit = create.cpu_limit;
        new.memory_limit = create.memory_limit;
        new.restart_policy = create.restart_policy;
        new.overrides = create.overrides;

        let service = self.control.create_app(new)?;
        self.created(service, "manual")
    }

    /// Raw archive body; `filename` decides how it is unpacked
    async fn create_upload(&self, req: Request<Incoming>) -> ApiResult {
        let params = query_params(req.uri());
        let filename = params
            .get("filename")
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .ok_or_else(|| DeployError::InvalidState("filename query parameter is required".to_string()))?;
        let name = params
            .get("name")
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| name_from_filename(&filename));

        let staged = self
            .uploads_dir
            .join(format!("{}-{}", uuid::Uuid::new_v4(), sanitize_label(&filename)));
        let result = self.receive_upload(req, &staged, &filename, &name).await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staged.display(), error = %e, "Failed to remove staged upload");
            }
        }
        result
    }

    async fn receive_upload(
        &self,
        req: Request<Incoming>,
        staged: &Path,
        filename: &str,
        name: &str,
    ) -> ApiResult {
        let size = write_body(req.into_body(), staged).await?;
        if size == 0 {
            return Err(DeployError::InvalidState("upload is empty".to_string()));
        }
        debug!(filename, size, "Upload received");

        let service = self.control.create_app(NewApp::new(name, SourceType::Upload))?;
        if let Err(e) = self.control.stage_upload(&service.id, staged, filename).await {
            if let Err(cleanup) = self.control.delete(&service.id).await {
                warn!(service = %service.name, error = %cleanup, "Failed to remove service after bad upload");
            }
            return Err(e);
        }

        self.created(service, "upload")
    }

    /// Queue the first deploy of a new service
    fn created(&self, service: ServiceRecord, triggered_by: &str) -> ApiResult {
        let ticket = self.control.deploy(&service.id, triggered_by)?;
        respond(
            StatusCode::CREATED,
            CreatedService {
                id: service.id,
                name: service.name,
                status: service.status,
                port: service.port,
                deployment_id: Some(ticket.deployment_id),
            },
        )
    }

    async fn create_vm(&self, req: Request<Incoming>) -> ApiResult {
        let create: CreateVmRequest = read_json(req).await?;
        let (limits, _) = resolve_limits(DEFAULT_VM_LIMITS, None, create.cpu_limit, create.memory_limit)?;

        let spec = VmSpec {
            name: create.name.map(|n| n.trim().to_string()).unwrap_or_default(),
            os_image: create.os_image,
            limits,
            internal_port: create.internal_port.unwrap_or(DEFAULT_VM_PORT),
            env_vars: create.env_vars,
            startup_script: create.startup_script,
        };

        let service = self.control.create_vm(spec).await?;
        respond(
            StatusCode::CREATED,
            CreatedService {
                id: service.id,
                name: service.name,
                status: service.status,
                port: service.port,
                deployment_id: None,
            },
        )
    }

    // ==================== Services ====================

    async fn delete_service(&self, service_id: &str) -> ApiResult {
        self.control.delete(service_id).await?;
        respond(StatusCode::OK, serde_json::json!({ "deleted": service_id }))
    }

    fn queued(&self, deployment_id: String) -> ApiResult {
        respond(
            StatusCode::ACCEPTED,
            QueuedDeployment {
                deployment_id,
                queued: self.control.queue().pending(),
            },
        )
    }

    fn get_deployment(&self, service_id: &str, deployment_id: &str) -> ApiResult {
        let service = self.control.get(service_id)?;
        let deployment = self
            .db
            .get_deployment(deployment_id)?
            .filter(|d| d.service_id == service.id)
            .ok_or_else(|| DeployError::NotFound("deployment not found".to_string()))?;
        respond(StatusCode::OK, deployment)
    }

    async fn logs(&self, service_id: &str, tail: usize) -> ApiResult {
        let service = self.control.get(service_id)?;
        let handle = self
            .lifecycle
            .handle_for(&service)
            .ok_or_else(|| DeployError::InvalidState("No container, redeploy first".to_string()))?;
        let lines = self.lifecycle.logs(&handle, tail).await?;
        respond(StatusCode::OK, lines)
    }

    async fn metrics(&self, service_id: &str, limit: usize) -> ApiResult {
        let service = self.control.get(service_id)?;

        let mut live = None;
        if service.status == ServiceStatus::Running {
            if let Some(handle) = self.lifecycle.handle_for(&service) {
                match self.lifecycle.stats(&handle).await {
                    Ok(stats) => live = Some(stats),
                    Err(e) => debug!(service = %service.name, error = %e, "Live stats unavailable"),
                }
            }
        }

        let history = self.db.list_metrics(&service.id, limit)?;
        respond(StatusCode::OK, ServiceMetrics { live, history })
    }
}

// ==================== Helper Functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ApiBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<ApiBody> {
    let response: ApiResponse<()> = ApiResponse::error(message);
    json_response(status, serde_json::to_string(&response).unwrap_or_default())
}

fn respond<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    let body = serde_json::to_string(&ApiResponse::ok(data))
        .map_err(|e| DeployError::Internal(format!("failed to encode response: {}", e)))?;
    Ok(json_response(status, body))
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, DeployError> {
    let body = req
        .collect()
        .await
        .map_err(|e| DeployError::InvalidState(format!("failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| DeployError::InvalidState(format!("Invalid JSON: {}", e)))
}

/// Stream a request body to `path`, returning the byte count
async fn write_body(mut body: Incoming, path: &Path) -> Result<u64, DeployError> {
    let io_err = |e: std::io::Error| DeployError::Internal(format!("failed to stage upload: {}", e));

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    let mut written: u64 = 0;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| DeployError::InvalidState(format!("upload interrupted: {}", e)))?;
        if let Some(data) = frame.data_ref() {
            written += data.len() as u64;
            if written > MAX_UPLOAD_BYTES {
                return Err(DeployError::InvalidState(format!(
                    "upload exceeds {} MiB",
                    MAX_UPLOAD_BYTES / (1024 * 1024)
                )));
            }
            file.write_all(data).await.map_err(io_err)?;
        }
    }
    file.flush().await.map_err(io_err)?;
    Ok(written)
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = value.replace('+', " ");
            let key = urlencoding::decode(key).ok()?.into_owned();
            let value = urlencoding::decode(&value).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn limit_param(uri: &Uri, key: &str, default: usize, max: usize) -> usize {
    query_params(uri)
        .get(key)
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
        .min(max)
}

/// Default service name for an uploaded archive
fn name_from_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let stem = [".tar.gz", ".tgz", ".zip"]
        .iter()
        .find_map(|ext| base.strip_suffix(ext))
        .unwrap_or(base);
    sanitize_label(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response() {
        let response: ApiResponse<String> = ApiResponse::ok("test".to_string());
        assert!(response.success);
        assert_eq!(response.data, Some("test".to_string()));
        assert!(response.error.is_none());

        let error: ApiResponse<String> = ApiResponse::error("failed");
        assert!(!error.success);
        assert!(error.data.is_none());
        assert_eq!(error.error, Some("failed".to_string()));
    }

    #[test]
    fn test_error_envelope() {
        let response = json_error(StatusCode::CONFLICT, "taken");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_query_params() {
        let uri: Uri = "/api/services/upload?filename=my%20site.zip&name=site&flag"
            .parse()
            .unwrap();
        let params = query_params(&uri);
        assert_eq!(params.get("filename").unwrap(), "my site.zip");
        assert_eq!(params.get("name").unwrap(), "site");
        assert_eq!(params.get("flag").unwrap(), "");
    }

    #[test]
    fn test_limit_param() {
        let uri: Uri = "/api/services/x/logs?tail=50".parse().unwrap();
        assert_eq!(limit_param(&uri, "tail", 200, 5000), 50);

        let uri: Uri = "/api/services/x/logs?tail=999999".parse().unwrap();
        assert_eq!(limit_param(&uri, "tail", 200, 5000), 5000);

        let uri: Uri = "/api/services/x/logs?tail=abc".parse().unwrap();
        assert_eq!(limit_param(&uri, "tail", 200, 5000), 200);

        let uri: Uri = "/api/services/x/logs".parse().unwrap();
        assert_eq!(limit_param(&uri, "tail", 200, 5000), 200);
    }

    #[test]
    fn test_name_from_filename() {
        assert_eq!(name_from_filename("portfolio.zip"), "portfolio");
        assert_eq!(name_from_filename("site-v2.tar.gz"), "site-v2");
        assert_eq!(name_from_filename("dist.tgz"), "dist");
    }

    #[test]
    fn test_create_git_request_defaults() {
        let req: CreateGitRequest =
            serde_json::from_str(r#"{"url":"https://example.test/acme/shop.git"}"#).unwrap();
        assert_eq!(req.url, "https://example.test/acme/shop.git");
        assert!(req.name.is_none());
        assert!(req.env_vars.is_empty());
        assert!(req.overrides.is_empty());

        let req: CreateGitRequest = serde_json::from_str(
            r#"{"url":"u","rootDirectory":"web","cpuLimit":0.5,"overrides":{"startCmd":"npm run serve"}}"#,
        )
        .unwrap();
        assert_eq!(req.root_directory.as_deref(), Some("web"));
        assert_eq!(req.cpu_limit, Some(0.5));
        assert_eq!(req.overrides.start_cmd.as_deref(), Some("npm run serve"));
    }
}
