//! Deploy pipeline
//!
//! A deployment turns a service's declared source into a running container:
//! acquire source, resolve a build plan, write the recipe, build the image,
//! evict the previous container, create and start the new one, then check it
//! is still alive after a grace period. The previous container is evicted
//! only after the new image exists, so a failed build leaves the running
//! deployment serving.
//!
//! Deployments and rollbacks go through [`DeployQueue`], which runs exactly
//! one job at a time across the whole host.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builder::{self, image_tag};
use crate::config::PipelineConfig;
use crate::db::{
    Database, DeploymentRecord, DeploymentStatus, ServiceKind, ServiceRecord, ServiceStatus,
    SourceType,
};
use crate::error::DeployError;
use crate::events::{Event, EventBus};
use crate::lifecycle::{BestEffort, LifecycleManager, ServiceLocks};
use crate::plan::BuildPlanResolver;
use crate::ports::PortAllocator;
use crate::source::{self, Workspace};

const TRUNCATION_MARKER: &str = "[log truncated]\n";

/// What a queued job should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployKind {
    /// Full pipeline from source
    Build,
    /// Recreate the container from an earlier deployment's image
    Rollback { target_deployment_id: String },
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub service_id: String,
    pub kind: DeployKind,
    /// Provenance: manual, upload, webhook, rollback
    pub triggered_by: String,
}

impl DeployRequest {
    pub fn build(service_id: &str, triggered_by: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            kind: DeployKind::Build,
            triggered_by: triggered_by.to_string(),
        }
    }

    pub fn rollback(service_id: &str, target_deployment_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            kind: DeployKind::Rollback {
                target_deployment_id: target_deployment_id.to_string(),
            },
            triggered_by: "rollback".to_string(),
        }
    }
}

/// Result of a successful deployment
#[derive(Debug, Clone, PartialEq)]
pub struct DeployOutcome {
    pub deployment_id: String,
    pub image_ref: String,
    pub container_id: String,
    pub port: u16,
}

/// Where a deployment failed, relative to evicting the old container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preparing,
    Releasing,
}

/// Build log for one deployment: mirrored to the event bus as it grows and
/// bounded from the front when persisted
struct BuildLog {
    service_id: String,
    events: EventBus,
    text: String,
}

impl BuildLog {
    fn new(service_id: &str, events: EventBus) -> Self {
        Self {
            service_id: service_id.to_string(),
            events,
            text: String::new(),
        }
    }

    fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.text.push_str(&line);
        self.text.push('\n');
        self.events.publish(Event::log(&self.service_id, line));
    }

    fn step(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(service_id = %self.service_id, "{}", line);
        self.push(format!("==> {}", line));
    }
}

/// Keep the tail of a log within `limit` bytes, cutting at a line boundary
pub fn truncate_log(log: &str, limit: usize) -> String {
    if log.len() <= limit {
        return log.to_string();
    }
    let mut cut = log.len() - limit;
    while !log.is_char_boundary(cut) {
        cut += 1;
    }
    let tail = &log[cut..];
    let tail = match tail.find('\n') {
        Some(pos) if pos + 1 < tail.len() => &tail[pos + 1..],
        _ => tail,
    };
    format!("{}{}", TRUNCATION_MARKER, tail)
}

pub struct Pipeline {
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
    ports: Arc<PortAllocator>,
    resolver: Arc<dyn BuildPlanResolver>,
    workspace: Workspace,
    events: EventBus,
    locks: ServiceLocks,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        lifecycle: Arc<LifecycleManager>,
        ports: Arc<PortAllocator>,
        resolver: Arc<dyn BuildPlanResolver>,
        workspace: Workspace,
        events: EventBus,
        locks: ServiceLocks,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            lifecycle,
            ports,
            resolver,
            workspace,
            events,
            locks,
            config,
        }
    }

    fn set_status(&self, service_id: &str, status: ServiceStatus) -> Result<(), DeployError> {
        self.db.update_service_status(service_id, status)?;
        self.events.publish(Event::status(service_id, status));
        Ok(())
    }

    /// Run one queued job to completion. Every failure is recorded on the
    /// deployment and reflected in the service status before returning.
    pub async fn run(&self, request: &DeployRequest, deployment_id: &str) -> Result<DeployOutcome, DeployError> {
        let started = Instant::now();
        let service = self
            .db
            .get_service(&request.service_id)?
            .ok_or_else(|| DeployError::NotFound("service was deleted before its deploy ran".to_string()))?;
        let prior_status = service.status;

        let mut log = BuildLog::new(&service.id, self.events.clone());
        let mut stage = Stage::Preparing;

        self.db.set_deployment_status(deployment_id, DeploymentStatus::Building)?;
        self.set_status(&service.id, ServiceStatus::Building)?;

        let result = match &request.kind {
            DeployKind::Build => {
                self.deploy(&service, deployment_id, &mut log, &mut stage)
                    .await
            }
            DeployKind::Rollback { target_deployment_id } => {
                stage = Stage::Releasing;
                self.rollback(&service, deployment_id, target_deployment_id, &mut log)
                    .await
            }
        };
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                log.push(format!("Deployment succeeded in {:.1}s", duration));
                self.db.finish_deployment(
                    deployment_id,
                    DeploymentStatus::Success,
                    &truncate_log(&log.text, self.config.build_log_limit),
                    Some(&outcome.image_ref),
                    duration,
                )?;
                let action = match request.kind {
                    DeployKind::Build => "deploy",
                    DeployKind::Rollback { .. } => "rollback",
                };
                self.db.insert_audit(
                    action,
                    Some(&service.id),
                    Some(&service.name),
                    &format!("deployment {} on port {}", deployment_id, outcome.port),
                )?;
                info!(service = %service.name, deployment_id, port = outcome.port, "Deployment succeeded");

                // Runs once this deployment counts as successful, so it is kept
                if request.kind == DeployKind::Build && builds_image(&service) {
                    self.prune_images(&service.id).await;
                }
                Ok(outcome)
            }
            Err(e) => {
                log.push(format!("Deployment failed: {}", e));
                error!(service = %service.name, deployment_id, error = %e, "Deployment failed");

                self.db.finish_deployment(
                    deployment_id,
                    DeploymentStatus::Failed,
                    &truncate_log(&log.text, self.config.build_log_limit),
                    None,
                    duration,
                )?;

                // Before eviction the old container is untouched and keeps serving
                if self.db.get_service(&service.id)?.is_some() {
                    let status = match stage {
                        Stage::Preparing if service.container_id.is_some() => match prior_status {
                            ServiceStatus::Building => ServiceStatus::Running,
                            other => other,
                        },
                        _ => ServiceStatus::Error,
                    };
                    self.set_status(&service.id, status)?;
                    self.db.insert_audit(
                        "deploy_failed",
                        Some(&service.id),
                        Some(&service.name),
                        &format!("{}: {}", e.kind(), e),
                    )?;
                }
                Err(e)
            }
        }
    }

    async fn deploy(
        &self,
        service: &ServiceRecord,
        deployment_id: &str,
        log: &mut BuildLog,
        stage: &mut Stage,
    ) -> Result<DeployOutcome, DeployError> {
        let (image, internal_port) = match service.source_type {
            SourceType::Image => {
                let image = service
                    .source_url
                    .clone()
                    .ok_or_else(|| DeployError::SourceAcquisition("no image reference".to_string()))?;
                log.step(format!("Pulling image {}", image));
                self.lifecycle.pull(&image).await?;
                (image, service.internal_port)
            }
            SourceType::Git | SourceType::Upload => self.build(service, deployment_id, log).await?,
        };

        *stage = Stage::Releasing;
        let released = self
            .release(&service.id, deployment_id, &image, internal_port, log)
            .await;

        // A delete during the build already removed every image it knew of
        if released.is_err() && builds_image(service) && self.db.get_service(&service.id)?.is_none() {
            info!(service = %service.name, image, "Removing image of a deleted service");
            self.lifecycle.remove_image(&image).await;
        }
        released
    }

    /// Steps 1, 2, 3 and 5: everything that runs without touching the
    /// current container
    async fn build(
        &self,
        service: &ServiceRecord,
        deployment_id: &str,
        log: &mut BuildLog,
    ) -> Result<(String, u16), DeployError> {
        let source_dir = self.workspace.source_dir(&service.id);

        match service.source_type {
            SourceType::Git => {
                let url = service
                    .source_url
                    .as_deref()
                    .ok_or_else(|| DeployError::SourceAcquisition("no repository URL".to_string()))?;
                log.step(format!("Cloning {} ({})", url, service.branch));
                let commit = source::clone_repo(url, &service.branch, &source_dir).await?;
                log.push(format!("Checked out {}", commit));
                self.db.set_deployment_commit(deployment_id, &commit)?;
            }
            _ => {
                log.step("Using uploaded source");
                if !source_dir.is_dir() {
                    return Err(DeployError::SourceAcquisition(
                        "uploaded source is missing from the workspace".to_string(),
                    ));
                }
            }
        }

        let context = self
            .workspace
            .build_context(&service.id, &service.root_directory)?;

        log.step("Resolving build plan");
        let plan = self
            .resolver
            .resolve(&context)?
            .with_overrides(&service.overrides);
        log.push(format!(
            "Detected {} (port {}, runtime {})",
            plan.framework, plan.internal_port, plan.runtime_image
        ));
        self.db
            .set_service_framework(&service.id, &plan.framework, plan.internal_port)?;

        if builder::prepare_context(&context, &plan).await? {
            log.push("Generated Dockerfile");
        } else {
            log.push("Using Dockerfile from source");
        }

        let tag = image_tag(&service.name, deployment_id);
        log.step(format!("Building image {}", tag));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let build = self.lifecycle.build(&context, &tag, service.limits, tx);
        tokio::pin!(build);

        let result = loop {
            tokio::select! {
                Some(line) = rx.recv() => log.push(line),
                result = &mut build => break result,
            }
        };
        while let Ok(line) = rx.try_recv() {
            log.push(line);
        }

        Ok((result?, plan.internal_port))
    }

    /// Steps 4, 6 and 7 under the service lock
    async fn release(
        &self,
        service_id: &str,
        deployment_id: &str,
        image: &str,
        internal_port: u16,
        log: &mut BuildLog,
    ) -> Result<DeployOutcome, DeployError> {
        let _guard = self.locks.lock(service_id).await;

        // Re-read: a lifecycle action may have changed wiring during the build
        let service = self
            .db
            .get_service(service_id)?
            .ok_or_else(|| DeployError::NotFound("service was deleted during the build".to_string()))?;

        if let Some(handle) = self.lifecycle.handle_for(&service) {
            log.step("Removing previous container");
            if let BestEffort::Failed(reason) = self.lifecycle.remove(&service.id, &handle).await {
                log.push(format!("Warning: {}", reason));
            }
            self.db.clear_service_container(&service.id)?;
        }

        let port = match service.port {
            Some(port) => port,
            None => {
                let port = self.ports.allocate()?;
                self.db.set_service_port(&service.id, port)?;
                port
            }
        };

        log.step(format!("Starting container on port {}", port));
        let created = match service.kind {
            ServiceKind::App => {
                self.lifecycle
                    .create(&service, image, port, internal_port)
                    .await
            }
            ServiceKind::Vm => self.lifecycle.create_vm(&service, image, port).await,
        };
        let handle = created.map_err(container_start_error)?;
        self.db
            .set_service_container(&service.id, &handle, image, port, ServiceStatus::Building)?;
        self.lifecycle
            .start(&service.id, &handle)
            .await
            .map_err(container_start_error)?;

        self.health_check(&handle, log).await?;

        self.db.mark_deployed(&service.id)?;
        self.set_status(&service.id, ServiceStatus::Running)?;

        Ok(DeployOutcome {
            deployment_id: deployment_id.to_string(),
            image_ref: image.to_string(),
            container_id: handle,
            port,
        })
    }

    async fn health_check(&self, handle: &str, log: &mut BuildLog) -> Result<(), DeployError> {
        let grace = self.config.health_grace();
        log.step(format!("Health check in {}s", grace.as_secs()));
        tokio::time::sleep(grace).await;

        let state = self.lifecycle.inspect(handle).await?;
        if state.as_ref().map(|s| s.running).unwrap_or(false) {
            log.push("Container is running");
            return Ok(());
        }

        if let Ok(lines) = self.lifecycle.logs(handle, 20).await {
            for line in lines {
                log.push(format!("| {}", line));
            }
        }
        let detail = match state {
            Some(state) => match state.exit_code {
                Some(code) => format!("container {} (exit code {})", state.status, code),
                None => format!("container {}", state.status),
            },
            None => "container disappeared".to_string(),
        };
        Err(DeployError::HealthCheck(detail))
    }

    async fn rollback(
        &self,
        service: &ServiceRecord,
        deployment_id: &str,
        target_deployment_id: &str,
        log: &mut BuildLog,
    ) -> Result<DeployOutcome, DeployError> {
        let image = rollback_image(&self.db, &service.id, target_deployment_id)?;
        log.step(format!("Rolling back to deployment {} ({})", target_deployment_id, image));
        self.release(&service.id, deployment_id, &image, service.internal_port, log)
            .await
    }

    /// Remove images of successful deployments beyond the retention window
    async fn prune_images(&self, service_id: &str) {
        let images = match self.db.list_deployment_images(service_id) {
            Ok(images) => images,
            Err(e) => {
                warn!(service_id, error = %e, "Failed to list deployment images");
                return;
            }
        };

        let retained = self.config.retained_images.max(1);
        let keep: HashSet<&str> = images
            .iter()
            .take(retained)
            .map(|(_, image)| image.as_str())
            .collect();

        for (deployment_id, image) in images.iter().skip(retained) {
            if keep.contains(image.as_str()) {
                continue;
            }
            debug!(service_id, image, "Pruning old deployment image");
            if !self.lifecycle.remove_image(image).await.is_failed() {
                if let Err(e) = self.db.clear_deployment_image(deployment_id) {
                    warn!(deployment_id, error = %e, "Failed to clear pruned image");
                }
            }
        }
    }
}

/// Images built per deployment belong to the service; pulled ones are shared
fn builds_image(service: &ServiceRecord) -> bool {
    matches!(service.source_type, SourceType::Git | SourceType::Upload)
}

fn container_start_error(err: DeployError) -> DeployError {
    match err {
        DeployError::EngineUnavailable(_) | DeployError::ContainerStart(_) => err,
        other => DeployError::ContainerStart(other.to_string()),
    }
}

/// Image of a successful earlier deployment of the same service
fn rollback_image(db: &Database, service_id: &str, target_deployment_id: &str) -> Result<String, DeployError> {
    let target = db
        .get_deployment(target_deployment_id)?
        .filter(|d| d.service_id == service_id)
        .ok_or_else(|| DeployError::NotFound("deployment not found".to_string()))?;

    if target.status != DeploymentStatus::Success {
        return Err(DeployError::InvalidState(
            "only successful deployments can be rolled back to".to_string(),
        ));
    }
    target.image_ref.ok_or_else(|| {
        DeployError::InvalidState("deployment image is no longer available".to_string())
    })
}

struct DeployJob {
    request: DeployRequest,
    deployment_id: String,
    reply: oneshot::Sender<Result<DeployOutcome, DeployError>>,
}

/// Handle to a queued job
#[derive(Debug)]
pub struct DeployTicket {
    pub deployment_id: String,
    reply: oneshot::Receiver<Result<DeployOutcome, DeployError>>,
}

impl DeployTicket {
    /// Wait for the job to finish. Dropping the ticket detaches instead.
    pub async fn wait(self) -> Result<DeployOutcome, DeployError> {
        self.reply
            .await
            .unwrap_or_else(|_| Err(DeployError::Internal("deploy worker stopped".to_string())))
    }
}

/// Global FIFO of deployments drained by a single worker
#[derive(Clone)]
pub struct DeployQueue {
    tx: mpsc::UnboundedSender<DeployJob>,
    pending: Arc<AtomicUsize>,
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
}

impl DeployQueue {
    /// Spawn the worker. It exits when shutdown is signalled or every queue
    /// handle is dropped.
    pub fn start(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeployJob>();
        let pending = Arc::new(AtomicUsize::new(0));

        let queue = Self {
            tx,
            pending: pending.clone(),
            db: pipeline.db.clone(),
            lifecycle: pipeline.lifecycle.clone(),
        };

        let worker = tokio::spawn(async move {
            info!("Deploy worker started");
            loop {
                let job = tokio::select! {
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        info!("Deploy worker shutting down");
                        break;
                    }
                };
                pending.fetch_sub(1, Ordering::SeqCst);

                debug!(service_id = %job.request.service_id, deployment_id = %job.deployment_id, "Running deploy job");
                let result = pipeline.run(&job.request, &job.deployment_id).await;
                let _ = job.reply.send(result);
            }
        });

        (queue, worker)
    }

    /// Validate and record a deployment, then queue it behind any others
    pub fn enqueue(&self, request: DeployRequest) -> Result<DeployTicket, DeployError> {
        self.lifecycle.ensure_available()?;

        let service = self
            .db
            .get_service(&request.service_id)?
            .ok_or_else(|| DeployError::NotFound("service not found".to_string()))?;

        let image_ref = match &request.kind {
            DeployKind::Build => None,
            DeployKind::Rollback { target_deployment_id } => {
                Some(rollback_image(&self.db, &service.id, target_deployment_id)?)
            }
        };

        let deployment = DeploymentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            service_id: service.id.clone(),
            status: DeploymentStatus::Pending,
            image_ref,
            build_log: String::new(),
            commit_sha: None,
            branch: match service.source_type {
                SourceType::Git => Some(service.branch.clone()),
                _ => None,
            },
            duration_secs: None,
            triggered_by: request.triggered_by.clone(),
            started_at: crate::db::now(),
            finished_at: None,
        };
        self.db.create_deployment(&deployment)?;

        let (reply, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let job = DeployJob {
            request,
            deployment_id: deployment.id.clone(),
            reply,
        };
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DeployError::Internal("deploy worker is not running".to_string()));
        }

        info!(service = %service.name, deployment_id = %deployment.id, "Deployment queued");
        Ok(DeployTicket {
            deployment_id: deployment.id,
            reply: rx,
        })
    }

    /// Jobs waiting behind the one currently running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
