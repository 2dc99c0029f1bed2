//! User-issued service operations: intake, lifecycle actions, configuration
//! updates and deletion.
//!
//! Every mutation of an existing service takes that service's lock from
//! [`ServiceLocks`], the same lock the pipeline holds while it swaps
//! containers, so a stop can never interleave with container replacement.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::builder::sanitize_label;
use crate::db::{CreateOutcome, Database, ResourceLimits, ServiceKind, ServiceRecord, ServiceStatus, SourceType};
use crate::error::DeployError;
use crate::events::{Event, EventBus};
use crate::lifecycle::{BestEffort, LifecycleManager, ServiceLocks};
use crate::pipeline::{DeployQueue, DeployRequest, DeployTicket};
use crate::plan::BuildOverrides;
use crate::ports::PortAllocator;
use crate::source::{self, validate_root_directory, Workspace};
use crate::vm::{self, VmSpec};

/// Attempts at finding an unused generated VM name
const NAME_ATTEMPTS: usize = 10;

/// Extra allocations when a port is claimed between allocation and insert
const PORT_ATTEMPTS: usize = 3;

/// A new application service
#[derive(Debug, Clone)]
pub struct NewApp {
    pub name: String,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub branch: Option<String>,
    pub root_directory: Option<String>,
    pub env_vars: HashMap<String, String>,
    pub preset: Option<String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<i64>,
    pub restart_policy: Option<String>,
    pub overrides: BuildOverrides,
}

impl NewApp {
    pub fn new(name: &str, source_type: SourceType) -> Self {
        Self {
            name: name.to_string(),
            source_type,
            source_url: None,
            branch: None,
            root_directory: None,
            env_vars: HashMap::new(),
            preset: None,
            cpu_limit: None,
            memory_limit: None,
            restart_policy: None,
            overrides: BuildOverrides::default(),
        }
    }
}

/// Service names double as subdomain labels
pub fn validate_service_name(name: &str) -> Result<(), DeployError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DeployError::InvalidState(format!(
            "invalid name '{}': use 1-63 letters, digits or hyphens",
            name
        )))
    }
}

/// Default service name for a repository URL
pub fn name_from_url(url: &str) -> String {
    let last = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();
    sanitize_label(last.trim_end_matches(".git"))
}

/// Preset limits, with explicit values taking precedence
pub fn resolve_limits(
    defaults: ResourceLimits,
    preset: Option<&str>,
    cpu: Option<f64>,
    memory: Option<i64>,
) -> Result<(ResourceLimits, String), DeployError> {
    let (mut limits, mut preset_name) = match preset {
        Some(name) => {
            let limits = ResourceLimits::preset(name)
                .ok_or_else(|| DeployError::InvalidState(format!("unknown preset '{}'", name)))?;
            (limits, name.to_string())
        }
        None => (defaults, "micro".to_string()),
    };

    if let Some(cpu) = cpu {
        if !(cpu > 0.0 && cpu <= 64.0) {
            return Err(DeployError::InvalidState("cpuLimit must be in (0, 64]".to_string()));
        }
        limits.cpu = cpu;
        preset_name = "custom".to_string();
    }
    if let Some(memory) = memory {
        if memory < 6 * 1024 * 1024 {
            return Err(DeployError::InvalidState(
                "memoryLimit must be at least 6 MiB".to_string(),
            ));
        }
        limits.memory = memory;
        preset_name = "custom".to_string();
    }
    Ok((limits, preset_name))
}

pub struct ServiceControl {
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
    ports: Arc<PortAllocator>,
    locks: ServiceLocks,
    events: EventBus,
    workspace: Workspace,
    queue: DeployQueue,
    default_limits: ResourceLimits,
}

impl ServiceControl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        lifecycle: Arc<LifecycleManager>,
        ports: Arc<PortAllocator>,
        locks: ServiceLocks,
        events: EventBus,
        workspace: Workspace,
        queue: DeployQueue,
        default_limits: ResourceLimits,
    ) -> Self {
        Self {
            db,
            lifecycle,
            ports,
            locks,
            events,
            workspace,
            queue,
            default_limits,
        }
    }

    pub fn queue(&self) -> &DeployQueue {
        &self.queue
    }

    pub fn get(&self, service_id: &str) -> Result<ServiceRecord, DeployError> {
        self.db
            .get_service(service_id)?
            .ok_or_else(|| DeployError::NotFound("service not found".to_string()))
    }

    fn set_status(&self, service_id: &str, status: ServiceStatus) -> Result<(), DeployError> {
        self.db.update_service_status(service_id, status)?;
        self.events.publish(Event::status(service_id, status));
        Ok(())
    }

    fn audit(&self, action: &str, service: &ServiceRecord, details: &str) {
        if let Err(e) = self
            .db
            .insert_audit(action, Some(&service.id), Some(&service.name), details)
        {
            warn!(action, error = %e, "Failed to write audit entry");
        }
    }

    /// Insert a record under a unique name with a fresh port
    fn register(&self, mut record: ServiceRecord) -> Result<ServiceRecord, DeployError> {
        validate_service_name(&record.name)?;
        if self.db.get_service_by_name(&record.name)?.is_some() {
            return Err(DeployError::Conflict(format!(
                "a service named '{}' already exists",
                record.name
            )));
        }

        let mut attempts = 0;
        loop {
            record.port = Some(self.ports.allocate()?);
            match self.db.try_create_service(&record)? {
                CreateOutcome::Created => break,
                CreateOutcome::NameTaken => {
                    return Err(DeployError::Conflict(format!(
                        "a service named '{}' already exists",
                        record.name
                    )))
                }
                // Taken between allocation and insert; the cursor has moved on
                CreateOutcome::PortTaken if attempts < PORT_ATTEMPTS => {
                    attempts += 1;
                    warn!(service = %record.name, port = ?record.port, "Port was claimed concurrently, retrying");
                }
                CreateOutcome::PortTaken => {
                    return Err(DeployError::Internal(format!(
                        "no free port after {} attempts",
                        PORT_ATTEMPTS + 1
                    )))
                }
            }
        }

        info!(service = %record.name, port = ?record.port, kind = %record.kind, "Service created");
        self.audit("create", &record, &format!("{} service", record.kind));
        Ok(record)
    }

    // ==================== Intake ====================

    /// Create an app service. Upload sources must be staged with
    /// [`ServiceControl::stage_upload`] before a deploy is queued.
    pub fn create_app(&self, new: NewApp) -> Result<ServiceRecord, DeployError> {
        let (limits, preset) = resolve_limits(
            self.default_limits,
            new.preset.as_deref(),
            new.cpu_limit,
            new.memory_limit,
        )?;

        let mut record = ServiceRecord::new_app(&new.name, new.source_type, limits);
        record.resource_preset = preset;
        record.source_url = new.source_url;
        if let Some(branch) = new.branch.filter(|b| !b.trim().is_empty()) {
            record.branch = branch.trim().to_string();
        }
        if let Some(root) = new.root_directory {
            validate_root_directory(&root)?;
            record.root_directory = root;
        }
        if let Some(policy) = new.restart_policy {
            record.restart_policy = policy;
        }
        record.env_vars = new.env_vars;
        record.overrides = new.overrides;

        self.register(record)
    }

    /// Extract an uploaded archive into the service workspace
    pub async fn stage_upload(
        &self,
        service_id: &str,
        archive: &Path,
        filename: &str,
    ) -> Result<(), DeployError> {
        let dest = self.workspace.source_dir(service_id);
        source::extract_archive(archive, filename, &dest).await
    }

    /// Queue a full deploy of the service's current source
    pub fn deploy(&self, service_id: &str, triggered_by: &str) -> Result<DeployTicket, DeployError> {
        let service = self.get(service_id)?;
        match service.status {
            ServiceStatus::Building => {
                return Err(DeployError::InvalidState("Currently building".to_string()))
            }
            ServiceStatus::Archived => {
                return Err(DeployError::InvalidState("Service is archived".to_string()))
            }
            _ => {}
        }
        self.queue.enqueue(DeployRequest::build(service_id, triggered_by))
    }

    pub fn rollback(&self, service_id: &str, deployment_id: &str) -> Result<DeployTicket, DeployError> {
        let service = self.get(service_id)?;
        if service.status == ServiceStatus::Archived {
            return Err(DeployError::InvalidState("Service is archived".to_string()));
        }
        self.queue
            .enqueue(DeployRequest::rollback(service_id, deployment_id))
    }

    /// Pull the OS image, then create and start a VM container
    pub async fn create_vm(&self, mut spec: VmSpec) -> Result<ServiceRecord, DeployError> {
        if !vm::is_supported_image(&spec.os_image) {
            return Err(DeployError::InvalidState(format!(
                "unsupported OS image '{}'; choose one of {}",
                spec.os_image,
                vm::OS_IMAGES.join(", ")
            )));
        }
        self.lifecycle.ensure_available()?;

        if spec.name.is_empty() {
            spec.name = self.unused_vm_name()?;
        }

        let record = self.register(vm::new_record(&spec))?;
        let _guard = self.locks.lock(&record.id).await;

        match self.provision_vm(&record, &spec.os_image).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(vm = %record.name, error = %e, "VM provisioning failed");
                self.set_status(&record.id, ServiceStatus::Error)?;
                Err(e)
            }
        }
    }

    fn unused_vm_name(&self) -> Result<String, DeployError> {
        let mut rng = rand::thread_rng();
        for _ in 0..NAME_ATTEMPTS {
            let name = vm::generate_name(&mut rng);
            if self.db.get_service_by_name(&name)?.is_none() {
                return Ok(name);
            }
        }
        Err(DeployError::Conflict("could not generate an unused name".to_string()))
    }

    async fn provision_vm(&self, record: &ServiceRecord, os_image: &str) -> Result<ServiceRecord, DeployError> {
        let port = record
            .port
            .ok_or_else(|| DeployError::Internal("VM has no port".to_string()))?;

        self.set_status(&record.id, ServiceStatus::Building)?;
        self.lifecycle.pull(os_image).await?;

        let handle = self.lifecycle.create_vm(record, os_image, port).await?;
        self.db
            .set_service_container(&record.id, &handle, os_image, port, ServiceStatus::Building)?;
        self.lifecycle.start(&record.id, &handle).await?;
        self.db.mark_deployed(&record.id)?;
        self.set_status(&record.id, ServiceStatus::Running)?;

        info!(vm = %record.name, os_image, port, "VM started");
        self.get(&record.id)
    }

    // ==================== Lifecycle actions ====================

    pub async fn start(&self, service_id: &str) -> Result<ServiceRecord, DeployError> {
        self.lifecycle.ensure_available()?;
        let _guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;

        match service.status {
            ServiceStatus::Running => {
                return Err(DeployError::InvalidState("Already running".to_string()))
            }
            ServiceStatus::Building => {
                return Err(DeployError::InvalidState("Currently building".to_string()))
            }
            ServiceStatus::Archived => {
                return Err(DeployError::InvalidState("Service is archived".to_string()))
            }
            _ => {}
        }
        let no_container = || DeployError::InvalidState("No container, redeploy first".to_string());
        let handle = self.lifecycle.handle_for(&service).ok_or_else(no_container)?;

        if let Err(e) = self.lifecycle.start(&service.id, &handle).await {
            if matches!(e, DeployError::NotFound(_)) {
                self.db.clear_service_container(&service.id)?;
                return Err(no_container());
            }
            return Err(e);
        }

        self.set_status(&service.id, ServiceStatus::Running)?;
        self.audit("start", &service, "");
        self.get(service_id)
    }

    pub async fn stop(&self, service_id: &str) -> Result<ServiceRecord, DeployError> {
        self.lifecycle.ensure_available()?;
        let _guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;

        match service.status {
            ServiceStatus::Stopped | ServiceStatus::Archived => {
                return Err(DeployError::InvalidState("Already stopped".to_string()))
            }
            ServiceStatus::Building => {
                return Err(DeployError::InvalidState("Currently building".to_string()))
            }
            _ => {}
        }

        if let Some(handle) = self.lifecycle.handle_for(&service) {
            self.lifecycle.stop(&handle).await?;
        }

        self.set_status(&service.id, ServiceStatus::Stopped)?;
        self.audit("stop", &service, "");
        self.get(service_id)
    }

    pub async fn restart(&self, service_id: &str) -> Result<ServiceRecord, DeployError> {
        self.lifecycle.ensure_available()?;
        let _guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;

        if service.status != ServiceStatus::Running {
            return Err(DeployError::InvalidState("Service is not running".to_string()));
        }
        let handle = self
            .lifecycle
            .handle_for(&service)
            .ok_or_else(|| DeployError::InvalidState("No container, redeploy first".to_string()))?;

        self.lifecycle.restart(&service.id, &handle).await?;
        self.events.publish(Event::status(&service.id, ServiceStatus::Running));
        self.audit("restart", &service, "");
        self.get(service_id)
    }

    /// Archive (stopping the container) or unarchive into `stopped`
    pub async fn toggle_archive(&self, service_id: &str) -> Result<ServiceRecord, DeployError> {
        let _guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;

        if service.status == ServiceStatus::Archived {
            self.set_status(&service.id, ServiceStatus::Stopped)?;
            self.audit("unarchive", &service, "");
            return self.get(service_id);
        }
        if service.status == ServiceStatus::Building {
            return Err(DeployError::InvalidState("Currently building".to_string()));
        }

        if service.status == ServiceStatus::Running {
            self.lifecycle.ensure_available()?;
            if let Some(handle) = self.lifecycle.handle_for(&service) {
                self.lifecycle.stop(&handle).await?;
            }
        }

        self.set_status(&service.id, ServiceStatus::Archived)?;
        self.audit("archive", &service, "");
        self.get(service_id)
    }

    /// Remove the container, images and workspace, then the record. The
    /// record stays if the container cannot be removed.
    pub async fn delete(&self, service_id: &str) -> Result<(), DeployError> {
        self.lifecycle.ensure_available()?;
        let guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;

        if let Some(handle) = self.lifecycle.handle_for(&service) {
            if let BestEffort::Failed(reason) = self.lifecycle.remove(&service.id, &handle).await {
                return Err(DeployError::ContainerStart(format!(
                    "could not remove container, service kept: {}",
                    reason
                )));
            }
        }

        // OS images are shared between VMs
        if service.kind == ServiceKind::App {
            let mut images: Vec<String> = self
                .db
                .list_deployment_images(&service.id)?
                .into_iter()
                .map(|(_, image)| image)
                .collect();
            images.extend(service.image_ref.clone());
            images.sort();
            images.dedup();
            for image in images {
                self.lifecycle.remove_image(&image).await;
            }
        }

        if let Err(e) = self.workspace.remove(&service.id).await {
            warn!(service = %service.name, error = %e, "Failed to remove workspace");
        }

        self.db.delete_service(&service.id)?;
        drop(guard);
        self.locks.forget(&service.id);

        self.events.publish(Event::ServiceDeleted {
            service_id: service.id.clone(),
        });
        self.audit("delete", &service, "");
        info!(service = %service.name, "Service deleted");
        Ok(())
    }

    // ==================== Configuration ====================

    /// Replace env vars; they reach the container on its next recreate
    pub async fn update_env(
        &self,
        service_id: &str,
        env: HashMap<String, String>,
    ) -> Result<ServiceRecord, DeployError> {
        let _guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;

        if let Some(key) = env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(DeployError::InvalidState(format!("invalid variable name '{}'", key)));
        }

        self.db.update_service_env(&service.id, &env)?;
        self.audit("env_update", &service, &format!("{} variables", env.len()));
        self.get(service_id)
    }

    /// Persist new limits and try to apply them to the running container.
    /// Returns the updated record and whether the live update succeeded.
    pub async fn update_resources(
        &self,
        service_id: &str,
        preset: Option<&str>,
        cpu: Option<f64>,
        memory: Option<i64>,
    ) -> Result<(ServiceRecord, bool), DeployError> {
        let _guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;
        let (limits, preset) = resolve_limits(service.limits, preset, cpu, memory)?;

        self.db.update_service_resources(&service.id, limits, &preset)?;

        let mut applied = false;
        if service.status == ServiceStatus::Running {
            if let Some(handle) = self.lifecycle.handle_for(&service) {
                applied = self.lifecycle.update_resources(&handle, &limits).await == BestEffort::Done;
            }
        }

        self.audit(
            "resources_update",
            &service,
            &format!("cpu={} memory={} live={}", limits.cpu, limits.memory, applied),
        );
        Ok((self.get(service_id)?, applied))
    }

    /// Store build overrides, branch, root directory and restart policy
    pub async fn update_build(
        &self,
        service_id: &str,
        overrides: BuildOverrides,
        branch: Option<String>,
        root_directory: Option<String>,
        restart_policy: Option<String>,
    ) -> Result<ServiceRecord, DeployError> {
        let _guard = self.locks.lock(service_id).await;
        let service = self.get(service_id)?;

        let root_directory = root_directory.unwrap_or(service.root_directory);
        validate_root_directory(&root_directory)?;

        self.db.update_service_build(
            &service.id,
            &overrides,
            branch.as_deref().unwrap_or(&service.branch),
            &root_directory,
            restart_policy.as_deref().unwrap_or(&service.restart_policy),
        )?;
        self.get(service_id)
    }
}
