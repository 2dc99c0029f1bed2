//! Container lifecycle manager
//!
//! The only component that talks to the [`ContainerEngine`]. It applies the
//! platform's container policy (naming, labels, limits, restart policy),
//! keeps a live table of service → container handles, normalizes stats and
//! log output, and reconciles persisted state against the engine at startup.
//!
//! While the engine is unreachable the manager is *degraded*: every
//! operation fails fast with [`DeployError::EngineUnavailable`] until a probe
//! succeeds again.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::builder::sanitize_label;
use crate::config::EngineConfig;
use crate::db::{Database, ResourceLimits, ServiceKind, ServiceRecord, ServiceStatus};
use crate::engine::{
    BuildRequest, ContainerEngine, ContainerSpec, ContainerState, LogFrame, LogStream,
    RestartPolicy, StatsSnapshot, LABEL_KIND, LABEL_MANAGED, LABEL_SERVICE,
};
use crate::error::{DeployError, EngineError};

/// Buffered log lines per followed container
const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Longest partial line kept before it is flushed as-is
const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Normalized container resource usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub pid_count: u64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Derive usage from the current snapshot and the previous one for the same
/// container. Without a previous snapshot CPU usage reads as zero.
pub fn compute_stats(prev: Option<&StatsSnapshot>, cur: &StatsSnapshot) -> ContainerStats {
    let cpu_percent = prev
        .map(|prev| {
            let cpu_delta = cur.cpu_total.saturating_sub(prev.cpu_total) as f64;
            let system_delta = cur.system_cpu.saturating_sub(prev.system_cpu) as f64;
            if cpu_delta > 0.0 && system_delta > 0.0 {
                round2(cpu_delta / system_delta * cur.online_cpus.max(1) as f64 * 100.0)
            } else {
                0.0
            }
        })
        .unwrap_or(0.0);

    let memory_percent = if cur.memory_limit > 0 {
        round2(cur.memory_used as f64 / cur.memory_limit as f64 * 100.0)
    } else {
        0.0
    };

    ContainerStats {
        cpu_percent,
        memory_used_bytes: cur.memory_used,
        memory_limit_bytes: cur.memory_limit,
        memory_percent,
        net_rx_bytes: cur.net_rx,
        net_tx_bytes: cur.net_tx,
        pid_count: cur.pids,
    }
}

/// Outcome of a cleanup step whose failure must not abort the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    Done,
    /// Nothing to do
    Skipped,
    Failed(String),
}

impl BestEffort {
    pub fn is_failed(&self) -> bool {
        matches!(self, BestEffort::Failed(_))
    }

    fn logged(self, what: &str, target: &str) -> Self {
        if let BestEffort::Failed(reason) = &self {
            warn!(target_ref = target, %reason, "Best-effort {} failed", what);
        }
        self
    }
}

/// Reassembles engine frames into text lines, per output stream
#[derive(Debug, Default)]
pub struct LineSplitter {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, frame: &LogFrame) -> Vec<String> {
        let buf = match frame.stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        };
        buf.extend_from_slice(&frame.data);

        let mut lines = Vec::new();
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buf.drain(..=pos).collect();
            push_line(&mut lines, &raw);
        }
        if buf.len() > MAX_PARTIAL_LINE {
            let raw = std::mem::take(buf);
            push_line(&mut lines, &raw);
        }
        lines
    }

    /// Flush whatever partial lines remain
    pub fn finish(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        push_line(&mut lines, &std::mem::take(&mut self.stdout));
        push_line(&mut lines, &std::mem::take(&mut self.stderr));
        lines
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n']);
    if !line.trim().is_empty() {
        lines.push(line.to_string());
    }
}

/// A live subscription to one container's output
pub struct LogSubscription {
    rx: broadcast::Receiver<String>,
}

impl LogSubscription {
    /// Next line; a marker line replaces anything dropped because this
    /// subscriber fell behind. `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<String> {
        match self.rx.recv().await {
            Ok(line) => Some(line),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(format!("[… {} lines skipped]", skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Per-service mutex serializing lifecycle transitions of one service
#[derive(Clone, Default)]
pub struct ServiceLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ServiceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, service_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(service_id.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }

    pub fn forget(&self, service_id: &str) {
        self.locks.remove(service_id);
    }
}

/// Container name for a service
pub fn container_name(service: &ServiceRecord) -> String {
    let label = sanitize_label(&service.name);
    match service.kind {
        ServiceKind::App => {
            let short: String = service.id.chars().filter(|c| *c != '-').take(8).collect();
            format!("hostdeck-{}-{}", label, short)
        }
        ServiceKind::Vm => format!("hostdeck-vm-{}", label),
    }
}

fn labels(service: &ServiceRecord) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_SERVICE.to_string(), service.id.clone()),
        (LABEL_KIND.to_string(), service.kind.as_str().to_string()),
        (LABEL_MANAGED.to_string(), "true".to_string()),
    ])
}

fn env_list(env: &HashMap<String, String>) -> Vec<String> {
    let mut list: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    list.sort();
    list
}

/// Package bootstrap run before a VM's startup script
fn vm_base_setup(os_image: &str) -> &'static str {
    match os_image.split(':').next().unwrap_or_default() {
        "ubuntu" | "debian" => {
            "if ! command -v sudo > /dev/null; then apt-get update && apt-get install -y sudo curl wget nano; fi"
        }
        "alpine" => "if ! command -v sudo > /dev/null; then apk add --no-cache sudo curl wget nano bash; fi",
        "centos" => "if ! command -v sudo > /dev/null; then dnf install -y sudo curl wget nano; fi",
        _ => "",
    }
}

pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    db: Arc<Database>,
    config: EngineConfig,
    /// service id → container id for containers this process has seen alive
    live: DashMap<String, String>,
    /// container id → last raw stats snapshot
    prev_stats: DashMap<String, StatsSnapshot>,
    /// container id → log fan-out
    log_channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    degraded: AtomicBool,
}

impl LifecycleManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, db: Arc<Database>, config: EngineConfig) -> Self {
        Self {
            engine,
            db,
            config,
            live: DashMap::new(),
            prev_stats: DashMap::new(),
            log_channels: Arc::new(DashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    // ==================== Engine availability ====================

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Probe the engine and update the degraded flag. Returns availability.
    pub async fn refresh_engine_status(&self) -> bool {
        let available = match self.engine.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Engine probe failed");
                false
            }
        };
        let was_degraded = self.degraded.swap(!available, Ordering::SeqCst);
        if was_degraded && available {
            info!("Container engine is reachable again, leaving degraded mode");
        } else if !was_degraded && !available {
            warn!("Container engine unreachable, entering degraded mode");
        }
        available
    }

    pub fn ensure_available(&self) -> Result<(), DeployError> {
        if self.is_degraded() {
            return Err(DeployError::EngineUnavailable(
                "container engine is not responding; lifecycle operations are disabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Convert an engine error, entering degraded mode if the engine is gone
    fn engine_error(&self, err: EngineError) -> DeployError {
        if matches!(err, EngineError::Unavailable(_)) {
            if !self.degraded.swap(true, Ordering::SeqCst) {
                warn!(error = %err, "Container engine unreachable, entering degraded mode");
            }
        }
        err.into()
    }

    /// Container handle for a service: live table first, then the persisted id
    pub fn handle_for(&self, service: &ServiceRecord) -> Option<String> {
        self.live
            .get(&service.id)
            .map(|h| h.value().clone())
            .or_else(|| service.container_id.clone())
    }

    // ==================== Images ====================

    /// Build `tag` from `context_dir` with build-time limits scaled from the
    /// service's runtime limits. Output lines go to `log`.
    pub async fn build(
        &self,
        context_dir: &Path,
        tag: &str,
        runtime_limits: ResourceLimits,
        log: mpsc::UnboundedSender<String>,
    ) -> Result<String, DeployError> {
        self.ensure_available()?;

        let request = BuildRequest {
            context_dir: context_dir.to_path_buf(),
            tag: tag.to_string(),
            limits: runtime_limits.scaled(self.config.build_multiplier),
        };

        match self.engine.build_image(&request, log).await {
            Ok(()) => Ok(tag.to_string()),
            Err(EngineError::Unavailable(msg)) => {
                Err(self.engine_error(EngineError::Unavailable(msg)))
            }
            Err(e) => Err(DeployError::ImageBuild(e.to_string())),
        }
    }

    pub async fn pull(&self, image: &str) -> Result<(), DeployError> {
        self.ensure_available()?;
        self.engine
            .pull_image(image)
            .await
            .map_err(|e| self.engine_error(e))
    }

    pub async fn remove_image(&self, image: &str) -> BestEffort {
        if self.is_degraded() {
            return BestEffort::Failed("container engine unavailable".to_string());
        }
        match self.engine.remove_image(image).await {
            Ok(()) | Err(EngineError::NotFound(_)) => BestEffort::Done,
            Err(e) => BestEffort::Failed(e.to_string()),
        }
        .logged("image removal", image)
    }

    // ==================== Containers ====================

    /// Create an application container from a built image
    pub async fn create(
        &self,
        service: &ServiceRecord,
        image: &str,
        host_port: u16,
        internal_port: u16,
    ) -> Result<String, DeployError> {
        let mut env = service.env_vars.clone();
        env.insert("PORT".to_string(), internal_port.to_string());
        env.insert("HOST".to_string(), "0.0.0.0".to_string());

        let spec = ContainerSpec {
            name: container_name(service),
            image: image.to_string(),
            env: env_list(&env),
            labels: labels(service),
            host_port,
            internal_port,
            limits: service.limits,
            pids_limit: self.config.pids_limit,
            restart: RestartPolicy::parse(&service.restart_policy),
            cmd: None,
            tty: false,
        };
        self.create_from_spec(&service.id, &spec).await
    }

    /// Create a long-lived VM container from an OS image
    pub async fn create_vm(
        &self,
        service: &ServiceRecord,
        os_image: &str,
        host_port: u16,
    ) -> Result<String, DeployError> {
        let mut env = service.env_vars.clone();
        env.insert("TERM".to_string(), "xterm-256color".to_string());

        let setup = [
            vm_base_setup(os_image),
            service.startup_script.as_deref().unwrap_or_default().trim(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ; ");
        let script = if setup.is_empty() {
            "exec sleep infinity".to_string()
        } else {
            format!("{} ; exec sleep infinity", setup)
        };

        let spec = ContainerSpec {
            name: container_name(service),
            image: os_image.to_string(),
            env: env_list(&env),
            labels: labels(service),
            host_port,
            internal_port: service.internal_port,
            limits: service.limits,
            pids_limit: self.config.vm_pids_limit,
            restart: RestartPolicy::UnlessStopped,
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            tty: true,
        };
        self.create_from_spec(&service.id, &spec).await
    }

    async fn create_from_spec(&self, service_id: &str, spec: &ContainerSpec) -> Result<String, DeployError> {
        self.ensure_available()?;

        let handle = match self.engine.create_container(spec).await {
            Ok(handle) => handle,
            Err(EngineError::Conflict(msg)) => {
                // A container left over from a failed eviction still holds the name
                warn!(name = %spec.name, %msg, "Container name in use, removing stale container");
                self.force_remove(&spec.name).await;
                self.engine
                    .create_container(spec)
                    .await
                    .map_err(|e| self.engine_error(e))?
            }
            Err(e) => return Err(self.engine_error(e)),
        };

        self.live.insert(service_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn start(&self, service_id: &str, handle: &str) -> Result<(), DeployError> {
        self.ensure_available()?;
        self.engine
            .start_container(handle)
            .await
            .map_err(|e| self.engine_error(e))?;
        self.live.insert(service_id.to_string(), handle.to_string());
        Ok(())
    }

    /// Stop with the configured grace period. Already stopped or already
    /// gone counts as stopped.
    pub async fn stop(&self, handle: &str) -> Result<(), DeployError> {
        self.ensure_available()?;
        match self.engine.stop_container(handle, self.config.stop_grace()).await {
            Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(self.engine_error(e)),
        }
    }

    pub async fn restart(&self, service_id: &str, handle: &str) -> Result<(), DeployError> {
        self.ensure_available()?;
        self.engine
            .restart_container(handle, self.config.stop_grace())
            .await
            .map_err(|e| self.engine_error(e))?;
        self.live.insert(service_id.to_string(), handle.to_string());
        Ok(())
    }

    async fn force_remove(&self, handle: &str) -> BestEffort {
        match self.engine.remove_container(handle, true).await {
            Ok(()) | Err(EngineError::NotFound(_)) => BestEffort::Done,
            Err(e) => BestEffort::Failed(e.to_string()),
        }
    }

    /// Stop then remove, forcing on the second attempt. A container that is
    /// already gone is a success.
    pub async fn remove(&self, service_id: &str, handle: &str) -> BestEffort {
        if self.is_degraded() {
            return BestEffort::Failed("container engine unavailable".to_string());
        }

        if let Err(e) = self.engine.stop_container(handle, self.config.remove_grace()).await {
            if !matches!(e, EngineError::NotFound(_)) {
                debug!(container_id = handle, error = %e, "Stop before removal failed");
            }
        }

        let outcome = match self.engine.remove_container(handle, false).await {
            Ok(()) | Err(EngineError::NotFound(_)) => BestEffort::Done,
            Err(_) => self.force_remove(handle).await,
        };

        self.live.remove_if(service_id, |_, live| live == handle);
        self.prev_stats.remove(handle);
        self.log_channels.remove(handle);

        outcome.logged("container removal", handle)
    }

    /// Current engine state, `None` if the container no longer exists
    pub async fn inspect(&self, handle: &str) -> Result<Option<ContainerState>, DeployError> {
        self.ensure_available()?;
        self.engine
            .inspect_container(handle)
            .await
            .map_err(|e| self.engine_error(e))
    }

    pub async fn is_running(&self, handle: &str) -> Result<bool, DeployError> {
        Ok(self.inspect(handle).await?.map(|s| s.running).unwrap_or(false))
    }

    /// Usage since the previous call for the same container
    pub async fn stats(&self, handle: &str) -> Result<ContainerStats, DeployError> {
        self.ensure_available()?;
        let snapshot = self
            .engine
            .stats_snapshot(handle)
            .await
            .map_err(|e| self.engine_error(e))?;

        let prev = self.prev_stats.insert(handle.to_string(), snapshot);
        Ok(compute_stats(prev.as_ref(), &snapshot))
    }

    /// Last `tail` lines of combined output
    pub async fn logs(&self, handle: &str, tail: usize) -> Result<Vec<String>, DeployError> {
        self.ensure_available()?;
        let frames = self
            .engine
            .logs(handle, tail)
            .await
            .map_err(|e| self.engine_error(e))?;

        let mut splitter = LineSplitter::default();
        let mut lines: Vec<String> = frames.iter().flat_map(|f| splitter.push(f)).collect();
        lines.extend(splitter.finish());

        if lines.len() > tail {
            lines.drain(..lines.len() - tail);
        }
        Ok(lines)
    }

    /// Subscribe to a container's output. One producer per container is
    /// shared by all subscribers and stops after the last one leaves.
    pub fn subscribe_logs(&self, handle: &str) -> LogSubscription {
        let rx = match self.log_channels.entry(handle.to_string()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
                entry.insert(tx.clone());
                let frames = self.engine.follow_logs(handle);
                tokio::spawn(pump_logs(
                    frames,
                    tx,
                    self.log_channels.clone(),
                    handle.to_string(),
                ));
                rx
            }
        };
        LogSubscription { rx }
    }

    /// Number of containers with an active log producer
    pub fn followed_containers(&self) -> usize {
        self.log_channels.len()
    }

    /// Apply limits to a running container. Engines may refuse; the new
    /// limits then take effect on the next recreate.
    pub async fn update_resources(&self, handle: &str, limits: &ResourceLimits) -> BestEffort {
        if self.is_degraded() {
            return BestEffort::Failed("container engine unavailable".to_string());
        }
        match self.engine.update_resources(handle, limits).await {
            Ok(()) => BestEffort::Done,
            Err(e) => BestEffort::Failed(e.to_string()),
        }
        .logged("live resource update", handle)
    }

    // ==================== Fleet ====================

    /// Correct persisted `running` status against the engine. Returns how
    /// many services are live afterwards.
    pub async fn reconcile_on_startup(&self) -> Result<usize, DeployError> {
        self.ensure_available()?;
        let services = self.db.list_services_by_status(ServiceStatus::Running)?;
        let mut recovered = 0;

        for service in services {
            let Some(handle) = service.container_id.clone() else {
                warn!(service = %service.name, "Running service has no container, marking stopped");
                self.db.update_service_status(&service.id, ServiceStatus::Stopped)?;
                continue;
            };

            match self.engine.inspect_container(&handle).await {
                Ok(Some(state)) if state.running => {
                    self.live.insert(service.id.clone(), handle);
                    recovered += 1;
                }
                Ok(Some(_)) => match self.engine.start_container(&handle).await {
                    Ok(()) => {
                        info!(service = %service.name, "Restarted stopped container");
                        self.live.insert(service.id.clone(), handle);
                        recovered += 1;
                    }
                    Err(e) => {
                        warn!(service = %service.name, error = %e, "Could not restart container, marking stopped");
                        self.db.update_service_status(&service.id, ServiceStatus::Stopped)?;
                    }
                },
                Ok(None) => {
                    warn!(service = %service.name, container_id = %handle, "Container is gone, marking stopped");
                    self.db.clear_service_container(&service.id)?;
                    self.db.update_service_status(&service.id, ServiceStatus::Stopped)?;
                }
                Err(e) => return Err(self.engine_error(e)),
            }
        }

        info!(recovered, "Reconciled services with container engine");
        Ok(recovered)
    }

    /// Stop every container carrying the managed label
    pub async fn stop_all_managed(&self) -> usize {
        if self.is_degraded() {
            return 0;
        }
        let containers = match self.engine.list_managed().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Failed to list managed containers");
                return 0;
            }
        };

        let mut stopped = 0;
        for container in containers.into_iter().filter(|c| c.running) {
            match self.engine.stop_container(&container.id, self.config.stop_grace()).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(container_id = %container.id, error = %e, "Failed to stop container"),
            }
        }
        info!(stopped, "Stopped managed containers");
        stopped
    }
}

async fn pump_logs(
    mut frames: mpsc::Receiver<Result<LogFrame, EngineError>>,
    tx: broadcast::Sender<String>,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    handle: String,
) {
    let mut splitter = LineSplitter::default();
    let mut idle_check = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            item = frames.recv() => match item {
                Some(Ok(frame)) => {
                    for line in splitter.push(&frame) {
                        debug!(target: "container", container_id = %handle, "{}", line);
                        let _ = tx.send(line);
                    }
                }
                Some(Err(e)) => {
                    warn!(container_id = %handle, error = %e, "Log stream failed");
                    break;
                }
                None => break,
            },
            _ = idle_check.tick() => {}
        }

        if tx.receiver_count() == 0 {
            debug!(container_id = %handle, "No log subscribers left");
            break;
        }
    }

    for line in splitter.finish() {
        let _ = tx.send(line);
    }
    channels.remove_if(&handle, |_, sender| sender.same_channel(&tx));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cpu_total: u64, system_cpu: u64) -> StatsSnapshot {
        StatsSnapshot {
            cpu_total,
            system_cpu,
            online_cpus: 4,
            memory_used: 64 * 1024 * 1024,
            memory_limit: 256 * 1024 * 1024,
            net_rx: 1000,
            net_tx: 2000,
            pids: 7,
        }
    }

    #[test]
    fn test_compute_stats_first_sample() {
        let stats = compute_stats(None, &snapshot(500, 10_000));
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.memory_percent, 25.0);
        assert_eq!(stats.pid_count, 7);
        assert_eq!(stats.net_tx_bytes, 2000);
    }

    #[test]
    fn test_compute_stats_delta() {
        let prev = snapshot(1_000, 100_000);
        let cur = snapshot(2_500, 130_000);
        // 1500 / 30000 * 4 cpus * 100
        assert_eq!(compute_stats(Some(&prev), &cur).cpu_percent, 20.0);
    }

    #[test]
    fn test_compute_stats_counter_reset() {
        let prev = snapshot(9_000, 100_000);
        let cur = snapshot(100, 120_000);
        assert_eq!(compute_stats(Some(&prev), &cur).cpu_percent, 0.0);
    }

    #[test]
    fn test_compute_stats_rounding_and_zero_limit() {
        let mut cur = snapshot(0, 0);
        cur.memory_used = 1;
        cur.memory_limit = 3;
        assert_eq!(compute_stats(None, &cur).memory_percent, 33.33);

        cur.memory_limit = 0;
        assert_eq!(compute_stats(None, &cur).memory_percent, 0.0);
    }

    #[test]
    fn test_line_splitter_partial_lines() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(&LogFrame::stdout("hel")).is_empty());
        assert_eq!(splitter.push(&LogFrame::stdout("lo\r\nwor")), vec!["hello"]);
        assert_eq!(splitter.push(&LogFrame::stderr("err\n\n")), vec!["err"]);
        assert_eq!(splitter.push(&LogFrame::stdout("ld\n")), vec!["world"]);
        assert!(splitter.finish().is_empty());
    }

    #[test]
    fn test_line_splitter_streams_do_not_mix() {
        let mut splitter = LineSplitter::default();
        splitter.push(&LogFrame::stdout("out-"));
        splitter.push(&LogFrame::stderr("err-"));
        assert_eq!(splitter.push(&LogFrame::stdout("line\n")), vec!["out-line"]);
        assert_eq!(splitter.finish(), vec!["err-"]);
    }

    #[test]
    fn test_line_splitter_caps_partial_line() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(&LogFrame::stdout(vec![b'x'; MAX_PARTIAL_LINE + 1]));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PARTIAL_LINE + 1);
    }

    #[test]
    fn test_container_names() {
        let limits = ResourceLimits {
            cpu: 0.25,
            memory: 268_435_456,
        };
        let mut app = ServiceRecord::new_app("My Blog", crate::db::SourceType::Git, limits);
        app.id = "1234abcd-5678-4000-8000-000000000000".to_string();
        assert_eq!(container_name(&app), "hostdeck-my-blog-1234abcd");

        app.kind = ServiceKind::Vm;
        app.name = "brave-panda-7".to_string();
        assert_eq!(container_name(&app), "hostdeck-vm-brave-panda-7");
    }

    #[test]
    fn test_vm_base_setup() {
        assert!(vm_base_setup("alpine:3.19").contains("apk add"));
        assert!(vm_base_setup("ubuntu:24.04").contains("apt-get"));
        assert_eq!(vm_base_setup("busybox:latest"), "");
    }

    #[tokio::test]
    async fn test_service_locks_serialize() {
        let locks = ServiceLocks::new();
        let guard = locks.lock("svc").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("svc").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Different services never contend
        let _unrelated = locks.lock("other").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_subscription_reports_lag() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = LogSubscription { rx };
        for i in 0..5 {
            tx.send(format!("line {}", i)).unwrap();
        }
        assert_eq!(sub.recv().await.unwrap(), "[… 3 lines skipped]");
        assert_eq!(sub.recv().await.unwrap(), "line 3");
        drop(tx);
        assert_eq!(sub.recv().await.unwrap(), "line 4");
        assert!(sub.recv().await.is_none());
    }
}
