//! Shared fixtures: a scriptable in-memory container engine and a fully
//! wired platform on a temporary data directory.

#![allow(dead_code)]

use async_trait::async_trait;
use hostdeck::config::Config;
use hostdeck::control::NewApp;
use hostdeck::db::{Database, ResourceLimits, ServiceRecord, SourceType};
use hostdeck::engine::{
    BuildRequest, ContainerEngine, ContainerSpec, ContainerState, LogFrame, ManagedContainer,
    StatsSnapshot, LABEL_SERVICE,
};
use hostdeck::error::EngineError;
use hostdeck::platform::Platform;
use hostdeck::source::Workspace;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

/// Every engine call the platform made, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Build(String),
    Pull(String),
    RemoveImage(String),
    Create { name: String, image: String, host_port: u16 },
    Start(String),
    Stop(String),
    Restart(String),
    Remove(String),
    UpdateResources(String),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<HashMap<String, FakeContainer>>,
    images: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    followers: Mutex<HashMap<String, Vec<mpsc::Sender<Result<LogFrame, EngineError>>>>>,
    build_delay: Mutex<Duration>,
    unavailable: AtomicBool,
    fail_builds: AtomicBool,
    exit_on_start: AtomicBool,
    fail_removal: AtomicBool,
    active_builds: AtomicUsize,
    peak_builds: AtomicUsize,
    next_id: AtomicU64,
    cpu_counter: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---- scripting ----

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock() = delay;
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Containers exit immediately after starting
    pub fn exit_on_start(&self, exit: bool) {
        self.exit_on_start.store(exit, Ordering::SeqCst);
    }

    pub fn fail_removal(&self, fail: bool) {
        self.fail_removal.store(fail, Ordering::SeqCst);
    }

    /// Drop a container behind the platform's back
    pub fn vanish(&self, id: &str) {
        self.containers.lock().remove(id);
    }

    /// Stop a container behind the platform's back
    pub fn crash(&self, id: &str) {
        if let Some(container) = self.containers.lock().get_mut(id) {
            container.running = false;
        }
    }

    /// Append output to a container, delivering it to live followers
    pub fn emit(&self, id: &str, line: &str) {
        self.logs
            .lock()
            .entry(id.to_string())
            .or_default()
            .push(line.to_string());
        let mut followers = self.followers.lock();
        if let Some(senders) = followers.get_mut(id) {
            senders.retain(|tx| tx.try_send(Ok(LogFrame::stdout(format!("{}\n", line)))).is_ok());
        }
    }

    // ---- inspection ----

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn builds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| matches(c)).count()
    }

    pub fn peak_concurrent_builds(&self) -> usize {
        self.peak_builds.load(Ordering::SeqCst)
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.containers.lock().get(id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.images.lock().contains(tag)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("fake engine is down".to_string()));
        }
        Ok(())
    }

    fn not_found(id: &str) -> EngineError {
        EngineError::NotFound(format!("no such container: {}", id))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.check()
    }

    async fn build_image(
        &self,
        request: &BuildRequest,
        log: mpsc::UnboundedSender<String>,
    ) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Build(request.tag.clone()));
        // The context is read up front, as a real engine streams it before building
        if !request.context_dir.join("Dockerfile").is_file() {
            return Err(EngineError::Rejected("no Dockerfile in context".to_string()));
        }

        let active = self.active_builds.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_builds.fetch_max(active, Ordering::SeqCst);

        let _ = log.send(format!("Step 1/1 : building {}", request.tag));
        let delay = *self.build_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active_builds.fetch_sub(1, Ordering::SeqCst);

        if self.fail_builds.load(Ordering::SeqCst) {
            let _ = log.send("npm ERR! build failed".to_string());
            return Err(EngineError::Rejected("build exited with status 1".to_string()));
        }

        self.images.lock().insert(request.tag.clone());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Pull(image.to_string()));
        self.images.lock().insert(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::RemoveImage(image.to_string()));
        if self.images.lock().remove(image) {
            Ok(())
        } else {
            Err(EngineError::NotFound(image.to_string()))
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.check()?;
        self.record(Call::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
            host_port: spec.host_port,
        });

        let mut containers = self.containers.lock();
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::Conflict(format!("name {} in use", spec.name)));
        }
        let id = format!("fake{:08}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Start(id.to_string()));
        let exits = self.exit_on_start.load(Ordering::SeqCst);
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.running = !exits;
        drop(containers);

        if exits {
            self.emit(id, "Error: Cannot find module '/app/index.js'");
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Stop(id.to_string()));
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.running = false;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Restart(id.to_string()));
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.running = true;
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::Remove(id.to_string()));
        if self.fail_removal.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("device or resource busy".to_string()));
        }

        let mut containers = self.containers.lock();
        let key = if containers.contains_key(id) {
            Some(id.to_string())
        } else {
            // Removal by name
            containers
                .iter()
                .find(|(_, c)| c.spec.name == id)
                .map(|(k, _)| k.clone())
        };
        match key {
            Some(key) => {
                containers.remove(&key);
                self.followers.lock().remove(&key);
                Ok(())
            }
            None => Err(Self::not_found(id)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>, EngineError> {
        self.check()?;
        Ok(self.containers.lock().get(id).map(|c| ContainerState {
            running: c.running,
            status: if c.running { "running" } else { "exited" }.to_string(),
            exit_code: if c.running { None } else { Some(1) },
        }))
    }

    async fn stats_snapshot(&self, id: &str) -> Result<StatsSnapshot, EngineError> {
        self.check()?;
        let containers = self.containers.lock();
        let container = containers.get(id).ok_or_else(|| Self::not_found(id))?;
        let tick = self.cpu_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StatsSnapshot {
            cpu_total: tick * 1_000,
            system_cpu: tick * 10_000,
            online_cpus: 2,
            memory_used: (container.spec.limits.memory / 4) as u64,
            memory_limit: container.spec.limits.memory as u64,
            net_rx: 100,
            net_tx: 200,
            pids: 3,
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<LogFrame>, EngineError> {
        self.check()?;
        if !self.containers.lock().contains_key(id) {
            return Err(Self::not_found(id));
        }
        let logs = self.logs.lock();
        let lines = logs.get(id).cloned().unwrap_or_default();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..]
            .iter()
            .map(|line| LogFrame::stdout(format!("{}\n", line)))
            .collect())
    }

    fn follow_logs(&self, id: &str) -> mpsc::Receiver<Result<LogFrame, EngineError>> {
        let (tx, rx) = mpsc::channel(64);
        self.followers
            .lock()
            .entry(id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn update_resources(&self, id: &str, limits: &ResourceLimits) -> Result<(), EngineError> {
        self.check()?;
        self.record(Call::UpdateResources(id.to_string()));
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.spec.limits = *limits;
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        self.check()?;
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|(id, c)| ManagedContainer {
                id: id.clone(),
                service_id: c.spec.labels.get(LABEL_SERVICE).cloned(),
                running: c.running,
            })
            .collect())
    }
}

/// A platform wired to a [`FakeEngine`] on a temporary data directory
pub struct TestPlatform {
    pub platform: Platform,
    pub engine: Arc<FakeEngine>,
    pub shutdown_tx: watch::Sender<bool>,
    _dir: TempDir,
}

impl TestPlatform {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.pipeline.health_grace_secs = 0;
        config.ports.base = 24001;
        customize(&mut config);

        std::fs::create_dir_all(config.services_dir()).unwrap();
        std::fs::create_dir_all(config.uploads_dir()).unwrap();

        let db = Arc::new(Database::open(config.database_path()).unwrap());
        let engine = FakeEngine::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let platform = Platform::assemble(config, db, engine.clone(), shutdown_rx).unwrap();
        assert!(platform.lifecycle.refresh_engine_status().await);

        Self {
            platform,
            engine,
            shutdown_tx,
            _dir: dir,
        }
    }

    pub fn db(&self) -> &Database {
        &self.platform.db
    }

    pub fn service(&self, id: &str) -> ServiceRecord {
        self.platform.db.get_service(id).unwrap().unwrap()
    }

    /// Create an upload service whose workspace holds a static site
    pub fn static_site(&self, name: &str) -> ServiceRecord {
        let service = self
            .platform
            .control
            .create_app(NewApp::new(name, SourceType::Upload))
            .unwrap();
        let source = Workspace::new(self.platform.config.services_dir()).source_dir(&service.id);
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("index.html"), format!("<h1>{}</h1>", name)).unwrap();
        service
    }

    /// Queue a deploy and wait for it
    pub async fn deploy(
        &self,
        service_id: &str,
    ) -> Result<hostdeck::pipeline::DeployOutcome, hostdeck::error::DeployError> {
        self.platform
            .control
            .deploy(service_id, "test")?
            .wait()
            .await
    }
}
