//! Docker implementation of [`ContainerEngine`]
//!
//! Container operations go through the Docker Engine API via bollard. Image
//! builds shell out to the `docker build` CLI so that build output can be
//! streamed line by line exactly as the user would see it.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StatsOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::ResourceLimits;
use crate::engine::{
    BuildRequest, ContainerEngine, ContainerSpec, ContainerState, LogFrame, ManagedContainer,
    RestartPolicy, StatsSnapshot, CPU_PERIOD, LABEL_MANAGED, LABEL_SERVICE,
};
use crate::error::EngineError;

/// Docker daemon client
pub struct DockerEngine {
    client: Docker,
    docker_cli: String,
    docker_host: Option<String>,
}

impl DockerEngine {
    /// Create a client for the configured daemon.
    ///
    /// Connection priority:
    /// 1. `engine.docker_host` (already merged with `DOCKER_HOST`)
    /// 2. Common socket paths (platform-specific)
    /// 3. bollard defaults
    ///
    /// The daemon is not required to answer yet; callers probe with
    /// [`ContainerEngine::ping`] and run degraded until it does.
    pub async fn connect(config: &EngineConfig) -> anyhow::Result<Self> {
        let client = match &config.docker_host {
            Some(host) => Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?,
            None => Self::connect_with_defaults().await?,
        };

        debug!("Docker client configured");
        Ok(Self {
            client,
            docker_cli: config.docker_cli.clone(),
            docker_host: config.docker_host.clone(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(
                |e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e),
            )
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => {
                        if client.ping().await.is_ok() {
                            return Ok(client);
                        }
                        debug!(path, "Socket exists but daemon not responding");
                    }
                    Err(e) => debug!(path, error = %e, "Socket connection failed"),
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot configure a Docker client: {}. \
                 Start Docker Desktop, Colima, or dockerd, or set DOCKER_HOST.",
                e
            )
        })
    }
}

/// Classify a bollard error
fn map_err(err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            if message.contains("port is already allocated") || message.contains("address already in use") {
                EngineError::Rejected(format!(
                    "host port is already in use by another process: {}",
                    message
                ))
            } else {
                EngineError::Rejected(message)
            }
        }
        other => EngineError::Unavailable(other.to_string()),
    }
}

fn restart_policy(policy: RestartPolicy) -> bollard::models::RestartPolicy {
    let (name, maximum_retry_count) = match policy {
        RestartPolicy::No => (RestartPolicyNameEnum::NO, None),
        RestartPolicy::Always => (RestartPolicyNameEnum::ALWAYS, None),
        RestartPolicy::OnFailure { max_retries } => {
            (RestartPolicyNameEnum::ON_FAILURE, Some(max_retries))
        }
        RestartPolicy::UnlessStopped => (RestartPolicyNameEnum::UNLESS_STOPPED, None),
    };
    bollard::models::RestartPolicy {
        name: Some(name),
        maximum_retry_count,
    }
}

fn nano_cpus(limits: &ResourceLimits) -> i64 {
    (limits.cpu * 1_000_000_000.0).round() as i64
}

/// Translate a spec into the create-container payload
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let port_key = format!("{}/tcp", spec.internal_port);

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(spec.host_port.to_string()),
        }]),
    );

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        nano_cpus: Some(nano_cpus(&spec.limits)),
        memory: Some(spec.limits.memory),
        memory_swap: Some(spec.limits.memory * 2),
        pids_limit: Some(spec.pids_limit),
        restart_policy: Some(restart_policy(spec.restart)),
        network_mode: Some("bridge".to_string()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.cmd.clone(),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        tty: Some(spec.tty),
        ..Default::default()
    }
}

fn log_frame(output: LogOutput) -> Option<LogFrame> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some(LogFrame::stdout(message.to_vec()))
        }
        LogOutput::StdErr { message } => Some(LogFrame::stderr(message.to_vec())),
        LogOutput::StdIn { .. } => None,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unavailable(format!("Docker daemon is not responding: {}", e)))
    }

    async fn build_image(
        &self,
        request: &BuildRequest,
        log: mpsc::UnboundedSender<String>,
    ) -> Result<(), EngineError> {
        let cpu_quota = (request.limits.cpu * CPU_PERIOD as f64).round() as i64;

        let mut cmd = Command::new(&self.docker_cli);
        cmd.arg("build")
            .arg("-t")
            .arg(&request.tag)
            .arg("--cpu-period")
            .arg(CPU_PERIOD.to_string())
            .arg("--cpu-quota")
            .arg(cpu_quota.to_string())
            .arg("--memory")
            .arg(request.limits.memory.to_string())
            .arg(&request.context_dir);

        if let Some(host) = &self.docker_host {
            cmd.env("DOCKER_HOST", host);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!("Running: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Unavailable(format!("Failed to spawn docker CLI: {}", e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(EngineError::Unavailable("docker CLI output not captured".to_string()));
        };

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            info!(target: "build", tag = %request.tag, "{}", line);
                            let _ = log.send(line);
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            warn!("Error reading stdout: {}", e);
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            // BuildKit writes progress to stderr
                            info!(target: "build", tag = %request.tag, "{}", line);
                            let _ = log.send(line);
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            warn!("Error reading stderr: {}", e);
                            stderr_done = true;
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::Unavailable(format!("Failed to wait for docker CLI: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Rejected(format!(
                "Build failed with exit code: {}",
                status.code().unwrap_or(-1)
            )))
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(map_err)?;
            if let Some(error) = info.error {
                return Err(EngineError::Rejected(format!(
                    "Failed to pull image '{}': {}",
                    image, error
                )));
            }
            if let Some(status) = info.status {
                debug!(image, status, "Pull progress");
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_image(image, Some(options), None).await {
            Ok(_) => {
                debug!(image, "Removed image");
                Ok(())
            }
            Err(e) => match map_err(e) {
                EngineError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(map_err)?;

        info!(
            container_id = %response.id,
            container_name = %spec.name,
            image = %spec.image,
            port = spec.host_port,
            "Created Docker container"
        );
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn restart_container(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let options = RestartContainerOptions {
            t: grace.as_secs() as isize,
        };
        self.client
            .restart_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => {
                debug!(container_id = id, "Removed Docker container");
                Ok(())
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>, EngineError> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let state = info.state.unwrap_or_default();
                Ok(Some(ContainerState {
                    running: state.running.unwrap_or(false),
                    status: state
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    exit_code: state.exit_code,
                }))
            }
            Err(e) => match map_err(e) {
                EngineError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn stats_snapshot(&self, id: &str) -> Result<StatsSnapshot, EngineError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.client.stats(id, Some(options));

        let stats = match stream.next().await {
            Some(result) => result.map_err(map_err)?,
            None => return Err(EngineError::NotFound(format!("no stats for {}", id))),
        };

        let (net_rx, net_tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(StatsSnapshot {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            system_cpu: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
            memory_used: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            net_rx,
            net_tx,
            pids: stats.pids_stats.current.unwrap_or(0),
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<LogFrame>, EngineError> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut frames = Vec::new();
        while let Some(result) = stream.next().await {
            if let Some(frame) = log_frame(result.map_err(map_err)?) {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    fn follow_logs(&self, id: &str) -> mpsc::Receiver<Result<LogFrame, EngineError>> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let container_id = id.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: false,
                tail: "0".to_string(),
                ..Default::default()
            };

            let mut log_stream = client.logs(&container_id, Some(options));

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(container_id, "Log follower closed");
                        break;
                    }
                    item = log_stream.next() => {
                        match item {
                            Some(Ok(output)) => {
                                if let Some(frame) = log_frame(output) {
                                    if tx.send(Ok(frame)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(container_id, error = %e, "Error reading container logs");
                                let _ = tx.send(Err(map_err(e))).await;
                                break;
                            }
                            None => {
                                debug!(container_id, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        rx
    }

    async fn update_resources(&self, id: &str, limits: &ResourceLimits) -> Result<(), EngineError> {
        let options = UpdateContainerOptions::<String> {
            nano_cpus: Some(nano_cpus(limits)),
            memory: Some(limits.memory),
            memory_swap: Some(limits.memory * 2),
            ..Default::default()
        };
        self.client
            .update_container(id, options)
            .await
            .map_err(map_err)
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        );

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(map_err)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                Some(ManagedContainer {
                    id,
                    service_id: c.labels.and_then(|mut l| l.remove(LABEL_SERVICE)),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }
}
