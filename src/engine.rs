//! Container engine seam
//!
//! [`ContainerEngine`] is the narrow surface the platform needs from a
//! container runtime. [`crate::docker::DockerEngine`] implements it against
//! the Docker daemon; tests substitute an in-memory fake. Only the lifecycle
//! manager holds an engine.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::db::ResourceLimits;
use crate::error::EngineError;

/// Label carrying the owning service id
pub const LABEL_SERVICE: &str = "hostdeck.service";
/// Label carrying the service kind (`app` or `vm`)
pub const LABEL_KIND: &str = "hostdeck.kind";
/// Label present on every container the platform created
pub const LABEL_MANAGED: &str = "hostdeck.managed";

/// CFS period used when translating a CPU fraction into a quota
pub const CPU_PERIOD: i64 = 100_000;

/// Restart behaviour requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure { max_retries: i64 },
    UnlessStopped,
}

impl RestartPolicy {
    /// Parse a stored policy name, falling back to `on-failure`
    pub fn parse(value: &str) -> Self {
        match value {
            "no" | "never" => RestartPolicy::No,
            "always" => RestartPolicy::Always,
            "unless-stopped" => RestartPolicy::UnlessStopped,
            _ => RestartPolicy::OnFailure { max_retries: 5 },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure { .. } => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Host port bound on 127.0.0.1
    pub host_port: u16,
    /// Port the workload listens on inside the container
    pub internal_port: u16,
    pub limits: ResourceLimits,
    pub pids_limit: i64,
    pub restart: RestartPolicy,
    /// Overrides the image command when set
    pub cmd: Option<Vec<String>>,
    pub tty: bool,
}

/// Image build request; the context directory must contain the recipe
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context_dir: PathBuf,
    pub tag: String,
    pub limits: ResourceLimits,
}

/// What the engine reports about a container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    pub running: bool,
    pub status: String,
    pub exit_code: Option<i64>,
}

/// Raw counters from a single stats read
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub cpu_total: u64,
    pub system_cpu: u64,
    pub online_cpus: u64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub pids: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One demultiplexed chunk of container output. A frame may hold several
/// lines or part of one.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFrame {
    pub stream: LogStream,
    pub data: Vec<u8>,
}

impl LogFrame {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stderr,
            data: data.into(),
        }
    }
}

/// A container found by label during sweeps
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub id: String,
    pub service_id: Option<String>,
    pub running: bool,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<(), EngineError>;

    /// Build `request.tag` from the context directory, sending output lines
    /// to `log` as they appear.
    async fn build_image(
        &self,
        request: &BuildRequest,
        log: mpsc::UnboundedSender<String>,
    ) -> Result<(), EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    async fn remove_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stop with a grace period. Already stopped is not an error.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    async fn restart_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// `None` when the container does not exist
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>, EngineError>;

    async fn stats_snapshot(&self, id: &str) -> Result<StatsSnapshot, EngineError>;

    /// The last `tail` frames of output
    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<LogFrame>, EngineError>;

    /// Follow new output. The producer stops once the receiver is dropped.
    fn follow_logs(&self, id: &str) -> mpsc::Receiver<Result<LogFrame, EngineError>>;

    /// Apply limits to a running container in place
    async fn update_resources(&self, id: &str, limits: &ResourceLimits) -> Result<(), EngineError>;

    /// Every container carrying the managed label
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!(RestartPolicy::parse("always"), RestartPolicy::Always);
        assert_eq!(RestartPolicy::parse("never"), RestartPolicy::No);
        assert_eq!(RestartPolicy::parse("unless-stopped"), RestartPolicy::UnlessStopped);
        assert_eq!(
            RestartPolicy::parse("on-failure"),
            RestartPolicy::OnFailure { max_retries: 5 }
        );
        assert_eq!(
            RestartPolicy::parse("sometimes"),
            RestartPolicy::OnFailure { max_retries: 5 }
        );
        assert_eq!(RestartPolicy::parse("sometimes").as_str(), "on-failure");
    }
}
