//! Container-runtime abstraction for HemoStat agents.
//!
//! The Observer and Actuator talk to the runtime exclusively through
//! [`ContainerRuntime`], so the whole pipeline can run against
//! [`FakeRuntime`] in tests. [`DockerRuntime`] is the bollard-backed
//! production implementation.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use hemo_proto::HealthStatus;
use std::collections::HashMap;

pub mod docker;
pub mod fake;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;

// ─── Well-known labels ───────────────────────────────────────────────────────

pub const LABEL_SWARM_SERVICE: &str = "com.docker.swarm.service.name";
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime api error: {0}")]
    Api(String),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

// ─── Data types ──────────────────────────────────────────────────────────────

/// Listing-level view of a container.
#[derive(Debug, Clone)]
pub struct ContainerBrief {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Inspect-level view of a container.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub status: String,
    pub health_status: HealthStatus,
    pub exit_code: i64,
    pub restart_count: u64,
    pub labels: HashMap<String, String>,
}

/// Raw cumulative counters from a single stats snapshot. Metric derivation
/// (CPU/memory percentages, I/O sums) happens in the Observer.
#[derive(Debug, Clone, Default)]
pub struct StatsSample {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub presystem_cpu_usage: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    /// `inactive_file` (cgroup v2) or `total_inactive_file` (cgroup v1).
    pub memory_inactive_file: u64,
    pub interfaces: Vec<InterfaceStats>,
    pub blkio: Vec<BlkioEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BlkioEntry {
    pub op: String,
    pub value: u64,
}

/// An orchestrator service a container belongs to.
#[derive(Debug, Clone)]
pub struct ServiceBrief {
    pub id: String,
    pub name: String,
    pub replicas: u64,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct VolumeBrief {
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub volumes_deleted: Vec<String>,
    pub space_reclaimed_bytes: u64,
}

// ─── Runtime trait ───────────────────────────────────────────────────────────

/// Read and write operations the pipeline needs from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers; running only, or running plus exited.
    async fn list_containers(&self, include_exited: bool)
        -> Result<Vec<ContainerBrief>, RuntimeError>;

    /// List containers matching a status plus optional label / ancestor filters.
    async fn list_containers_filtered(
        &self,
        status: &str,
        label_filters: &[String],
        ancestor: Option<&str>,
    ) -> Result<Vec<ContainerBrief>, RuntimeError>;

    async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Single-snapshot stats (no streaming).
    async fn stats(&self, name: &str) -> Result<StatsSample, RuntimeError>;

    /// Graceful restart with a bounded stop timeout.
    async fn restart(&self, name: &str, stop_timeout_secs: i64) -> Result<(), RuntimeError>;

    async fn remove(&self, name: &str, with_volumes: bool) -> Result<(), RuntimeError>;

    /// Run a command inside a running container.
    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, RuntimeError>;

    /// Look up an orchestrator service by name; `None` when absent.
    async fn find_service(&self, name: &str) -> Result<Option<ServiceBrief>, RuntimeError>;

    async fn scale_service(
        &self,
        service: &ServiceBrief,
        replicas: u64,
    ) -> Result<(), RuntimeError>;

    async fn list_volumes(&self, dangling_only: bool) -> Result<Vec<VolumeBrief>, RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    /// Prune unused volumes matching label filters.
    async fn prune_volumes(&self, label_filters: &[String]) -> Result<PruneReport, RuntimeError>;
}
