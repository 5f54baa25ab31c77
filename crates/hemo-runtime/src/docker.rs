//! Docker implementation of [`ContainerRuntime`] over bollard.

use crate::{
    BlkioEntry, ContainerBrief, ContainerDetails, ContainerRuntime, ExecOutput, InterfaceStats,
    PruneReport, RuntimeError, ServiceBrief, StatsSample, VolumeBrief,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, MemoryStatsStats, RemoveContainerOptions,
    RestartContainerOptions, Stats, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{ListServicesOptions, UpdateServiceOptions};
use bollard::volume::{ListVolumesOptions, PruneVolumesOptions};
use futures_util::StreamExt;
use hemo_proto::HealthStatus;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Production runtime client. Construction fails with
/// [`RuntimeError::Unavailable`] when the local daemon socket is missing so
/// callers can degrade instead of crashing.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        info!("docker client initialized");
        Ok(Self { docker })
    }

    fn map_err(e: bollard::errors::Error) -> RuntimeError {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Api(other.to_string()),
        }
    }
}

fn strip_name(names: &Option<Vec<String>>) -> String {
    names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default()
}

fn to_brief(summary: bollard::models::ContainerSummary) -> ContainerBrief {
    ContainerBrief {
        id: summary.id.unwrap_or_default(),
        name: strip_name(&summary.names),
        image: summary.image.unwrap_or_default(),
        status: summary.state.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
    }
}

fn to_sample(stats: Stats) -> StatsSample {
    let memory_inactive_file = match stats.memory_stats.stats {
        Some(MemoryStatsStats::V1(v1)) => v1.total_inactive_file,
        Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
        None => 0,
    };

    let interfaces = stats
        .networks
        .unwrap_or_default()
        .into_values()
        .map(|net| InterfaceStats {
            rx_bytes: net.rx_bytes,
            tx_bytes: net.tx_bytes,
        })
        .collect();

    let blkio = stats
        .blkio_stats
        .io_service_bytes_recursive
        .unwrap_or_default()
        .into_iter()
        .map(|entry| BlkioEntry {
            op: entry.op,
            value: entry.value,
        })
        .collect();

    StatsSample {
        cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
        precpu_total_usage: stats.precpu_stats.cpu_usage.total_usage,
        system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        presystem_cpu_usage: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        memory_inactive_file,
        interfaces,
        blkio,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        include_exited: bool,
    ) -> Result<Vec<ContainerBrief>, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        let statuses = if include_exited {
            vec!["running".to_string(), "exited".to_string()]
        } else {
            vec!["running".to_string()]
        };
        filters.insert("status".to_string(), statuses);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(Self::map_err)?;

        Ok(containers.into_iter().map(to_brief).collect())
    }

    async fn list_containers_filtered(
        &self,
        status: &str,
        label_filters: &[String],
        ancestor: Option<&str>,
    ) -> Result<Vec<ContainerBrief>, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("status".to_string(), vec![status.to_string()]);
        if !label_filters.is_empty() {
            filters.insert("label".to_string(), label_filters.to_vec());
        }
        if let Some(image_id) = ancestor {
            filters.insert("ancestor".to_string(), vec![image_id.to_string()]);
        }

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(Self::map_err)?;

        Ok(containers.into_iter().map(to_brief).collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(Self::map_err)?;

        let state = response.state.unwrap_or_default();
        let health_status = state
            .health
            .and_then(|h| h.status)
            .map(|s| HealthStatus::parse(&s.to_string()))
            .unwrap_or(HealthStatus::Unknown);
        let config = response.config.unwrap_or_default();

        Ok(ContainerDetails {
            id: response.id.unwrap_or_default(),
            name: response
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            image: config.image.unwrap_or_default(),
            image_id: response.image.unwrap_or_default(),
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            exit_code: state.exit_code.unwrap_or(0),
            restart_count: response.restart_count.unwrap_or(0).max(0) as u64,
            health_status,
            labels: config.labels.unwrap_or_default(),
        })
    }

    async fn stats(&self, name: &str) -> Result<StatsSample, RuntimeError> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        match stream.next().await {
            Some(Ok(stats)) => Ok(to_sample(stats)),
            Some(Err(e)) => Err(Self::map_err(e)),
            None => Err(RuntimeError::Api(format!("no stats returned for {name}"))),
        }
    }

    async fn restart(&self, name: &str, stop_timeout_secs: i64) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(
                name,
                Some(RestartContainerOptions {
                    t: stop_timeout_secs as isize,
                }),
            )
            .await
            .map_err(Self::map_err)
    }

    async fn remove(&self, name: &str, with_volumes: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    v: with_volumes,
                    ..Default::default()
                }),
            )
            .await
            .map_err(Self::map_err)
    }

    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, RuntimeError> {
        let cmd: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions::<String> {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(Self::map_err)?;

        let mut collected = String::new();
        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(Self::map_err)?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(log) => collected.push_str(&log.to_string()),
                        Err(e) => {
                            warn!(container = name, error = %e, "exec output stream error");
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                debug!(container = name, "exec started detached");
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(Self::map_err)?;

        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            output: collected,
        })
    }

    async fn find_service(&self, name: &str) -> Result<Option<ServiceBrief>, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let services = self
            .docker
            .list_services(Some(ListServicesOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(Self::map_err)?;

        let Some(service) = services.into_iter().next() else {
            return Ok(None);
        };

        let spec = service.spec.unwrap_or_default();
        let replicas = spec
            .mode
            .and_then(|m| m.replicated)
            .and_then(|r| r.replicas)
            .unwrap_or(1)
            .max(0) as u64;

        Ok(Some(ServiceBrief {
            id: service.id.unwrap_or_default(),
            name: spec.name.unwrap_or_else(|| name.to_string()),
            replicas,
            version: service.version.and_then(|v| v.index).unwrap_or(0),
        }))
    }

    async fn scale_service(
        &self,
        service: &ServiceBrief,
        replicas: u64,
    ) -> Result<(), RuntimeError> {
        // Re-read the spec so the update carries everything besides the
        // replica count unchanged.
        let current = self
            .docker
            .inspect_service(&service.id, None)
            .await
            .map_err(Self::map_err)?;

        let mut spec = current.spec.unwrap_or_default();
        let mut mode = spec.mode.unwrap_or_default();
        let mut replicated = mode.replicated.unwrap_or_default();
        replicated.replicas = Some(replicas as i64);
        mode.replicated = Some(replicated);
        spec.mode = Some(mode);

        let version = current.version.and_then(|v| v.index).unwrap_or(service.version);

        self.docker
            .update_service(
                &service.id,
                spec,
                UpdateServiceOptions {
                    version,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(Self::map_err)?;

        info!(service = %service.name, replicas, "service scaled");
        Ok(())
    }

    async fn list_volumes(&self, dangling_only: bool) -> Result<Vec<VolumeBrief>, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if dangling_only {
            filters.insert("dangling".to_string(), vec!["true".to_string()]);
        }

        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
            .map_err(Self::map_err)?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeBrief {
                name: v.name,
                labels: v.labels,
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, None)
            .await
            .map_err(Self::map_err)
    }

    async fn prune_volumes(&self, label_filters: &[String]) -> Result<PruneReport, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !label_filters.is_empty() {
            filters.insert("label".to_string(), label_filters.to_vec());
        }

        let response = self
            .docker
            .prune_volumes(Some(PruneVolumesOptions { filters }))
            .await
            .map_err(Self::map_err)?;

        Ok(PruneReport {
            volumes_deleted: response.volumes_deleted.unwrap_or_default(),
            space_reclaimed_bytes: response.space_reclaimed.unwrap_or(0).max(0) as u64,
        })
    }
}
