//! In-memory [`ContainerRuntime`] used by the agent test suites.

use crate::{
    ContainerBrief, ContainerDetails, ContainerRuntime, ExecOutput, PruneReport, RuntimeError,
    ServiceBrief, StatsSample, VolumeBrief,
};
use async_trait::async_trait;
use hemo_proto::HealthStatus;
use std::collections::HashMap;
use std::sync::Mutex;

/// Build inspect details with sane defaults for tests.
pub fn details(name: &str, status: &str) -> ContainerDetails {
    ContainerDetails {
        id: format!("{name}-id"),
        name: name.to_string(),
        image: format!("{name}:latest"),
        image_id: format!("sha256:{name}"),
        status: status.to_string(),
        health_status: HealthStatus::Unknown,
        exit_code: 0,
        restart_count: 0,
        labels: HashMap::new(),
    }
}

/// A quiet stats sample (no load, generous limit).
pub fn idle_sample() -> StatsSample {
    StatsSample {
        cpu_total_usage: 1_000,
        precpu_total_usage: 900,
        system_cpu_usage: 100_000,
        presystem_cpu_usage: 90_000,
        online_cpus: 2,
        memory_usage: 64 << 20,
        memory_limit: 1 << 30,
        memory_inactive_file: 8 << 20,
        interfaces: Vec::new(),
        blkio: Vec::new(),
    }
}

struct FakeContainer {
    details: ContainerDetails,
    stats: StatsSample,
    restart_fails: bool,
    restart_sticks: bool,
}

#[derive(Default)]
struct Inner {
    containers: Vec<FakeContainer>,
    services: HashMap<String, ServiceBrief>,
    volumes: Vec<(VolumeBrief, bool)>,
    restarts: Vec<String>,
    removed: Vec<String>,
    scaled: Vec<(String, u64)>,
    removed_volumes: Vec<String>,
    exec_output: Option<ExecOutput>,
}

/// Scriptable runtime double: containers, services, and volumes live in
/// memory; every mutating call is recorded for assertions.
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, details: ContainerDetails, stats: StatsSample) {
        self.inner.lock().expect("runtime lock").containers.push(FakeContainer {
            details,
            stats,
            restart_fails: false,
            restart_sticks: false,
        });
    }

    /// Make restarts of `name` return an API error.
    pub fn fail_restarts(&self, name: &str) {
        let mut inner = self.inner.lock().expect("runtime lock");
        if let Some(c) = inner.containers.iter_mut().find(|c| c.details.name == name) {
            c.restart_fails = true;
        }
    }

    /// Make restarts of `name` succeed but leave the container stuck
    /// outside the `running` state.
    pub fn stick_restarts(&self, name: &str) {
        let mut inner = self.inner.lock().expect("runtime lock");
        if let Some(c) = inner.containers.iter_mut().find(|c| c.details.name == name) {
            c.restart_sticks = true;
        }
    }

    pub fn add_service(&self, service: ServiceBrief) {
        self.inner
            .lock()
            .expect("runtime lock")
            .services
            .insert(service.name.clone(), service);
    }

    pub fn add_volume(&self, volume: VolumeBrief, dangling: bool) {
        self.inner
            .lock()
            .expect("runtime lock")
            .volumes
            .push((volume, dangling));
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        self.inner.lock().expect("runtime lock").exec_output = Some(output);
    }

    pub fn restarts(&self) -> Vec<String> {
        self.inner.lock().expect("runtime lock").restarts.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.inner.lock().expect("runtime lock").removed.clone()
    }

    pub fn scaled(&self) -> Vec<(String, u64)> {
        self.inner.lock().expect("runtime lock").scaled.clone()
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.inner.lock().expect("runtime lock").removed_volumes.clone()
    }

    fn brief(details: &ContainerDetails) -> ContainerBrief {
        ContainerBrief {
            id: details.id.clone(),
            name: details.name.clone(),
            image: details.image.clone(),
            status: details.status.clone(),
            labels: details.labels.clone(),
        }
    }

    fn matches_labels(labels: &HashMap<String, String>, filters: &[String]) -> bool {
        filters.iter().all(|f| match f.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|lv| lv == v),
            None => labels.contains_key(f.as_str()),
        })
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(
        &self,
        include_exited: bool,
    ) -> Result<Vec<ContainerBrief>, RuntimeError> {
        let inner = self.inner.lock().expect("runtime lock");
        Ok(inner
            .containers
            .iter()
            .filter(|c| {
                c.details.status == "running" || (include_exited && c.details.status == "exited")
            })
            .map(|c| Self::brief(&c.details))
            .collect())
    }

    async fn list_containers_filtered(
        &self,
        status: &str,
        label_filters: &[String],
        ancestor: Option<&str>,
    ) -> Result<Vec<ContainerBrief>, RuntimeError> {
        let inner = self.inner.lock().expect("runtime lock");
        Ok(inner
            .containers
            .iter()
            .filter(|c| c.details.status == status)
            .filter(|c| Self::matches_labels(&c.details.labels, label_filters))
            .filter(|c| ancestor.is_none_or(|img| c.details.image_id == img))
            .map(|c| Self::brief(&c.details))
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails, RuntimeError> {
        let inner = self.inner.lock().expect("runtime lock");
        inner
            .containers
            .iter()
            .find(|c| c.details.name == name || c.details.id == name)
            .map(|c| c.details.clone())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn stats(&self, name: &str) -> Result<StatsSample, RuntimeError> {
        let inner = self.inner.lock().expect("runtime lock");
        inner
            .containers
            .iter()
            .find(|c| c.details.name == name || c.details.id == name)
            .map(|c| c.stats.clone())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn restart(&self, name: &str, _stop_timeout_secs: i64) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().expect("runtime lock");
        inner.restarts.push(name.to_string());
        let Some(c) = inner
            .containers
            .iter_mut()
            .find(|c| c.details.name == name || c.details.id == name)
        else {
            return Err(RuntimeError::NotFound(name.to_string()));
        };
        if c.restart_fails {
            return Err(RuntimeError::Api(format!("restart failed for {name}")));
        }
        if !c.restart_sticks {
            c.details.status = "running".to_string();
            c.details.exit_code = 0;
        }
        Ok(())
    }

    async fn remove(&self, name: &str, _with_volumes: bool) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().expect("runtime lock");
        let before = inner.containers.len();
        inner
            .containers
            .retain(|c| c.details.name != name && c.details.id != name);
        if inner.containers.len() == before {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        inner.removed.push(name.to_string());
        Ok(())
    }

    async fn exec(&self, name: &str, _command: &str) -> Result<ExecOutput, RuntimeError> {
        let inner = self.inner.lock().expect("runtime lock");
        if !inner
            .containers
            .iter()
            .any(|c| c.details.name == name || c.details.id == name)
        {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        Ok(inner.exec_output.clone().unwrap_or(ExecOutput {
            exit_code: 0,
            output: "ok".to_string(),
        }))
    }

    async fn find_service(&self, name: &str) -> Result<Option<ServiceBrief>, RuntimeError> {
        let inner = self.inner.lock().expect("runtime lock");
        Ok(inner.services.get(name).cloned())
    }

    async fn scale_service(
        &self,
        service: &ServiceBrief,
        replicas: u64,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().expect("runtime lock");
        inner.scaled.push((service.name.clone(), replicas));
        if let Some(s) = inner.services.get_mut(&service.name) {
            s.replicas = replicas;
        }
        Ok(())
    }

    async fn list_volumes(&self, dangling_only: bool) -> Result<Vec<VolumeBrief>, RuntimeError> {
        let inner = self.inner.lock().expect("runtime lock");
        Ok(inner
            .volumes
            .iter()
            .filter(|(_, dangling)| !dangling_only || *dangling)
            .map(|(v, _)| v.clone())
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().expect("runtime lock");
        let before = inner.volumes.len();
        inner.volumes.retain(|(v, _)| v.name != name);
        if inner.volumes.len() == before {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        inner.removed_volumes.push(name.to_string());
        Ok(())
    }

    async fn prune_volumes(&self, label_filters: &[String]) -> Result<PruneReport, RuntimeError> {
        let mut inner = self.inner.lock().expect("runtime lock");
        let (matching, kept): (Vec<_>, Vec<_>) = inner
            .volumes
            .drain(..)
            .partition(|(v, dangling)| *dangling && Self::matches_labels(&v.labels, label_filters));
        inner.volumes = kept;

        let deleted: Vec<String> = matching.iter().map(|(v, _)| v.name.clone()).collect();
        inner.removed_volumes.extend(deleted.clone());
        Ok(PruneReport {
            space_reclaimed_bytes: deleted.len() as u64 * 1024,
            volumes_deleted: deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_restart_recovers_status() {
        let runtime = FakeRuntime::new();
        runtime.add_container(details("web-1", "exited"), idle_sample());

        runtime.restart("web-1", 10).await.expect("restart");
        let inspected = runtime.inspect("web-1").await.expect("inspect");
        assert_eq!(inspected.status, "running");
        assert_eq!(runtime.restarts(), vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_fake_restart_failure_scripting() {
        let runtime = FakeRuntime::new();
        runtime.add_container(details("web-1", "running"), idle_sample());
        runtime.fail_restarts("web-1");

        let result = runtime.restart("web-1", 10).await;
        assert!(matches!(result, Err(RuntimeError::Api(_))));
    }

    #[tokio::test]
    async fn test_fake_filtered_listing_by_label_and_ancestor() {
        let runtime = FakeRuntime::new();
        let mut labeled = details("worker-1", "exited");
        labeled
            .labels
            .insert(crate::LABEL_COMPOSE_PROJECT.to_string(), "shop".to_string());
        runtime.add_container(labeled, idle_sample());
        runtime.add_container(details("other", "exited"), idle_sample());

        let by_label = runtime
            .list_containers_filtered(
                "exited",
                &[format!("{}=shop", crate::LABEL_COMPOSE_PROJECT)],
                None,
            )
            .await
            .expect("list");
        assert_eq!(by_label.len(), 1);
        assert_eq!(by_label[0].name, "worker-1");

        let by_ancestor = runtime
            .list_containers_filtered("exited", &[], Some("sha256:other"))
            .await
            .expect("list");
        assert_eq!(by_ancestor.len(), 1);
        assert_eq!(by_ancestor[0].name, "other");
    }

    #[tokio::test]
    async fn test_fake_prune_only_matching_dangling() {
        let runtime = FakeRuntime::new();
        let mut labels = HashMap::new();
        labels.insert(crate::LABEL_COMPOSE_PROJECT.to_string(), "shop".to_string());
        runtime.add_volume(
            VolumeBrief {
                name: "shop-data".to_string(),
                labels: labels.clone(),
            },
            true,
        );
        runtime.add_volume(
            VolumeBrief {
                name: "other-data".to_string(),
                labels: HashMap::new(),
            },
            true,
        );

        let report = runtime
            .prune_volumes(&[format!("{}=shop", crate::LABEL_COMPOSE_PROJECT)])
            .await
            .expect("prune");
        assert_eq!(report.volumes_deleted, vec!["shop-data"]);
        assert_eq!(runtime.list_volumes(true).await.expect("list").len(), 1);
    }
}
