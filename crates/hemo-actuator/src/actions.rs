//! The four remediation actions, executed against the container runtime.

use hemo_proto::{ActionOutcome, CleanupStats};
use hemo_runtime::{
    ContainerRuntime, LABEL_COMPOSE_PROJECT, LABEL_COMPOSE_SERVICE, LABEL_SWARM_SERVICE,
    RuntimeError,
};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Graceful stop timeout handed to the runtime on restart.
const RESTART_STOP_TIMEOUT_SECS: i64 = 10;
/// How long to wait for the container to come back up.
const RESTART_WAIT_SECS: u64 = 30;
/// Read-only diagnostics permitted inside containers.
const EXEC_ALLOWLIST: &[&str] = &[
    "ps aux", "ps", "top", "df", "free", "netstat", "ss", "env", "pwd", "whoami", "date",
    "uptime", "uname",
];
/// Exec output is truncated to this many characters.
const EXEC_OUTPUT_LIMIT: usize = 1000;

fn not_found(container: &str) -> ActionOutcome {
    ActionOutcome::failed(format!("Container not found: {container}"))
}

// ─── restart ─────────────────────────────────────────────────────────────────

/// Restart gracefully, then poll until the container reports `running` or
/// the wait budget runs out.
pub async fn restart(runtime: &dyn ContainerRuntime, container: &str) -> ActionOutcome {
    warn!(container, "restarting container");

    match runtime.restart(container, RESTART_STOP_TIMEOUT_SECS).await {
        Ok(()) => {}
        Err(RuntimeError::NotFound(_)) => return not_found(container),
        Err(e) => return ActionOutcome::failed(format!("restart failed: {e}")),
    }

    for _ in 0..RESTART_WAIT_SECS {
        match runtime.inspect(container).await {
            Ok(details) if details.status == "running" => {
                warn!(container, "container restarted successfully");
                return ActionOutcome::success(json!("Container restarted and running"));
            }
            Ok(_) => {}
            Err(RuntimeError::NotFound(_)) => return not_found(container),
            Err(e) => {
                debug!(container, error = %e, "restart status poll failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    ActionOutcome::failed(format!(
        "Container did not reach running state within {RESTART_WAIT_SECS}s"
    ))
}

// ─── scale_up ────────────────────────────────────────────────────────────────

/// Add one replica to the orchestrator service the container belongs to.
/// Unlabeled containers and missing services are `not_applicable`, which is
/// excluded from cooldown and breaker accounting by the caller.
pub async fn scale_up(runtime: &dyn ContainerRuntime, container: &str) -> ActionOutcome {
    info!(container, "scaling up");

    let details = match runtime.inspect(container).await {
        Ok(details) => details,
        Err(RuntimeError::NotFound(_)) => return not_found(container),
        Err(e) => return ActionOutcome::failed(format!("inspect failed: {e}")),
    };

    let Some(service_name) = details.labels.get(LABEL_SWARM_SERVICE) else {
        warn!(container, "scale not applicable for standalone container");
        return ActionOutcome::not_applicable(
            "Scale operation not applicable - requires an orchestrator service",
        );
    };

    let service = match runtime.find_service(service_name).await {
        Ok(Some(service)) => service,
        Ok(None) => {
            warn!(container, service = %service_name, "service not found");
            return ActionOutcome::not_applicable(format!(
                "Service {service_name} not found"
            ));
        }
        Err(e) => return ActionOutcome::failed(format!("service lookup failed: {e}")),
    };

    let new_replicas = service.replicas + 1;
    if let Err(e) = runtime.scale_service(&service, new_replicas).await {
        return ActionOutcome::failed(format!("scale failed: {e}"));
    }

    warn!(
        service = %service.name,
        previous = service.replicas,
        new = new_replicas,
        "service scaled"
    );
    ActionOutcome::success(json!({
        "service": service.name,
        "previous_replicas": service.replicas,
        "new_replicas": new_replicas,
    }))
}

// ─── cleanup ─────────────────────────────────────────────────────────────────

/// Remove stopped containers and prune volumes, strictly scoped to the
/// target: its compose project/service labels when present, otherwise its
/// image as an ancestor filter. Running containers are never removed.
pub async fn cleanup(runtime: &dyn ContainerRuntime, container: &str) -> ActionOutcome {
    info!(container, "cleaning up scoped resources");

    let target = match runtime.inspect(container).await {
        Ok(details) => details,
        Err(RuntimeError::NotFound(_)) => return not_found(container),
        Err(e) => return ActionOutcome::failed(format!("inspect failed: {e}")),
    };

    let compose_project = target.labels.get(LABEL_COMPOSE_PROJECT).cloned();
    let compose_service = target.labels.get(LABEL_COMPOSE_SERVICE).cloned();

    let mut label_filters = Vec::new();
    let mut ancestor = None;
    if let Some(project) = &compose_project {
        label_filters.push(format!("{LABEL_COMPOSE_PROJECT}={project}"));
        if let Some(service) = &compose_service {
            label_filters.push(format!("{LABEL_COMPOSE_SERVICE}={service}"));
        }
        debug!(project = %project, "using compose scope");
    } else {
        ancestor = Some(target.image_id.clone());
        debug!(image = %target.image_id, "using ancestor scope");
    }

    let mut stats = CleanupStats::default();

    let stopped = match runtime
        .list_containers_filtered("exited", &label_filters, ancestor.as_deref())
        .await
    {
        Ok(list) => list,
        Err(e) => return ActionOutcome::failed(format!("scoped listing failed: {e}")),
    };

    let mut removed_ids = Vec::new();
    for candidate in stopped {
        // Re-check status right before removal; the filter snapshot can be
        // stale and a running container must never be removed.
        match runtime.inspect(&candidate.name).await {
            Ok(details) if details.status == "running" => {
                warn!(container = %candidate.name, "skipping running container");
                continue;
            }
            Ok(_) => {}
            Err(_) => continue,
        }

        match runtime.remove(&candidate.name, true).await {
            Ok(()) => {
                info!(container = %candidate.name, "removed stopped container");
                stats.containers_removed += 1;
                removed_ids.push(candidate.id);
            }
            Err(e) => {
                warn!(container = %candidate.name, error = %e, "failed to remove container");
            }
        }
    }

    if compose_project.is_some() {
        match runtime.prune_volumes(&label_filters).await {
            Ok(report) => {
                stats.volumes_removed = report.volumes_deleted.len() as u64;
                stats.space_reclaimed_bytes = report.space_reclaimed_bytes;
            }
            Err(e) => {
                warn!(error = %e, "volume pruning failed");
                stats.notes.push(format!("Volume pruning failed: {e}"));
            }
        }
    } else if removed_ids.is_empty() {
        stats
            .notes
            .push("No containers removed; skipping volume pruning".to_string());
        info!("no containers removed; skipping volume pruning");
    } else {
        // No compose scope: sweep only dangling volumes tied to what was
        // just removed.
        match runtime.list_volumes(true).await {
            Ok(volumes) => {
                for volume in volumes {
                    let referenced = removed_ids.iter().any(|id| volume.name.contains(id.as_str()))
                        || volume.labels.contains_key(LABEL_COMPOSE_PROJECT);
                    if !referenced {
                        continue;
                    }
                    match runtime.remove_volume(&volume.name).await {
                        Ok(()) => stats.volumes_removed += 1,
                        Err(e) => {
                            warn!(volume = %volume.name, error = %e, "failed to remove volume");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "dangling volume listing failed");
                stats.notes.push(format!("Volume pruning failed: {e}"));
            }
        }
    }

    info!(
        containers_removed = stats.containers_removed,
        volumes_removed = stats.volumes_removed,
        space_reclaimed = stats.space_reclaimed_bytes,
        "cleanup complete"
    );
    ActionOutcome::success(serde_json::to_value(&stats).unwrap_or_default())
}

// ─── exec ────────────────────────────────────────────────────────────────────

/// Run a diagnostic command inside a running container, gated by the
/// read-only allow-list.
pub async fn exec(
    runtime: &dyn ContainerRuntime,
    container: &str,
    command: Option<&str>,
    enforce_allowlist: bool,
) -> ActionOutcome {
    let command = command.unwrap_or("ps aux");
    info!(container, command, "executing diagnostic command");

    let allowed = EXEC_ALLOWLIST
        .iter()
        .any(|safe| command == *safe || command.starts_with(&format!("{safe} ")));

    if !allowed {
        if enforce_allowlist {
            let message = format!("Command not in allowlist: {command}");
            warn!(container, command, "exec rejected by allowlist");
            return ActionOutcome::rejected("exec_not_allowed", message);
        }
        warn!(container, command, "command outside allowlist, executing anyway");
    }

    let details = match runtime.inspect(container).await {
        Ok(details) => details,
        Err(RuntimeError::NotFound(_)) => return not_found(container),
        Err(e) => return ActionOutcome::failed(format!("inspect failed: {e}")),
    };
    if details.status != "running" {
        return ActionOutcome::failed(format!(
            "Container not running: {container} (status: {})",
            details.status
        ));
    }

    match runtime.exec(container, command).await {
        Ok(result) => {
            info!(container, exit_code = result.exit_code, "command executed");
            let output: String = result.output.chars().take(EXEC_OUTPUT_LIMIT).collect();
            ActionOutcome::success(json!({
                "command": command,
                "exit_code": result.exit_code,
                "output": output,
            }))
        }
        Err(RuntimeError::NotFound(_)) => not_found(container),
        Err(e) => ActionOutcome::failed(format!("exec failed: {e}")),
    }
}
