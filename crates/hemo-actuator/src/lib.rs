//! Actuator agent: executes recommended remediation actions under cooldown,
//! circuit-breaker, and dry-run guards, with an audit row on every path and
//! exactly one `remediation_complete` event per request.

#![forbid(unsafe_code)]

use hemo_bus::{Bus, RetryPolicy, get_state, publish_event, set_state};
use hemo_config::ActuatorConfig;
use hemo_proto::{
    Action, ActionOutcome, Agent, AuditEntry, BreakerState, Clock, OutcomeStatus,
    RemediationComplete, RemediationHistory, RemediationRequest, keys,
};
use hemo_runtime::ContainerRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub mod actions;
pub mod guards;
pub mod state;

/// TTLs per the keyed-state table: bookkeeping 2 h, audit 7 d.
const HISTORY_TTL_SECS: u64 = 7200;
const BREAKER_TTL_SECS: u64 = 7200;
const AUDIT_TTL_SECS: u64 = 604_800;
const AUDIT_MAX_ENTRIES: isize = 100;

/// Symbolic pause standing in for the real operation in dry-run mode.
const DRY_RUN_PAUSE: Duration = Duration::from_millis(500);

pub struct Actuator {
    bus: Arc<dyn Bus>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    config: ActuatorConfig,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl Actuator {
    pub fn new(
        bus: Arc<dyn Bus>,
        runtime: Option<Arc<dyn ContainerRuntime>>,
        config: ActuatorConfig,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        if runtime.is_none() {
            warn!("runtime client unavailable; actions will fail until it recovers");
        }
        info!(
            cooldown_seconds = config.cooldown_seconds,
            max_retries_per_hour = config.max_retries_per_hour,
            dry_run = config.dry_run,
            enforce_exec_allowlist = config.enforce_exec_allowlist,
            "actuator initialized"
        );
        Self {
            bus,
            runtime,
            config,
            clock,
            retry,
        }
    }

    /// Guard sequence, execution, state updates, completion fan-out, audit.
    pub async fn handle_request(&self, request: RemediationRequest) {
        let container = request.container.clone();
        let now = self.clock.now();

        // Gate 1: cooldown.
        let history: RemediationHistory =
            get_state(self.bus.as_ref(), &keys::remediation_history(&container))
                .await
                .unwrap_or_default();
        if let Some(remaining) =
            guards::cooldown_remaining(&history, now, self.config.cooldown_seconds)
        {
            info!(container = %container, remaining_seconds = remaining, "cooldown active");
            let result = ActionOutcome::rejected_cooldown(remaining);
            self.publish_complete(&request, &result, false).await;
            self.write_audit(&request, &result, false).await;
            return;
        }

        // Gate 2: circuit breaker.
        let mut breaker: BreakerState =
            get_state(self.bus.as_ref(), &keys::circuit_breaker(&container))
                .await
                .unwrap_or_default();
        match guards::check_breaker(&breaker, now) {
            guards::BreakerVerdict::Proceed => {}
            guards::BreakerVerdict::ProceedAfterReset => {
                info!(container = %container, "breaker window elapsed, closing before action");
                state::reset_breaker(&mut breaker);
                self.store_breaker(&container, &breaker).await;
            }
            guards::BreakerVerdict::Reject { retry_count } => {
                warn!(container = %container, retry_count, "circuit breaker open");
                let result = ActionOutcome::rejected_breaker(retry_count);
                self.publish_complete(&request, &result, false).await;
                self.write_audit(&request, &result, false).await;
                return;
            }
        }

        // Gate 3: dry-run.
        if self.config.dry_run {
            info!(container = %container, action = %request.action, "dry run");
            tokio::time::sleep(DRY_RUN_PAUSE).await;
            let result =
                ActionOutcome::success(serde_json::Value::String(format!(
                    "Dry-run simulation of {}",
                    request.action
                )));
            self.publish_complete(&request, &result, true).await;
            self.write_audit(&request, &result, true).await;
            return;
        }

        let result = self.execute(&request).await;

        // `not_applicable` leaves cooldown and breaker untouched.
        if result.status == OutcomeStatus::NotApplicable {
            info!(container = %container, action = %request.action, "action not applicable");
        } else {
            let mut history = history;
            state::record_action(&mut history, request.action, result.status, now);
            if let Err(e) = set_state(
                self.bus.as_ref(),
                &keys::remediation_history(&container),
                &history,
                Some(HISTORY_TTL_SECS),
            )
            .await
            {
                error!(container = %container, error = %e, "failed to update remediation history");
            }

            // Policy refusals (exec allow-list) are not breaker failures.
            if result.status != OutcomeStatus::Rejected {
                state::record_breaker_outcome(
                    &mut breaker,
                    result.status == OutcomeStatus::Success,
                    now,
                    self.config.max_retries_per_hour,
                );
                self.store_breaker(&container, &breaker).await;
            }
        }

        self.publish_complete(&request, &result, false).await;
        self.write_audit(&request, &result, false).await;
    }

    async fn execute(&self, request: &RemediationRequest) -> ActionOutcome {
        let Some(runtime) = &self.runtime else {
            return ActionOutcome::failed("runtime unavailable");
        };
        let runtime = runtime.as_ref();

        match request.action {
            Action::Restart => actions::restart(runtime, &request.container).await,
            Action::ScaleUp => actions::scale_up(runtime, &request.container).await,
            Action::Cleanup => actions::cleanup(runtime, &request.container).await,
            Action::Exec => {
                actions::exec(
                    runtime,
                    &request.container,
                    request.command.as_deref(),
                    self.config.enforce_exec_allowlist,
                )
                .await
            }
            Action::None => {
                // The Decider never routes `none` here; refuse rather than
                // guess if it slips through.
                ActionOutcome::failed("no actionable remediation requested")
            }
        }
    }

    async fn store_breaker(&self, container: &str, breaker: &BreakerState) {
        if let Err(e) = set_state(
            self.bus.as_ref(),
            &keys::circuit_breaker(container),
            breaker,
            Some(BREAKER_TTL_SECS),
        )
        .await
        {
            error!(container = %container, error = %e, "failed to store breaker state");
        }
    }

    async fn publish_complete(
        &self,
        request: &RemediationRequest,
        result: &ActionOutcome,
        dry_run: bool,
    ) {
        let complete = RemediationComplete {
            container: request.container.clone(),
            action: request.action,
            result: result.clone(),
            dry_run,
            reason: Some(request.reason.clone()),
            confidence: Some(request.confidence),
        };

        match result.status {
            OutcomeStatus::Success => info!(
                container = %request.container,
                action = %request.action,
                "remediation complete"
            ),
            status => warn!(
                container = %request.container,
                action = %request.action,
                status = %status,
                "remediation complete"
            ),
        }

        if let Err(e) = publish_event(
            self.bus.as_ref(),
            &self.retry,
            keys::CHANNEL_REMEDIATION_COMPLETE,
            keys::EVENT_REMEDIATION_COMPLETE,
            Agent::Actuator,
            serde_json::to_value(&complete).unwrap_or_default(),
        )
        .await
        {
            error!(container = %request.container, error = %e, "failed to publish completion");
        }
    }

    /// Prepend an audit row; every request lands here exactly once,
    /// rejections and dry-runs included.
    async fn write_audit(
        &self,
        request: &RemediationRequest,
        result: &ActionOutcome,
        dry_run: bool,
    ) {
        let entry = AuditEntry {
            timestamp: self.clock.now(),
            container: request.container.clone(),
            action: request.action,
            result_status: result.status,
            error: result.error.clone(),
            confidence: Some(request.confidence),
            reason: Some(request.reason.clone()),
            metrics: request.metrics.clone(),
            dry_run,
        };

        let key = keys::audit(&request.container);
        let row = match serde_json::to_string(&entry) {
            Ok(row) => row,
            Err(e) => {
                error!(container = %request.container, error = %e, "failed to serialize audit row");
                return;
            }
        };

        let write = async {
            self.bus.lpush(&key, &row).await?;
            self.bus.ltrim(&key, 0, AUDIT_MAX_ENTRIES - 1).await?;
            self.bus.kv_expire(&key, AUDIT_TTL_SECS).await
        };
        if let Err(e) = write.await {
            error!(container = %request.container, error = %e, "failed to write audit row");
        }
    }

    /// Subscription loop over `remediation_needed`.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), hemo_bus::BusError> {
        let mut sub = self
            .bus
            .subscribe(&[keys::CHANNEL_REMEDIATION_NEEDED])
            .await?;
        info!("actuator listening for remediation requests");

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    let Some(msg) = msg else { break };
                    let envelope: hemo_proto::Envelope = match serde_json::from_str(&msg.payload) {
                        Ok(env) => env,
                        Err(e) => {
                            error!(error = %e, "dropping malformed bus message");
                            continue;
                        }
                    };
                    match serde_json::from_value::<RemediationRequest>(envelope.data) {
                        Ok(request) => {
                            info!(
                                container = %request.container,
                                action = %request.action,
                                "received remediation request"
                            );
                            self.handle_request(request).await;
                        }
                        Err(e) => error!(error = %e, "dropping malformed remediation request"),
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("actuator loop stopped");
        Ok(())
    }
}
