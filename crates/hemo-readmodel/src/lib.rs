//! Read-only dashboard layer over the bus keyspace.
//!
//! Every accessor is point-in-time consistent only: the agents keep writing
//! while the dashboard reads, and no transactional view is offered.
//! Malformed entries are skipped, never surfaced.

#![forbid(unsafe_code)]

use hemo_bus::{Bus, get_state};
use hemo_proto::{
    AuditEntry, BreakerState, ContainerSnapshot, Envelope, RemediationHistory, keys,
};
use std::sync::Arc;
use tracing::warn;

pub struct ReadModel {
    bus: Arc<dyn Bus>,
}

impl ReadModel {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Latest snapshot for every container the Observer has seen recently.
    pub async fn container_snapshots(&self) -> Vec<ContainerSnapshot> {
        let pattern = keys::container_state("*");
        let found = match self.bus.kv_keys(&pattern).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "snapshot key scan failed");
                return Vec::new();
            }
        };

        let mut snapshots = Vec::new();
        for key in found {
            if let Some(snapshot) = get_state::<ContainerSnapshot>(self.bus.as_ref(), &key).await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        snapshots
    }

    /// Unified timeline, newest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<Envelope> {
        self.read_event_list(keys::EVENTS_ALL, limit).await
    }

    /// Per-type timeline, newest first.
    pub async fn events_by_type(&self, event_type: &str, limit: usize) -> Vec<Envelope> {
        self.read_event_list(&keys::events(event_type), limit).await
    }

    async fn read_event_list(&self, key: &str, limit: usize) -> Vec<Envelope> {
        let raw = match self.bus.lrange(key, 0, limit as isize - 1).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "event list read failed");
                return Vec::new();
            }
        };

        let mut events: Vec<Envelope> = raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(key, error = %e, "skipping malformed event entry");
                    None
                }
            })
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }

    /// Audit rows for one container, newest first.
    pub async fn audit_trail(&self, container: &str, limit: usize) -> Vec<AuditEntry> {
        let raw = match self
            .bus
            .lrange(&keys::audit(container), 0, limit as isize - 1)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(container, error = %e, "audit read failed");
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect()
    }

    pub async fn breaker_state(&self, container: &str) -> Option<BreakerState> {
        get_state(self.bus.as_ref(), &keys::circuit_breaker(container)).await
    }

    pub async fn remediation_history(&self, container: &str) -> Option<RemediationHistory> {
        get_state(self.bus.as_ref(), &keys::remediation_history(container)).await
    }
}
