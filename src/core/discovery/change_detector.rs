// src/core/discovery/change_detector.rs

//! State diff engine that detects changes between discovery cycles.

use crate::core::models::{DiscoveredService, ServiceKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Snapshot of a service's instances at a point in time.
///
/// The creation-timestamp set catches in-place replacement where an instance
/// id is reused; an id-stable, count-stable IP change is deliberately not
/// detected (IPs are stable for an instance's lifetime in the targeted
/// clouds).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceState {
    instance_ids: BTreeSet<String>,
    count: usize,
    created_ats: BTreeSet<Option<DateTime<Utc>>>,
}

impl ServiceState {
    fn snapshot(service: &DiscoveredService) -> Self {
        Self {
            instance_ids: service
                .instances
                .iter()
                .map(|inst| inst.instance_id.clone())
                .collect(),
            count: service.active_count(),
            created_ats: service.instances.iter().map(|inst| inst.created_at).collect(),
        }
    }
}

/// Tracks per-service state and detects changes between polling cycles.
///
/// Owned by the daemon; cycles are strictly sequential, so no locking is
/// needed.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    previous: HashMap<ServiceKey, ServiceState>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stored state (e.g. on SIGHUP).
    pub fn reset(&mut self) {
        info!("Change detector state reset, next cycle will reconcile everything");
        self.previous.clear();
    }

    /// Compare current services against the previous state.
    ///
    /// Returns `(changed_services, removed_keys)`: services that are new or
    /// differ from their stored snapshot, and keys present last cycle but
    /// absent now. Afterwards the stored state is replaced wholesale by
    /// snapshots of all current services.
    pub fn detect(
        &mut self,
        current: &HashMap<ServiceKey, DiscoveredService>,
    ) -> (Vec<DiscoveredService>, Vec<ServiceKey>) {
        let mut changed: Vec<DiscoveredService> = Vec::new();
        let mut removed: Vec<ServiceKey> = Vec::new();

        for key in self.previous.keys() {
            if !current.contains_key(key) {
                info!(service = %key, "Service removed");
                removed.push(key.clone());
            }
        }

        for (key, service) in current {
            let state = ServiceState::snapshot(service);
            match self.previous.get(key) {
                None => {
                    info!(
                        service = %key,
                        instances = state.count,
                        "New service discovered"
                    );
                    changed.push(service.clone());
                }
                Some(prev) => {
                    if has_changed(prev, &state, key) {
                        changed.push(service.clone());
                    }
                }
            }
        }

        self.previous = current
            .iter()
            .map(|(key, svc)| (key.clone(), ServiceState::snapshot(svc)))
            .collect();

        // Deterministic reconciliation order regardless of map iteration.
        changed.sort_by(|a, b| a.key().cmp(&b.key()));
        removed.sort();

        let unchanged = current.len() - changed.len();
        info!(
            changed = changed.len(),
            removed = removed.len(),
            unchanged,
            "Change detection complete"
        );
        (changed, removed)
    }
}

fn has_changed(prev: &ServiceState, curr: &ServiceState, key: &ServiceKey) -> bool {
    if prev.count != curr.count {
        info!(
            service = %key,
            previous = prev.count,
            current = curr.count,
            "Service instance count changed"
        );
        return true;
    }
    if prev.instance_ids != curr.instance_ids {
        let added = curr.instance_ids.difference(&prev.instance_ids).count();
        let removed = prev.instance_ids.difference(&curr.instance_ids).count();
        info!(service = %key, added, removed, "Service instance ids changed");
        return true;
    }
    if prev.created_ats != curr.created_ats {
        info!(service = %key, "Service creation timestamps changed");
        return true;
    }
    false
}
