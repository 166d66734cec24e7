// src/core/haproxy/reconciler.rs

//! Backend/server reconciliation against the HAProxy Dataplane API.

use super::dataplane::{Balance, BackendPayload, DataplaneClient, Flag, ServerPayload};
use super::slots::SlotAllocator;
use super::transaction::Transaction;
use crate::config::{BackendMode, HaproxyConfig};
use crate::core::errors::DiscoveryError;
use crate::core::metrics;
use crate::core::models::{DiscoveredInstance, DiscoveredService, ServiceKey};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, info, warn};

const MAX_VERSION_RETRIES: u32 = 3;

/// Reconciles discovered cloud services with HAProxy backends and servers.
pub struct Reconciler {
    client: DataplaneClient,
    name_prefix: String,
    name_separator: String,
    balance: String,
    mode: BackendMode,
    slots: SlotAllocator,
    haproxy_az: Option<String>,
    az_weight_tag: String,
    backend_options: HashMap<String, serde_json::Map<String, Value>>,
}

impl Reconciler {
    pub fn new(config: &HaproxyConfig) -> Result<Self, DiscoveryError> {
        Ok(Self {
            client: DataplaneClient::new(config)?,
            name_prefix: config
                .backend
                .name_prefix
                .clone()
                .unwrap_or_else(|| "azure".to_string()),
            name_separator: config.backend.name_separator.clone(),
            balance: config.backend.balance.clone(),
            mode: config.backend.mode,
            slots: SlotAllocator::new(&config.server_slots),
            haproxy_az: config.availability_zone.clone(),
            az_weight_tag: config.az_weight_tag.clone(),
            backend_options: config.backend_options.clone(),
        })
    }

    /// Reconcile all changes in a single atomic transaction.
    ///
    /// Retries the whole operation up to [`MAX_VERSION_RETRIES`] attempts on
    /// optimistic-concurrency conflicts; any other error aborts the
    /// transaction and propagates.
    pub async fn reconcile(
        &self,
        changed_services: &[DiscoveredService],
        removed_keys: &[ServiceKey],
    ) -> Result<(), DiscoveryError> {
        if changed_services.is_empty() && removed_keys.is_empty() {
            debug!("Nothing to reconcile");
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.do_reconcile(changed_services, removed_keys).await {
                Ok(()) => return Ok(()),
                Err(DiscoveryError::VersionConflict) if attempt < MAX_VERSION_RETRIES => {
                    metrics::VERSION_CONFLICT_RETRIES_TOTAL.inc();
                    warn!(
                        attempt,
                        max = MAX_VERSION_RETRIES,
                        "Version conflict, retrying reconciliation"
                    );
                }
                Err(DiscoveryError::VersionConflict) => {
                    error!(
                        attempts = MAX_VERSION_RETRIES,
                        "Version conflict persisted, giving up"
                    );
                    return Err(DiscoveryError::VersionConflict);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn do_reconcile(
        &self,
        changed_services: &[DiscoveredService],
        removed_keys: &[ServiceKey],
    ) -> Result<(), DiscoveryError> {
        let mut txn = Transaction::begin(&self.client).await?;
        match self.apply(&mut txn, changed_services, removed_keys).await {
            Ok(()) => txn.finish().await,
            Err(e) => {
                warn!(error = %e, "Transaction aborted");
                txn.abort().await;
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        txn: &mut Transaction<'_>,
        changed_services: &[DiscoveredService],
        removed_keys: &[ServiceKey],
    ) -> Result<(), DiscoveryError> {
        for service in changed_services {
            self.reconcile_service(txn, service).await?;
            txn.mark_changed();
        }

        for key in removed_keys {
            let backend_name = key.backend_name(&self.name_prefix, &self.name_separator);
            self.disable_all_servers(txn, &backend_name).await?;
            txn.mark_changed();
        }

        Ok(())
    }

    // ── Changed service reconciliation ──────────────────────────────

    async fn reconcile_service(
        &self,
        txn: &mut Transaction<'_>,
        service: &DiscoveredService,
    ) -> Result<(), DiscoveryError> {
        let backend_name = service.backend_name(&self.name_prefix, &self.name_separator);
        info!(
            service = %service.key(),
            instances = service.active_count(),
            backend = %backend_name,
            "Reconciling service"
        );

        self.ensure_backend(txn, &backend_name, &service.service_name)
            .await?;

        let total_slots = self.slots.calculate_slots(service.active_count());
        let slot_names = SlotAllocator::generate_server_names(total_slots);

        let existing: BTreeSet<String> = self
            .client
            .list_servers(&backend_name, Some(txn.id()))
            .await?
            .iter()
            .filter_map(|s| s.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();

        // Stable slot assignment: the kth instance by id always lands in
        // srv{k+1}, which minimises churn across cycles.
        let mut active: Vec<&DiscoveredInstance> = service.instances.iter().collect();
        active.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        for (i, slot_name) in slot_names.iter().enumerate() {
            let payload = match active.get(i) {
                Some(inst) => self.active_server_data(slot_name, inst),
                None => maintenance_server_data(slot_name),
            };
            if existing.contains(slot_name) {
                self.client
                    .replace_server(slot_name, &backend_name, &payload, txn.id())
                    .await?;
            } else {
                self.client
                    .create_server(&backend_name, &payload, txn.id())
                    .await?;
            }
        }

        // Remove servers beyond our slot count (shrinkage below a previous
        // high-water mark).
        for name in &existing {
            if !slot_names.iter().any(|slot| slot == name) {
                debug!(server = %name, backend = %backend_name, "Removing extra server");
                self.client
                    .delete_server(name, &backend_name, txn.id())
                    .await?;
            }
        }

        Ok(())
    }

    // ── Removed service handling ────────────────────────────────────

    /// Set all servers in the backend to maintenance mode. Backends are
    /// never deleted.
    async fn disable_all_servers(
        &self,
        txn: &mut Transaction<'_>,
        backend_name: &str,
    ) -> Result<(), DiscoveryError> {
        if self
            .client
            .get_backend(backend_name, Some(txn.id()))
            .await?
            .is_none()
        {
            debug!(backend = %backend_name, "Backend not found, nothing to disable");
            return Ok(());
        }

        let servers = self
            .client
            .list_servers(backend_name, Some(txn.id()))
            .await?;
        if servers.is_empty() {
            debug!(backend = %backend_name, "No servers in backend");
            return Ok(());
        }

        info!(
            servers = servers.len(),
            backend = %backend_name,
            "Disabling servers in removed backend"
        );
        for server in &servers {
            let Some(name) = server.get("name").and_then(Value::as_str) else {
                continue;
            };
            self.client
                .replace_server(name, backend_name, &maintenance_server_data(name), txn.id())
                .await?;
        }
        Ok(())
    }

    // ── Backend helpers ─────────────────────────────────────────────

    /// Create the backend if it does not already exist.
    async fn ensure_backend(
        &self,
        txn: &mut Transaction<'_>,
        name: &str,
        service_name: &str,
    ) -> Result<(), DiscoveryError> {
        if self
            .client
            .get_backend(name, Some(txn.id()))
            .await?
            .is_some()
        {
            return Ok(());
        }

        info!(backend = %name, "Creating backend");
        let payload = BackendPayload {
            name: name.to_string(),
            mode: self.mode,
            balance: Balance {
                algorithm: self.balance.clone(),
            },
            extra: self
                .backend_options
                .get(service_name)
                .cloned()
                .unwrap_or_default(),
        };
        self.client.create_backend(&payload, txn.id()).await
    }

    // ── Server data builders ────────────────────────────────────────

    /// Build the server entry for an instance occupying a slot, including
    /// AZ-aware weighting when the load balancer's zone is configured.
    pub fn active_server_data(&self, name: &str, instance: &DiscoveredInstance) -> ServerPayload {
        let mut payload = ServerPayload {
            name: name.to_string(),
            address: instance.private_ip.clone(),
            port: instance.effective_port(),
            maintenance: Some(Flag::Disabled),
            check: Some(Flag::Enabled),
            cookie: Some(name.to_string()),
            weight: None,
            backup: None,
        };

        if let Some(haproxy_az) = &self.haproxy_az {
            // An instance with no zone is treated as same-AZ.
            let same_az = instance
                .availability_zone
                .as_ref()
                .is_none_or(|az| az == haproxy_az);

            match parse_az_perc(instance.tags.get(&self.az_weight_tag)) {
                Some(az_perc) => {
                    payload.weight = Some(if same_az { 100 - az_perc } else { az_perc });
                }
                None if !same_az => payload.backup = Some(Flag::Enabled),
                None => {}
            }
        }

        payload
    }
}

/// Build the placeholder entry for an unoccupied slot.
pub fn maintenance_server_data(name: &str) -> ServerPayload {
    ServerPayload {
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        port: 80,
        maintenance: Some(Flag::Enabled),
        check: Some(Flag::Disabled),
        cookie: None,
        weight: None,
        backup: None,
    }
}

/// Parse the AZ weight percentage tag value; only values in 1..=99 count.
fn parse_az_perc(raw: Option<&String>) -> Option<u32> {
    let val: u32 = raw?.trim().parse().ok()?;
    (1..=99).contains(&val).then_some(val)
}
