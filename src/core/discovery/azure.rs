// src/core/discovery/azure.rs

//! Azure VM and VMSS discovery over the Azure Resource Manager REST API.
//!
//! Authentication uses the client-credentials flow when the standard
//! `AZURE_TENANT_ID` / `AZURE_CLIENT_ID` / `AZURE_CLIENT_SECRET` variables
//! are present, and falls back to the IMDS managed-identity endpoint
//! otherwise. Tokens are cached and refreshed shortly before expiry.

use super::DiscoveryClient;
use crate::config::{AzureConfig, TagsConfig};
use crate::core::errors::DiscoveryError;
use crate::core::models::{DiscoveredInstance, InstanceSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MANAGEMENT_BASE: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const COMPUTE_API_VERSION: &str = "2024-03-01";
const NETWORK_API_VERSION: &str = "2023-09-01";
/// Tokens are refreshed this many seconds before their reported expiry.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

// ── ARM resource shapes (only the fields we read) ───────────────────

#[derive(Debug, Clone, Deserialize)]
struct VmResource {
    id: String,
    name: String,
    location: String,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    zones: Vec<String>,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    #[serde(default)]
    vm_id: Option<String>,
    #[serde(default)]
    time_created: Option<DateTime<Utc>>,
    #[serde(default)]
    network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Clone, Deserialize)]
struct VmssResource {
    id: String,
    name: String,
    location: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct VmssVmResource {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "instanceId", default)]
    instance_id: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    zones: Vec<String>,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkProfile {
    #[serde(default)]
    network_interfaces: Vec<ResourceRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceRef {
    id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceStatus>,
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceStatus {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NicResource {
    #[serde(default)]
    properties: NicProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NicProperties {
    #[serde(default)]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
struct IpConfiguration {
    #[serde(default)]
    properties: IpConfigurationProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IpConfigurationProperties {
    // ARM spells these with a capital "IP".
    #[serde(rename = "privateIPAddress", default)]
    private_ip_address: Option<String>,
    #[serde(rename = "publicIPAddress", default)]
    public_ip_address: Option<ResourceRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PublicIpResource {
    #[serde(default)]
    properties: PublicIpProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIpProperties {
    #[serde(default)]
    ip_address: Option<String>,
}

// ── Token handling ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<ExpiresIn>,
}

/// AAD returns `expires_in` as a number, IMDS as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Num(u64),
    Str(String),
}

impl ExpiresIn {
    fn seconds(&self) -> u64 {
        match self {
            ExpiresIn::Num(n) => *n,
            ExpiresIn::Str(s) => s.parse().unwrap_or(3600),
        }
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Discovers VMs and VMSS instances from Azure through the management REST
/// API.
pub struct AzureClient {
    http: reqwest::Client,
    config: AzureConfig,
    tags: TagsConfig,
    token: Mutex<Option<CachedToken>>,
}

impl AzureClient {
    pub fn new(config: AzureConfig, tags: TagsConfig) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            config,
            tags,
            token: Mutex::new(None),
        })
    }

    // ── Authentication ──────────────────────────────────────────────

    async fn access_token(&self) -> Result<String, DiscoveryError> {
        {
            let cache = self.token.lock();
            if let Some(cached) = cache.as_ref() {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_token().await?;
        let ttl = expires_in.saturating_sub(TOKEN_REFRESH_MARGIN_SECS).max(60);
        *self.token.lock() = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(token)
    }

    async fn fetch_token(&self) -> Result<(String, u64), DiscoveryError> {
        let tenant = env::var("AZURE_TENANT_ID").ok();
        let client_id = env::var("AZURE_CLIENT_ID").ok();
        let client_secret = env::var("AZURE_CLIENT_SECRET").ok();

        let resp = match (tenant, client_id, client_secret) {
            (Some(tenant), Some(client_id), Some(client_secret)) => {
                debug!("Requesting ARM token via client credentials");
                let url = format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token");
                self.http
                    .post(&url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("scope", MANAGEMENT_SCOPE),
                    ])
                    .send()
                    .await?
            }
            _ => {
                debug!("Requesting ARM token via managed identity (IMDS)");
                self.http
                    .get(IMDS_TOKEN_URL)
                    .query(&[("api-version", "2018-02-01"), ("resource", MANAGEMENT_BASE)])
                    .header("Metadata", "true")
                    .send()
                    .await?
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscoveryError::Cloud(format!(
                "Azure token request failed: HTTP {status}: {body}"
            )));
        }
        let token: TokenResponse = resp.json().await?;
        let expires_in = token.expires_in.map(|e| e.seconds()).unwrap_or(3600);
        Ok((token.access_token, expires_in))
    }

    // ── ARM plumbing ────────────────────────────────────────────────

    async fn get_json(&self, url: &str) -> Result<Value, DiscoveryError> {
        let token = self.access_token().await?;
        let resp = self.http.get(url).bearer_auth(token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscoveryError::Cloud(format!(
                "ARM request to {url} failed: HTTP {status}: {body}"
            )));
        }
        Ok(resp.json().await?)
    }

    /// Collect all items of a paginated ARM list, following `nextLink`.
    async fn list_all(&self, first_url: String) -> Result<Vec<Value>, DiscoveryError> {
        let mut out = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next {
            let page = self.get_json(&url).await?;
            if let Some(values) = page.get("value").and_then(Value::as_array) {
                out.extend(values.iter().cloned());
            }
            next = page
                .get("nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(out)
    }

    /// List a compute resource collection across the configured resource
    /// groups, or subscription-wide when none are configured.
    async fn list_compute(&self, resource_type: &str) -> Result<Vec<Value>, DiscoveryError> {
        let sub = &self.config.subscription_id;
        let mut out = Vec::new();
        if self.config.resource_groups.is_empty() {
            debug!(resource_type, "Listing across all resource groups");
            let url = format!(
                "{MANAGEMENT_BASE}/subscriptions/{sub}/providers/Microsoft.Compute/{resource_type}?api-version={COMPUTE_API_VERSION}"
            );
            out.extend(self.list_all(url).await?);
        } else {
            for rg in &self.config.resource_groups {
                debug!(resource_type, resource_group = %rg, "Listing in resource group");
                let url = format!(
                    "{MANAGEMENT_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/{resource_type}?api-version={COMPUTE_API_VERSION}"
                );
                out.extend(self.list_all(url).await?);
            }
        }
        Ok(out)
    }

    // ── VM discovery ────────────────────────────────────────────────

    async fn discover_vms(&self) -> Result<Vec<DiscoveredInstance>, DiscoveryError> {
        let mut instances = Vec::new();

        for raw in self.list_compute("virtualMachines").await? {
            let vm: VmResource = match serde_json::from_value(raw) {
                Ok(vm) => vm,
                Err(e) => {
                    warn!(error = %e, "Skipping VM with unexpected resource shape");
                    continue;
                }
            };

            let Some((service_name, service_port)) = self.service_tags(&vm.tags, &vm.name) else {
                continue;
            };

            let rg = resource_group_from_id(&vm.id);
            if !self.is_running_vm(&rg, &vm.name).await {
                debug!(vm = %vm.name, "Skipping VM, not running");
                continue;
            }

            let (private_ip, public_ip) = self.resolve_vm_ips(&vm).await;
            let Some(private_ip) = private_ip else {
                warn!(vm = %vm.name, "VM has no private IP, skipping");
                continue;
            };

            instances.push(DiscoveredInstance {
                instance_id: vm.properties.vm_id.clone().unwrap_or_else(|| vm.id.clone()),
                name: vm.name.clone(),
                private_ip,
                service_name,
                service_port,
                instance_port: self.parse_instance_port(&vm.tags),
                region: vm.location.clone(),
                availability_zone: vm.zones.first().cloned(),
                namespace: rg,
                source: InstanceSource::Vm,
                tags: vm.tags,
                public_ip,
                created_at: vm.properties.time_created,
                power_state: "running".to_string(),
            });
        }

        info!(instances = instances.len(), "VM discovery complete");
        Ok(instances)
    }

    async fn is_running_vm(&self, resource_group: &str, vm_name: &str) -> bool {
        let sub = &self.config.subscription_id;
        let url = format!(
            "{MANAGEMENT_BASE}/subscriptions/{sub}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachines/{vm_name}/instanceView?api-version={COMPUTE_API_VERSION}"
        );
        match self.get_json(&url).await {
            Ok(raw) => serde_json::from_value::<InstanceView>(raw)
                .map(|view| is_power_running(&view))
                .unwrap_or(false),
            Err(e) => {
                debug!(vm = %vm_name, error = %e, "Could not get instance view for VM");
                false
            }
        }
    }

    /// Resolve private and public IPs from a VM's network interfaces. Per-NIC
    /// failures are absorbed; the first private IP found wins.
    async fn resolve_vm_ips(&self, vm: &VmResource) -> (Option<String>, Option<String>) {
        let mut private_ip = None;
        let mut public_ip = None;

        let Some(profile) = &vm.properties.network_profile else {
            return (private_ip, public_ip);
        };

        for nic_ref in &profile.network_interfaces {
            let url = format!(
                "{MANAGEMENT_BASE}{}?api-version={NETWORK_API_VERSION}",
                nic_ref.id
            );
            let nic: NicResource = match self.get_json(&url).await {
                Ok(raw) => serde_json::from_value(raw).unwrap_or_default(),
                Err(e) => {
                    debug!(nic = %nic_ref.id, error = %e, "Could not fetch NIC");
                    continue;
                }
            };

            for ip_config in &nic.properties.ip_configurations {
                if private_ip.is_none() {
                    private_ip = ip_config.properties.private_ip_address.clone();
                }
                if let Some(pip_ref) = &ip_config.properties.public_ip_address {
                    if let Some(addr) = self.resolve_public_ip(&pip_ref.id).await {
                        public_ip = Some(addr);
                    }
                }
            }

            if private_ip.is_some() {
                break;
            }
        }

        (private_ip, public_ip)
    }

    async fn resolve_public_ip(&self, resource_id: &str) -> Option<String> {
        let url = format!("{MANAGEMENT_BASE}{resource_id}?api-version={NETWORK_API_VERSION}");
        match self.get_json(&url).await {
            Ok(raw) => serde_json::from_value::<PublicIpResource>(raw)
                .ok()
                .and_then(|pip| pip.properties.ip_address),
            Err(e) => {
                debug!(public_ip = %resource_id, error = %e, "Could not fetch public IP");
                None
            }
        }
    }

    // ── VMSS discovery ──────────────────────────────────────────────

    async fn discover_vmss(&self) -> Result<Vec<DiscoveredInstance>, DiscoveryError> {
        let mut instances = Vec::new();

        for raw in self.list_compute("virtualMachineScaleSets").await? {
            let vmss: VmssResource = match serde_json::from_value(raw) {
                Ok(vmss) => vmss,
                Err(e) => {
                    warn!(error = %e, "Skipping scale set with unexpected resource shape");
                    continue;
                }
            };

            let Some((set_service_name, set_service_port)) =
                self.service_tags(&vmss.tags, &vmss.name)
            else {
                continue;
            };

            let rg = resource_group_from_id(&vmss.id);
            let vms_url = format!(
                "{MANAGEMENT_BASE}{}/virtualMachines?api-version={COMPUTE_API_VERSION}",
                vmss.id
            );
            let members = self.list_all(vms_url).await?;
            debug!(vmss = %vmss.name, instances = members.len(), "Scale set enumerated");

            for raw_member in members {
                let member: VmssVmResource = match serde_json::from_value(raw_member) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(vmss = %vmss.name, error = %e, "Skipping scale set instance with unexpected shape");
                        continue;
                    }
                };
                let instance_id = member
                    .instance_id
                    .clone()
                    .unwrap_or_else(|| last_id_segment(&member.id));

                if !self
                    .is_running_vmss_instance(&rg, &vmss.name, &instance_id)
                    .await
                {
                    debug!(vmss = %vmss.name, instance = %instance_id, "Skipping scale set instance, not running");
                    continue;
                }

                let Some(private_ip) = self
                    .resolve_vmss_instance_ip(&rg, &vmss.name, &instance_id, &member)
                    .await
                else {
                    warn!(vmss = %vmss.name, instance = %instance_id, "Scale set instance has no private IP, skipping");
                    continue;
                };

                // Instance-level tags shadow scale-set-level tags per key.
                let tags = merge_tags(&vmss.tags, &member.tags);
                let service_name = tags
                    .get(&self.tags.service_name_tag)
                    .cloned()
                    .unwrap_or_else(|| set_service_name.clone());
                let service_port = tags
                    .get(&self.tags.service_port_tag)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(set_service_port);

                // Composite id keeps instance ids globally unique across
                // scale sets.
                let unique_id = format!("{}/virtualMachines/{}", vmss.id, instance_id);
                let name = member
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}", vmss.name, instance_id));

                instances.push(DiscoveredInstance {
                    instance_id: unique_id,
                    name,
                    private_ip,
                    service_name,
                    service_port,
                    instance_port: self.parse_instance_port(&tags),
                    region: vmss.location.clone(),
                    availability_zone: member.zones.first().cloned(),
                    namespace: rg.clone(),
                    source: InstanceSource::Vmss,
                    tags,
                    public_ip: None,
                    created_at: member.properties.time_created,
                    power_state: "running".to_string(),
                });
            }
        }

        info!(instances = instances.len(), "VMSS discovery complete");
        Ok(instances)
    }

    async fn is_running_vmss_instance(
        &self,
        resource_group: &str,
        vmss_name: &str,
        instance_id: &str,
    ) -> bool {
        let sub = &self.config.subscription_id;
        let url = format!(
            "{MANAGEMENT_BASE}/subscriptions/{sub}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets/{vmss_name}/virtualMachines/{instance_id}/instanceView?api-version={COMPUTE_API_VERSION}"
        );
        match self.get_json(&url).await {
            Ok(raw) => serde_json::from_value::<InstanceView>(raw)
                .map(|view| is_power_running(&view))
                .unwrap_or(false),
            Err(e) => {
                debug!(vmss = %vmss_name, instance = %instance_id, error = %e, "Could not get instance view for scale set instance");
                false
            }
        }
    }

    /// Resolve the private IP of a VMSS instance.
    ///
    /// VMSS NICs require dedicated endpoints: the standard NIC GET used for
    /// standalone VMs does not return results. The targeted per-NIC GET
    /// reliably includes full IP configuration; the list endpoint is kept as
    /// a fallback because it may omit `privateIPAddress`.
    async fn resolve_vmss_instance_ip(
        &self,
        resource_group: &str,
        vmss_name: &str,
        instance_id: &str,
        member: &VmssVmResource,
    ) -> Option<String> {
        let sub = &self.config.subscription_id;
        let base = format!(
            "{MANAGEMENT_BASE}/subscriptions/{sub}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets/{vmss_name}/virtualMachines/{instance_id}/networkInterfaces"
        );

        if let Some(profile) = &member.properties.network_profile {
            for nic_ref in &profile.network_interfaces {
                let nic_name = last_id_segment(&nic_ref.id);
                let url = format!("{base}/{nic_name}?api-version={NETWORK_API_VERSION}");
                match self.get_json(&url).await {
                    Ok(raw) => {
                        let nic: NicResource = serde_json::from_value(raw).unwrap_or_default();
                        for ip_config in &nic.properties.ip_configurations {
                            if let Some(ip) = &ip_config.properties.private_ip_address {
                                return Some(ip.clone());
                            }
                        }
                    }
                    Err(e) => {
                        debug!(
                            vmss = %vmss_name,
                            instance = %instance_id,
                            nic = %nic_name,
                            error = %e,
                            "Could not fetch scale set NIC"
                        );
                    }
                }
            }
        }

        // Fallback: list all NICs of this scale set instance.
        let url = format!("{base}?api-version={NETWORK_API_VERSION}");
        match self.list_all(url).await {
            Ok(nics) => {
                for raw in nics {
                    let nic: NicResource = serde_json::from_value(raw).unwrap_or_default();
                    for ip_config in &nic.properties.ip_configurations {
                        if let Some(ip) = &ip_config.properties.private_ip_address {
                            return Some(ip.clone());
                        }
                    }
                }
                None
            }
            Err(e) => {
                debug!(
                    vmss = %vmss_name,
                    instance = %instance_id,
                    error = %e,
                    "Could not list NICs for scale set instance"
                );
                None
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Extract and parse the required service tags; returns `None` (with a
    /// warning for a bad port) when the resource is not service-tagged.
    fn service_tags(
        &self,
        tags: &HashMap<String, String>,
        resource_name: &str,
    ) -> Option<(String, u16)> {
        let service_name = match tags.get(&self.tags.service_name_tag) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => return None,
        };
        let port_str = tags.get(&self.tags.service_port_tag)?;
        match port_str.parse() {
            Ok(port) => Some((service_name, port)),
            Err(_) => {
                warn!(
                    resource = %resource_name,
                    value = %port_str,
                    "Resource has a non-integer service port tag, skipping"
                );
                None
            }
        }
    }

    fn parse_instance_port(&self, tags: &HashMap<String, String>) -> Option<u16> {
        tags.get(&self.tags.instance_port_tag)
            .and_then(|raw| raw.parse().ok())
    }
}

#[async_trait]
impl DiscoveryClient for AzureClient {
    fn provider(&self) -> &'static str {
        "azure"
    }

    async fn discover_all(&self) -> Result<Vec<DiscoveredInstance>, DiscoveryError> {
        let mut instances = self.discover_vms().await?;
        instances.extend(self.discover_vmss().await?);
        info!(total_instances = instances.len(), "Discovery complete");
        Ok(instances)
    }
}

fn is_power_running(view: &InstanceView) -> bool {
    view.statuses.iter().any(|status| {
        status
            .code
            .as_deref()
            .is_some_and(|code| code.eq_ignore_ascii_case("PowerState/running"))
    })
}

/// Extract the resource group name from an Azure resource id.
pub fn resource_group_from_id(resource_id: &str) -> String {
    let parts: Vec<&str> = resource_id.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if part.eq_ignore_ascii_case("resourcegroups") && i + 1 < parts.len() {
            return parts[i + 1].to_string();
        }
    }
    String::new()
}

/// Merge scale-set tags with instance tags; instance entries win per key.
pub fn merge_tags(
    base: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn last_id_segment(resource_id: &str) -> String {
    resource_id
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}
