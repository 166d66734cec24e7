// src/core/models.rs

//! Data models for discovered cloud instances and their per-service grouping.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Identifies one HAProxy backend: `(service_name, service_port, region)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub service_name: String,
    pub service_port: u16,
    pub region: String,
}

impl ServiceKey {
    /// The HAProxy backend name for this key, e.g. `azure-myapp-8080-eastus`.
    pub fn backend_name(&self, prefix: &str, separator: &str) -> String {
        format!(
            "{prefix}{separator}{}{separator}{}{separator}{}",
            self.service_name, self.service_port, self.region
        )
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.service_name, self.service_port, self.region)
    }
}

/// Which discovery path produced an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceSource {
    Vm,
    Vmss,
    Ec2,
    Asg,
}

impl fmt::Display for InstanceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            InstanceSource::Vm => "vm",
            InstanceSource::Vmss => "vmss",
            InstanceSource::Ec2 => "ec2",
            InstanceSource::Asg => "asg",
        };
        f.write_str(tag)
    }
}

/// A single VM-like compute instance discovered from a cloud provider.
///
/// Discovery only emits instances that are running, carry a non-empty private
/// IP, and have parseable service name/port tags; downstream code treats
/// these fields as fully populated.
#[derive(Debug, Clone)]
pub struct DiscoveredInstance {
    pub instance_id: String,
    pub name: String,
    pub private_ip: String,
    pub service_name: String,
    pub service_port: u16,
    /// Optional per-instance override for the backend port.
    pub instance_port: Option<u16>,
    pub region: String,
    /// Provider-native zone: `"1"`/`"2"`/`"3"` for Azure, `"us-east-1a"` for AWS.
    pub availability_zone: Option<String>,
    /// Resource group (Azure) or account id (AWS); informational.
    pub namespace: String,
    pub source: InstanceSource,
    pub tags: HashMap<String, String>,
    pub public_ip: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub power_state: String,
}

impl DiscoveredInstance {
    /// The port used for the HAProxy server entry (`instance_port` overrides
    /// `service_port`).
    pub fn effective_port(&self) -> u16 {
        self.instance_port.unwrap_or(self.service_port)
    }

    /// Grouping key: `(service_name, service_port, region)`.
    pub fn backend_key(&self) -> ServiceKey {
        ServiceKey {
            service_name: self.service_name.clone(),
            service_port: self.service_port,
            region: self.region.clone(),
        }
    }
}

/// A group of instances that form one HAProxy backend. Rebuilt every cycle.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub service_name: String,
    pub service_port: u16,
    pub region: String,
    pub instances: Vec<DiscoveredInstance>,
}

impl DiscoveredService {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            service_name: self.service_name.clone(),
            service_port: self.service_port,
            region: self.region.clone(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.instances.len()
    }

    /// The HAProxy backend name, e.g. `azure-myapp-8080-eastus` or
    /// `aws-myapp-80-us-east-2`.
    pub fn backend_name(&self, prefix: &str, separator: &str) -> String {
        self.key().backend_name(prefix, separator)
    }
}

/// Group discovered instances into services by `(name, port, region)`.
/// Instance order within a service is not meaningful; the reconciler imposes
/// its own ordering.
pub fn group_instances(
    instances: Vec<DiscoveredInstance>,
) -> HashMap<ServiceKey, DiscoveredService> {
    let mut services: HashMap<ServiceKey, DiscoveredService> = HashMap::new();
    for inst in instances {
        let key = inst.backend_key();
        services
            .entry(key)
            .or_insert_with(|| DiscoveredService {
                service_name: inst.service_name.clone(),
                service_port: inst.service_port,
                region: inst.region.clone(),
                instances: Vec::new(),
            })
            .instances
            .push(inst);
    }
    services
}
