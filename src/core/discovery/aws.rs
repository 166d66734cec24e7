// src/core/discovery/aws.rs

//! EC2 and Auto Scaling Group discovery through the AWS SDK.

use super::DiscoveryClient;
use crate::config::{AwsConfig, TagsConfig};
use crate::core::errors::DiscoveryError;
use crate::core::models::{DiscoveredInstance, InstanceSource};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::types::{Filter as Ec2Filter, Instance as Ec2Instance};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// `DescribeInstances` accepts at most this many explicit instance ids.
const DESCRIBE_INSTANCES_BATCH: usize = 100;

/// Discovers EC2 instances and ASG members tagged for HAProxy service
/// discovery.
pub struct AwsClient {
    ec2: aws_sdk_ec2::Client,
    autoscaling: aws_sdk_autoscaling::Client,
    config: AwsConfig,
    tags: TagsConfig,
}

impl AwsClient {
    pub async fn new(aws_config: AwsConfig, tags: TagsConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(aws_config.region.clone()));
        if !aws_config.credential_profile.is_empty() {
            loader = loader.profile_name(&aws_config.credential_profile);
        }
        let sdk_config = loader.load().await;

        Self {
            ec2: aws_sdk_ec2::Client::new(&sdk_config),
            autoscaling: aws_sdk_autoscaling::Client::new(&sdk_config),
            config: aws_config,
            tags,
        }
    }

    /// Enumerate EC2 instances carrying the service name tag.
    async fn discover_ec2(&self) -> Result<Vec<DiscoveredInstance>, DiscoveryError> {
        let mut instances = Vec::new();

        let mut pages = self
            .ec2
            .describe_instances()
            .filters(
                Ec2Filter::builder()
                    .name("tag-key")
                    .values(&self.tags.service_name_tag)
                    .build(),
            )
            .filters(
                Ec2Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                DiscoveryError::Cloud(format!(
                    "describe_instances failed: {}",
                    aws_sdk_ec2::error::DisplayErrorContext(e)
                ))
            })?;
            for reservation in page.reservations() {
                let namespace = self.namespace(reservation.owner_id());
                for raw in reservation.instances() {
                    if let Some(inst) = parse_ec2_instance(
                        raw,
                        InstanceSource::Ec2,
                        &self.tags,
                        &self.config.region,
                        &namespace,
                    ) {
                        instances.push(inst);
                    }
                }
            }
        }

        info!(instances = instances.len(), "EC2 discovery complete");
        Ok(instances)
    }

    /// Enumerate instances that belong to Auto Scaling Groups carrying the
    /// service name tag.
    ///
    /// Instances already discovered through EC2 (`known_ids`) are skipped so
    /// that an instance reachable through both paths appears exactly once.
    async fn discover_asg(
        &self,
        known_ids: &HashSet<String>,
    ) -> Result<Vec<DiscoveredInstance>, DiscoveryError> {
        let mut asg_instance_ids: Vec<String> = Vec::new();

        let mut pages = self
            .autoscaling
            .describe_auto_scaling_groups()
            .filters(
                aws_sdk_autoscaling::types::Filter::builder()
                    .name("tag-key")
                    .values(&self.tags.service_name_tag)
                    .build(),
            )
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                DiscoveryError::Cloud(format!(
                    "describe_auto_scaling_groups failed: {}",
                    aws_sdk_autoscaling::error::DisplayErrorContext(e)
                ))
            })?;
            for group in page.auto_scaling_groups() {
                for member in group.instances() {
                    let Some(id) = member.instance_id() else {
                        continue;
                    };
                    if !known_ids.contains(id) && !asg_instance_ids.iter().any(|x| x == id) {
                        asg_instance_ids.push(id.to_string());
                    }
                }
            }
        }

        if asg_instance_ids.is_empty() {
            info!(instances = 0, "ASG discovery complete");
            return Ok(Vec::new());
        }

        // Resolve IPs and tags through EC2, batched to the API limit.
        let mut instances = Vec::new();
        for chunk in asg_instance_ids.chunks(DESCRIBE_INSTANCES_BATCH) {
            let resp = self
                .ec2
                .describe_instances()
                .set_instance_ids(Some(chunk.to_vec()))
                .filters(
                    Ec2Filter::builder()
                        .name("instance-state-name")
                        .values("running")
                        .build(),
                )
                .send()
                .await
                .map_err(|e| {
                    DiscoveryError::Cloud(format!(
                        "describe_instances for ASG members failed: {}",
                        aws_sdk_ec2::error::DisplayErrorContext(e)
                    ))
                })?;
            for reservation in resp.reservations() {
                let namespace = self.namespace(reservation.owner_id());
                for raw in reservation.instances() {
                    if let Some(inst) = parse_ec2_instance(
                        raw,
                        InstanceSource::Asg,
                        &self.tags,
                        &self.config.region,
                        &namespace,
                    ) {
                        instances.push(inst);
                    }
                }
            }
        }

        info!(instances = instances.len(), "ASG discovery complete");
        Ok(instances)
    }

    fn namespace(&self, owner_id: Option<&str>) -> String {
        if !self.config.account_id.is_empty() {
            self.config.account_id.clone()
        } else {
            owner_id.unwrap_or_default().to_string()
        }
    }
}

#[async_trait]
impl DiscoveryClient for AwsClient {
    fn provider(&self) -> &'static str {
        "aws"
    }

    async fn discover_all(&self) -> Result<Vec<DiscoveredInstance>, DiscoveryError> {
        let mut instances = self.discover_ec2().await?;
        let known_ids: HashSet<String> =
            instances.iter().map(|i| i.instance_id.clone()).collect();
        instances.extend(self.discover_asg(&known_ids).await?);
        info!(total_instances = instances.len(), "Discovery complete");
        Ok(instances)
    }
}

/// Parse a raw EC2 instance into a [`DiscoveredInstance`].
///
/// Returns `None` when required tags are missing, the port tag does not
/// parse, or no private IP is present.
pub fn parse_ec2_instance(
    raw: &Ec2Instance,
    source: InstanceSource,
    tags_cfg: &TagsConfig,
    fallback_region: &str,
    namespace: &str,
) -> Option<DiscoveredInstance> {
    let instance_id = raw.instance_id()?.to_string();

    let tag_map: HashMap<String, String> = raw
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect();

    let service_name = match tag_map.get(&tags_cfg.service_name_tag) {
        Some(name) if !name.is_empty() => name.clone(),
        _ => return None,
    };
    let service_port_str = tag_map.get(&tags_cfg.service_port_tag)?;
    let service_port: u16 = match service_port_str.parse() {
        Ok(port) => port,
        Err(_) => {
            warn!(
                instance = %instance_id,
                value = %service_port_str,
                "EC2 instance has a non-integer service port tag, skipping"
            );
            return None;
        }
    };

    let private_ip = match raw.private_ip_address() {
        Some(ip) if !ip.is_empty() => ip.to_string(),
        _ => {
            warn!(instance = %instance_id, "EC2 instance has no private IP, skipping");
            return None;
        }
    };

    let instance_port: Option<u16> = tag_map
        .get(&tags_cfg.instance_port_tag)
        .and_then(|raw| raw.parse().ok());

    // Full AZ name, e.g. "us-east-1a"; the region is the AZ minus its
    // trailing letter.
    let availability_zone = raw
        .placement()
        .and_then(|p| p.availability_zone())
        .filter(|az| !az.is_empty())
        .map(str::to_string);
    let region = availability_zone
        .as_deref()
        .map(region_from_az)
        .unwrap_or_else(|| fallback_region.to_string());

    let created_at: Option<DateTime<Utc>> = raw
        .launch_time()
        .and_then(|t| t.to_millis().ok())
        .and_then(DateTime::from_timestamp_millis);

    let name = tag_map
        .get("Name")
        .cloned()
        .unwrap_or_else(|| instance_id.clone());

    Some(DiscoveredInstance {
        instance_id,
        name,
        private_ip,
        service_name,
        service_port,
        instance_port,
        region,
        availability_zone,
        namespace: namespace.to_string(),
        source,
        public_ip: raw.public_ip_address().map(str::to_string),
        created_at,
        power_state: "running".to_string(),
        tags: tag_map,
    })
}

/// Strip the trailing zone letter from an AZ name: `us-east-1a` -> `us-east-1`.
pub fn region_from_az(az: &str) -> String {
    match az.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => az[..az.len() - 1].to_string(),
        _ => az.to_string(),
    }
}
