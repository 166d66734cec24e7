// src/core/discovery/mod.rs

//! Cloud instance discovery: the provider capability trait, the concrete
//! Azure and AWS clients, tag filtering, and change detection.

pub mod aws;
pub mod azure;
pub mod change_detector;
pub mod tag_filter;

use crate::config::{Config, Provider};
use crate::core::errors::DiscoveryError;
use crate::core::models::DiscoveredInstance;
use async_trait::async_trait;

/// The capability every cloud provider implements: produce the current
/// snapshot of running, service-tagged instances.
///
/// Implementations must absorb per-instance lookup failures (log and skip)
/// and only return an error when the snapshot as a whole is meaningless,
/// e.g. on authentication failure or a full API outage.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Short provider tag used in logs ("azure" or "aws").
    fn provider(&self) -> &'static str;

    async fn discover_all(&self) -> Result<Vec<DiscoveredInstance>, DiscoveryError>;
}

/// Instantiate the discovery client selected by the validated configuration.
pub async fn build_client(config: &Config) -> Result<Box<dyn DiscoveryClient>, DiscoveryError> {
    match config.provider {
        Provider::Azure => {
            let azure_cfg = config.azure.clone().unwrap_or_default();
            Ok(Box::new(azure::AzureClient::new(
                azure_cfg,
                config.tags.clone(),
            )?))
        }
        Provider::Aws => {
            let aws_cfg = config.aws.clone().unwrap_or_default();
            Ok(Box::new(
                aws::AwsClient::new(aws_cfg, config.tags.clone()).await,
            ))
        }
    }
}
