// src/config.rs

//! Manages daemon configuration: YAML loading, `${ENV_VAR}` interpolation,
//! and validation.

use anyhow::{Context, Result, anyhow};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use url::Url;

lazy_static! {
    static ref ENV_PATTERN: Regex = Regex::new(r"\$\{([^}]+)\}").unwrap();
}

/// Which cloud provider a validated configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Azure,
    Aws,
}

impl Provider {
    /// Short tag used in logs and as the default backend name prefix.
    pub fn tag(&self) -> &'static str {
        match self {
            Provider::Azure => "azure",
            Provider::Aws => "aws",
        }
    }
}

/// Azure-specific discovery settings.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct AzureConfig {
    #[serde(default)]
    pub subscription_id: String,
    /// Empty means all resource groups in the subscription.
    #[serde(default)]
    pub resource_groups: Vec<String>,
}

/// AWS-specific discovery settings.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct AwsConfig {
    #[serde(default)]
    pub region: String,
    /// Optional; used for identification in logs and as the instance namespace.
    #[serde(default)]
    pub account_id: String,
    /// Empty means the default credential chain.
    #[serde(default)]
    pub credential_profile: String,
}

/// Tag names and allow/deny filtering rules applied to discovered instances.
#[derive(Deserialize, Debug, Clone)]
pub struct TagsConfig {
    #[serde(default = "default_service_name_tag")]
    pub service_name_tag: String,
    #[serde(default = "default_service_port_tag")]
    pub service_port_tag: String,
    #[serde(default = "default_instance_port_tag")]
    pub instance_port_tag: String,
    /// An instance passes only if every entry matches (AND).
    #[serde(default)]
    pub allowlist: HashMap<String, String>,
    /// An instance is dropped if any entry matches (OR); evaluated first.
    #[serde(default)]
    pub denylist: HashMap<String, String>,
}

fn default_service_name_tag() -> String {
    "HAProxy:Service:Name".to_string()
}
fn default_service_port_tag() -> String {
    "HAProxy:Service:Port".to_string()
}
fn default_instance_port_tag() -> String {
    "HAProxy:Instance:Port".to_string()
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            service_name_tag: default_service_name_tag(),
            service_port_tag: default_service_port_tag(),
            instance_port_tag: default_instance_port_tag(),
            allowlist: HashMap::new(),
            denylist: HashMap::new(),
        }
    }
}

/// Dataplane API version; affects the shape of server endpoints.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    #[default]
    V2,
    V3,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersion::V2 => f.write_str("v2"),
            ApiVersion::V3 => f.write_str("v3"),
        }
    }
}

/// Load-balancing mode of created backends.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Http,
    Tcp,
}

/// Naming and defaults for backends created by the reconciler.
#[derive(Deserialize, Debug, Clone)]
pub struct BackendConfig {
    /// Defaults to the active provider tag (`azure`/`aws`) when unset.
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default = "default_name_separator")]
    pub name_separator: String,
    #[serde(default = "default_balance")]
    pub balance: String,
    #[serde(default)]
    pub mode: BackendMode,
}

fn default_name_separator() -> String {
    "-".to_string()
}
fn default_balance() -> String {
    "roundrobin".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name_prefix: None,
            name_separator: default_name_separator(),
            balance: default_balance(),
            mode: BackendMode::default(),
        }
    }
}

/// How the slot count grows once the active instance count exceeds the base.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GrowthType {
    #[default]
    Linear,
    Exponential,
}

/// Server slot sizing for backends.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerSlotsConfig {
    #[serde(default = "default_slot_base")]
    pub base: usize,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default)]
    pub growth_type: GrowthType,
}

fn default_slot_base() -> usize {
    10
}
fn default_growth_factor() -> f64 {
    1.5
}

impl Default for ServerSlotsConfig {
    fn default() -> Self {
        Self {
            base: default_slot_base(),
            growth_factor: default_growth_factor(),
            growth_type: GrowthType::default(),
        }
    }
}

/// Connection and behavior settings for the HAProxy Dataplane API.
#[derive(Deserialize, Debug, Clone)]
pub struct HaproxyConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_version: ApiVersion,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    /// The availability zone the load balancer itself runs in. Enables
    /// AZ-aware server weighting when set.
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default = "default_az_weight_tag")]
    pub az_weight_tag: String,
    /// Extra fields merged into backend creation payloads, keyed by service
    /// name.
    #[serde(default)]
    pub backend_options: HashMap<String, serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub server_slots: ServerSlotsConfig,
}

fn default_base_url() -> String {
    "http://localhost:5555".to_string()
}
fn default_username() -> String {
    "admin".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_verify_ssl() -> bool {
    true
}
fn default_az_weight_tag() -> String {
    "HAProxy:Instance:AZperc".to_string()
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: ApiVersion::default(),
            username: default_username(),
            password: String::new(),
            timeout: default_timeout(),
            verify_ssl: default_verify_ssl(),
            availability_zone: None,
            az_weight_tag: default_az_weight_tag(),
            backend_options: HashMap::new(),
            backend: BackendConfig::default(),
            server_slots: ServerSlotsConfig::default(),
        }
    }
}

/// Polling cadence and failure backoff.
#[derive(Deserialize, Debug, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_jitter_seconds")]
    pub jitter_seconds: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    30
}
fn default_jitter_seconds() -> u64 {
    5
}
fn default_max_backoff_seconds() -> u64 {
    300
}
fn default_backoff_base_seconds() -> u64 {
    5
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            jitter_seconds: default_jitter_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
            backoff_base_seconds: default_backoff_base_seconds(),
        }
    }
}

/// Output format for structured logs.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8787
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    azure: Option<AzureConfig>,
    #[serde(default)]
    aws: Option<AwsConfig>,
    #[serde(default)]
    tags: TagsConfig,
    #[serde(default)]
    haproxy: HaproxyConfig,
    #[serde(default)]
    polling: PollingConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

/// Represents the final, validated, and resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: Provider,
    pub azure: Option<AzureConfig>,
    pub aws: Option<AwsConfig>,
    pub tags: TagsConfig,
    pub haproxy: HaproxyConfig,
    pub polling: PollingConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Creates a new `Config` by reading and parsing a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Parses, interpolates, and validates configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(contents).context("Failed to parse YAML")?;
        interpolate_env(&mut value)?;
        let raw: RawConfig =
            serde_yaml::from_value(value).context("Invalid configuration structure")?;

        let has_azure = raw
            .azure
            .as_ref()
            .is_some_and(|a| !a.subscription_id.is_empty());
        let has_aws = raw.aws.as_ref().is_some_and(|a| !a.region.is_empty());
        let provider = match (has_azure, has_aws) {
            (true, true) => {
                return Err(anyhow!(
                    "Both 'azure' and 'aws' sections are configured; only one cloud provider may be active at a time"
                ));
            }
            (true, false) => Provider::Azure,
            (false, true) => Provider::Aws,
            (false, false) => {
                return Err(anyhow!(
                    "No cloud provider configured. Add an 'azure' section (with subscription_id) or an 'aws' section (with region)."
                ));
            }
        };

        let mut haproxy = raw.haproxy;
        if haproxy.backend.name_prefix.is_none() {
            haproxy.backend.name_prefix = Some(provider.tag().to_string());
        }

        let config = Config {
            provider,
            azure: raw.azure,
            aws: raw.aws,
            tags: raw.tags,
            haproxy,
            polling: raw.polling,
            logging: raw.logging,
            metrics: raw.metrics,
        };
        config.validate()?;
        Ok(config)
    }

    /// The resolved backend name prefix (always present after load).
    pub fn backend_name_prefix(&self) -> &str {
        self.haproxy
            .backend
            .name_prefix
            .as_deref()
            .unwrap_or_else(|| self.provider.tag())
    }

    /// Validates the resolved configuration for logical consistency.
    fn validate(&self) -> Result<()> {
        Url::parse(&self.haproxy.base_url)
            .with_context(|| format!("haproxy.base_url '{}' is not a valid URL", self.haproxy.base_url))?;

        if self.haproxy.timeout == 0 {
            return Err(anyhow!("haproxy.timeout cannot be 0"));
        }
        if self.haproxy.server_slots.base < 10 {
            return Err(anyhow!("haproxy.server_slots.base must be >= 10"));
        }
        if self.haproxy.server_slots.growth_factor <= 0.0 {
            return Err(anyhow!("haproxy.server_slots.growth_factor must be positive"));
        }
        if self.haproxy.server_slots.growth_type == GrowthType::Exponential
            && self.haproxy.server_slots.growth_factor <= 1.0
        {
            return Err(anyhow!(
                "haproxy.server_slots.growth_factor must be > 1 for exponential growth"
            ));
        }
        if self.polling.interval_seconds < 5 {
            return Err(anyhow!("polling.interval_seconds must be >= 5"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }
}

/// Recursively replace `${ENV_VAR}` placeholders in all string scalars.
fn interpolate_env(value: &mut serde_yaml::Value) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = interpolate_str(s)?;
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                interpolate_env(v)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                interpolate_env(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn interpolate_str(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in ENV_PATTERN.captures_iter(s) {
        let whole = caps.get(0).expect("capture group 0 always exists");
        let key = &caps[1];
        let val = std::env::var(key).map_err(|_| {
            anyhow!("Environment variable '{key}' is not set (referenced in configuration)")
        })?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(&val);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}
