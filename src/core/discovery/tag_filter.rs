// src/core/discovery/tag_filter.rs

//! Tag-based allowlist / denylist filtering for discovered instances.

use crate::config::TagsConfig;
use crate::core::models::DiscoveredInstance;
use std::collections::HashMap;
use tracing::{debug, info};

/// Filters instances based on a tag allowlist (AND) and denylist (OR).
/// The denylist is evaluated first; a denylist hit overrides any allowlist
/// match.
#[derive(Debug, Clone)]
pub struct TagFilter {
    allowlist: HashMap<String, String>,
    denylist: HashMap<String, String>,
}

impl TagFilter {
    pub fn new(tags_config: &TagsConfig) -> Self {
        Self {
            allowlist: tags_config.allowlist.clone(),
            denylist: tags_config.denylist.clone(),
        }
    }

    pub fn apply(&self, instances: Vec<DiscoveredInstance>) -> Vec<DiscoveredInstance> {
        let before = instances.len();
        let result: Vec<DiscoveredInstance> = instances
            .into_iter()
            .filter(|inst| self.matches(inst))
            .collect();
        let filtered = before - result.len();
        if filtered > 0 {
            info!(filtered, total = before, "Tag filter removed instances");
        }
        result
    }

    fn matches(&self, instance: &DiscoveredInstance) -> bool {
        for (key, value) in &self.denylist {
            if instance.tags.get(key) == Some(value) {
                debug!(
                    instance = %instance.name,
                    tag = %key,
                    value = %value,
                    "Instance denied by tag"
                );
                return false;
            }
        }

        for (key, value) in &self.allowlist {
            if instance.tags.get(key) != Some(value) {
                debug!(
                    instance = %instance.name,
                    tag = %key,
                    value = %value,
                    "Instance does not match allowlist tag"
                );
                return false;
            }
        }

        true
    }
}
