// tests/property/filter_test.rs

use haproxy_cloud_discovery::config::TagsConfig;
use haproxy_cloud_discovery::core::discovery::tag_filter::TagFilter;
use haproxy_cloud_discovery::core::models::{DiscoveredInstance, InstanceSource};
use proptest::prelude::*;
use std::collections::HashMap;

fn inst(tags: HashMap<String, String>) -> DiscoveredInstance {
    DiscoveredInstance {
        instance_id: "id1".to_string(),
        name: "vm-id1".to_string(),
        private_ip: "10.0.0.1".to_string(),
        service_name: "app".to_string(),
        service_port: 80,
        instance_port: None,
        region: "eastus".to_string(),
        availability_zone: None,
        namespace: "rg1".to_string(),
        source: InstanceSource::Vm,
        tags,
        public_ip: None,
        created_at: None,
        power_state: "running".to_string(),
    }
}

fn filter(allow: HashMap<String, String>, deny: HashMap<String, String>) -> TagFilter {
    TagFilter::new(&TagsConfig {
        allowlist: allow,
        denylist: deny,
        ..TagsConfig::default()
    })
}

fn tag_map() -> impl Strategy<Value = HashMap<String, String>> {
    proptest::collection::hash_map("[a-c]{1,2}", "[x-z]{1,2}", 0..4)
}

proptest! {
    /// Empty allow and deny lists pass every instance.
    #[test]
    fn empty_filter_passes_everything(tags in tag_map()) {
        let f = filter(HashMap::new(), HashMap::new());
        prop_assert_eq!(f.apply(vec![inst(tags)]).len(), 1);
    }

    /// Allowlist is an AND: an instance passes iff every entry is present
    /// with the configured value.
    #[test]
    fn allowlist_is_conjunctive(allow in tag_map(), tags in tag_map()) {
        let f = filter(allow.clone(), HashMap::new());
        let expected = allow.iter().all(|(k, v)| tags.get(k) == Some(v));
        prop_assert_eq!(f.apply(vec![inst(tags)]).len() == 1, expected);
    }

    /// Denylist is an OR: any matching entry drops the instance.
    #[test]
    fn denylist_is_disjunctive(deny in tag_map(), tags in tag_map()) {
        let f = filter(HashMap::new(), deny.clone());
        let dropped = deny.iter().any(|(k, v)| tags.get(k) == Some(v));
        prop_assert_eq!(f.apply(vec![inst(tags)]).is_empty(), dropped);
    }

    /// A denylist hit always wins, even when the allowlist fully matches.
    #[test]
    fn denylist_dominates(tags in tag_map()) {
        prop_assume!(!tags.is_empty());
        // Allowlist identical to the instance tags: a guaranteed match.
        let allow = tags.clone();
        // Deny on one of the instance's own entries.
        let (k, v) = tags.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
        let deny = HashMap::from([(k, v)]);
        let f = filter(allow, deny);
        prop_assert!(f.apply(vec![inst(tags)]).is_empty());
    }
}
