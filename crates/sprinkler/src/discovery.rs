//! Service-discovery and depot abstractions.
//!
//! The engine only ever needs two things from the outside world that this
//! repo doesn't implement itself: "for each known provider of service S,
//! call this closure with its base URL" and a tiny publish/subscribe
//! key-value store. Both are modeled as traits so the engine can run (and
//! be tested) against a fixed provider list and a no-op depot, with a real
//! `housediscover`/`housedepositor`-equivalent client plugged in later
//! without touching engine logic.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait ServiceDiscovery: Send + Sync {
    /// Invoke `f` once per known provider URL of `service`.
    fn for_each_provider(&self, service: &str, f: &mut dyn FnMut(&str));

    /// True the first time this is called after the provider list for
    /// `service` changed; false otherwise. Lets pollers skip a full
    /// re-discovery pass when nothing moved.
    fn changed_since_last_check(&self, service: &str) -> bool;
}

pub type DepotSink = Box<dyn Fn(&[u8]) + Send + Sync>;

pub trait DepotClient: Send + Sync {
    fn put(&self, topic: &str, name: &str, bytes: &[u8]);
    fn subscribe(&self, topic: &str, name: &str, sink: DepotSink);
}

/// A fixed, manually-populated provider list. The shape used by tests and
/// by the simplest single-control-server deployments.
#[derive(Default)]
pub struct StaticDiscovery {
    providers: Mutex<HashMap<String, Vec<String>>>,
    changed: Mutex<HashMap<String, bool>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_providers(&self, service: &str, urls: Vec<String>) {
        self.providers
            .lock()
            .unwrap()
            .insert(service.to_string(), urls);
        self.changed
            .lock()
            .unwrap()
            .insert(service.to_string(), true);
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn for_each_provider(&self, service: &str, f: &mut dyn FnMut(&str)) {
        if let Some(urls) = self.providers.lock().unwrap().get(service) {
            for u in urls {
                f(u);
            }
        }
    }

    fn changed_since_last_check(&self, service: &str) -> bool {
        let mut changed = self.changed.lock().unwrap();
        changed.insert(service.to_string(), false).unwrap_or(false)
    }
}

/// No discovered providers, no depot replication. Used when the engine is
/// run standalone with a fully file-backed configuration and no peers.
#[derive(Default)]
pub struct NullDepot;

impl NullDepot {
    pub fn new() -> Self {
        Self
    }
}

impl DepotClient for NullDepot {
    fn put(&self, _topic: &str, _name: &str, _bytes: &[u8]) {}
    fn subscribe(&self, _topic: &str, _name: &str, _sink: DepotSink) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_discovery_iterates_configured_providers() {
        let d = StaticDiscovery::new();
        d.set_providers("control", vec!["http://a".into(), "http://b".into()]);
        let mut seen = Vec::new();
        d.for_each_provider("control", &mut |u| seen.push(u.to_string()));
        assert_eq!(seen, vec!["http://a", "http://b"]);
    }

    #[test]
    fn static_discovery_changed_flag_self_clears() {
        let d = StaticDiscovery::new();
        d.set_providers("control", vec!["http://a".into()]);
        assert!(d.changed_since_last_check("control"));
        assert!(!d.changed_since_last_check("control"));
    }

    #[test]
    fn unknown_service_yields_no_providers() {
        let d = StaticDiscovery::new();
        let mut count = 0;
        d.for_each_provider("nope", &mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn null_depot_put_and_subscribe_are_no_ops() {
        let depot = NullDepot::new();
        depot.put("state", "sprinkler.json", b"{}");
        depot.subscribe("state", "sprinkler.json", Box::new(|_| panic!("never called")));
    }
}
