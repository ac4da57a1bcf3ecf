//! Listener processor: per-listener config splitting and change detection
//!
//! Splits each dynamic document into one slice per listener (the listener's
//! routes plus the upstreams and plugin configs those routes reference),
//! hashes the slice, and publishes it on `routes_{listener}` only when the
//! hash changed. A listener that disappears from the document gets one empty
//! publish so its router drops its table.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::bus::{route_topic, EventBus};
use crate::config::{Dynamic, RouteConfig};
use crate::watcher::Processor;

pub struct ListenerProcessor {
    bus: Arc<EventBus<Dynamic>>,
    listener_hashes: HashMap<String, String>,
}

impl ListenerProcessor {
    pub fn new(bus: Arc<EventBus<Dynamic>>) -> Self {
        Self {
            bus,
            listener_hashes: HashMap::new(),
        }
    }

    fn build_listener_doc(doc: &Dynamic, routes: Vec<RouteConfig>) -> Dynamic {
        let upstream_by_name: HashMap<&str, usize> = doc
            .upstreams
            .iter()
            .enumerate()
            .map(|(i, u)| (u.name.as_str(), i))
            .collect();
        let plugin_by_name: HashMap<&str, usize> = doc
            .plugins
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.as_str(), i))
            .collect();

        let mut upstreams = Vec::new();
        let mut plugins = Vec::new();
        for route in &routes {
            if let Some(upstream_ref) = &route.upstream {
                if !upstream_ref.name.is_empty() {
                    if let Some(&i) = upstream_by_name.get(upstream_ref.name.as_str()) {
                        upstreams.push(doc.upstreams[i].clone());
                    }
                }
            }
            for plugin_ref in &route.plugins {
                if let Some(&i) = plugin_by_name.get(plugin_ref.name.as_str()) {
                    plugins.push(doc.plugins[i].clone());
                }
            }
        }

        Dynamic {
            routes,
            upstreams,
            plugins,
            stream_routes: Vec::new(),
        }
    }

    fn hash(doc: &Dynamic) -> Option<String> {
        match serde_json::to_vec(doc) {
            Ok(bytes) => Some(format!("{:x}", md5::compute(bytes))),
            Err(err) => {
                error!(error = %err, "Failed to serialize listener config for hashing");
                None
            }
        }
    }
}

impl Processor for ListenerProcessor {
    fn process(&mut self, doc: &Dynamic) {
        let mut listener_routes: HashMap<String, Vec<RouteConfig>> = HashMap::new();
        for route in &doc.routes {
            listener_routes
                .entry(route.listener.clone())
                .or_default()
                .push(route.clone());
        }

        for (listener, routes) in &listener_routes {
            let listener_doc = Self::build_listener_doc(doc, routes.clone());
            let Some(hash) = Self::hash(&listener_doc) else {
                continue;
            };
            if self.listener_hashes.get(listener) != Some(&hash) {
                self.bus.publish(&route_topic(listener), listener_doc);
                self.listener_hashes.insert(listener.clone(), hash);
                info!(listener = %listener, "Published updated config for listener");
            }
        }

        // Listeners absent from this document get an empty config once,
        // clearing their routing tables.
        let removed: Vec<String> = self
            .listener_hashes
            .keys()
            .filter(|name| !listener_routes.contains_key(*name))
            .cloned()
            .collect();
        for listener in removed {
            self.bus.publish(&route_topic(&listener), Dynamic::default());
            self.listener_hashes.remove(&listener);
            info!(listener = %listener, "Published empty config for removed listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatchConfig, NodeConfig, PluginConfig, UpstreamConfig};

    fn route(name: &str, listener: &str, upstream: &str, plugin: Option<&str>) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            listener: listener.to_string(),
            matches: vec![MatchConfig {
                path: Some(format!("/{name}")),
                ..Default::default()
            }],
            plugins: plugin
                .map(|p| {
                    vec![PluginConfig {
                        name: p.to_string(),
                        ..Default::default()
                    }]
                })
                .unwrap_or_default(),
            upstream: Some(UpstreamConfig {
                name: upstream.to_string(),
                ..Default::default()
            }),
        }
    }

    fn upstream(name: &str, url: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            nodes: vec![NodeConfig {
                url: url.to_string(),
                weight: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_splits_by_listener_and_resolves_references() {
        let bus = Arc::new(EventBus::new());
        let mut processor = ListenerProcessor::new(Arc::clone(&bus));
        let mut l1 = bus.subscribe(&route_topic("l1"));
        let mut l2 = bus.subscribe(&route_topic("l2"));

        let doc = Dynamic {
            routes: vec![
                route("r1", "l1", "u1", Some("p1")),
                route("r2", "l2", "u2", None),
            ],
            upstreams: vec![
                upstream("u1", "http://127.0.0.1:9001"),
                upstream("u2", "http://127.0.0.1:9002"),
            ],
            plugins: vec![PluginConfig {
                name: "p1".to_string(),
                plugin_type: "headers".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        processor.process(&doc);

        let for_l1 = l1.try_recv().unwrap();
        assert_eq!(for_l1.routes.len(), 1);
        assert_eq!(for_l1.routes[0].name, "r1");
        assert_eq!(for_l1.upstreams.len(), 1);
        assert_eq!(for_l1.upstreams[0].name, "u1");
        assert_eq!(for_l1.plugins.len(), 1);

        let for_l2 = l2.try_recv().unwrap();
        assert_eq!(for_l2.routes[0].name, "r2");
        assert_eq!(for_l2.upstreams[0].name, "u2");
        assert!(for_l2.plugins.is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_processing_publishes_once() {
        let bus = Arc::new(EventBus::new());
        let mut processor = ListenerProcessor::new(Arc::clone(&bus));
        let mut sub = bus.subscribe(&route_topic("l1"));

        let doc = Dynamic {
            routes: vec![route("r1", "l1", "u1", None)],
            upstreams: vec![upstream("u1", "http://127.0.0.1:9001")],
            ..Default::default()
        };
        processor.process(&doc);
        assert!(sub.try_recv().is_some());

        // The same document again: hash unchanged, zero events.
        processor.process(&doc);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unrelated_listener_change_does_not_republish() {
        let bus = Arc::new(EventBus::new());
        let mut processor = ListenerProcessor::new(Arc::clone(&bus));
        let mut l1 = bus.subscribe(&route_topic("l1"));

        let mut doc = Dynamic {
            routes: vec![
                route("r1", "l1", "u1", None),
                route("r2", "l2", "u2", None),
            ],
            upstreams: vec![
                upstream("u1", "http://127.0.0.1:9001"),
                upstream("u2", "http://127.0.0.1:9002"),
            ],
            ..Default::default()
        };
        processor.process(&doc);
        assert!(l1.try_recv().is_some());

        // Change only l2's slice.
        doc.upstreams[1] = upstream("u2", "http://127.0.0.1:9102");
        processor.process(&doc);
        assert!(l1.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_removed_listener_gets_empty_publish() {
        let bus = Arc::new(EventBus::new());
        let mut processor = ListenerProcessor::new(Arc::clone(&bus));
        let mut sub = bus.subscribe(&route_topic("l1"));

        let doc = Dynamic {
            routes: vec![route("r1", "l1", "u1", None)],
            upstreams: vec![upstream("u1", "http://127.0.0.1:9001")],
            ..Default::default()
        };
        processor.process(&doc);
        assert!(sub.try_recv().is_some());

        processor.process(&Dynamic::default());
        let cleared = sub.try_recv().unwrap();
        assert!(cleared.routes.is_empty());

        // Forgotten: publishing the original again is a fresh change.
        processor.process(&doc);
        assert!(sub.try_recv().is_some());
    }
}
