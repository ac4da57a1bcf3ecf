//! Plugin trait, chain, and registry
//!
//! A plugin sees the request phase before the upstream round trip and may
//! finish the response early; for the response phase it wraps the response
//! sink, layering interceptors around the base writer. Plugins are shared by
//! every in-flight request on their route and must tolerate concurrent calls.

pub mod headers;
pub mod response_cache;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::http::request::Parts;

use crate::config::OptionsMap;
use crate::sink::ResponseSink;

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Request phase. Returning `Ok(true)` means the plugin wrote the
    /// response itself and no later plugin or upstream call runs. An error
    /// aborts the chain and the request fails with a 500-class status.
    async fn handle_request(
        &self,
        req: &mut Parts,
        sink: &mut dyn ResponseSink,
    ) -> anyhow::Result<bool>;

    /// Response phase. Returns a sink wrapping `inner`; writes from the
    /// upstream round trip pass through every wrapper on their way out.
    fn handle_response(&self, req: &Parts, inner: Box<dyn ResponseSink>) -> Box<dyn ResponseSink>;

    /// Chain position; lower priorities run earlier in the request phase.
    fn priority(&self) -> i32;

    fn config(&self) -> OptionsMap;

    /// Validate the options mapping and initialize plugin state. Called once,
    /// before the plugin is shared with request paths.
    fn validate_and_set_config(&mut self, config: OptionsMap) -> anyhow::Result<()>;

    /// Release per-plugin resources. Called when the owning routing-table
    /// generation is replaced.
    fn destroy(&self);
}

pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// Process-wide mapping of plugin type to factory. The set is closed: only
/// built-in types exist, registered at construction.
pub struct Registry {
    factories: HashMap<&'static str, PluginFactory>,
}

impl Registry {
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, PluginFactory> = HashMap::new();
        factories.insert("headers", || Box::new(headers::HeaderMutator::new()));
        factories.insert("responsecache", || {
            Box::new(response_cache::ResponseCache::new())
        });
        Self { factories }
    }

    pub fn get(&self, plugin_type: &str) -> Option<PluginFactory> {
        self.factories.get(plugin_type).copied()
    }
}

/// Ordered collection of the plugins attached to one route.
#[derive(Default)]
pub struct Chain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Order ascending by priority. The sort is stable: ties keep insertion
    /// order.
    pub fn sort(&mut self) {
        self.plugins.sort_by_key(|p| p.priority());
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run the request phase in chain order. The first error aborts; the
    /// first `final` short-circuits successfully.
    pub async fn handle_request(
        &self,
        req: &mut Parts,
        sink: &mut dyn ResponseSink,
    ) -> anyhow::Result<bool> {
        for plugin in &self.plugins {
            if plugin.handle_request(req, sink).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Wrap the sink for the response phase. Wrapping happens in reverse
    /// chain order, so the response passes through plugins in the same order
    /// the request phase ran them.
    pub fn handle_response(&self, req: &Parts, sink: Box<dyn ResponseSink>) -> Box<dyn ResponseSink> {
        let mut wrapped = sink;
        for plugin in self.plugins.iter().rev() {
            wrapped = plugin.handle_response(req, wrapped);
        }
        wrapped
    }

    pub fn destroy(&self) {
        for plugin in &self.plugins {
            plugin.destroy();
        }
    }
}

#[cfg(test)]
pub(crate) fn test_request_parts(method: &str, uri: &str) -> Parts {
    let (parts, ()) = hyper::Request::builder()
        .method(method)
        .uri(uri)
        .body(())
        .unwrap()
        .into_parts();
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ServerSink;
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test plugin that records the order it ran in and can early-exit or
    /// fail on demand.
    struct Probe {
        priority: i32,
        tag: &'static str,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        final_response: bool,
        fail: bool,
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Probe {
        async fn handle_request(
            &self,
            _req: &mut Parts,
            sink: &mut dyn ResponseSink,
        ) -> anyhow::Result<bool> {
            self.log.lock().push(self.tag);
            if self.fail {
                anyhow::bail!("probe failure");
            }
            if self.final_response {
                sink.write_header(StatusCode::OK).await;
                return Ok(true);
            }
            Ok(false)
        }

        fn handle_response(&self, _req: &Parts, inner: Box<dyn ResponseSink>) -> Box<dyn ResponseSink> {
            inner
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn config(&self) -> OptionsMap {
            OptionsMap::new()
        }

        fn validate_and_set_config(&mut self, _config: OptionsMap) -> anyhow::Result<()> {
            Ok(())
        }

        fn destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe(
        priority: i32,
        tag: &'static str,
        log: &Arc<parking_lot::Mutex<Vec<&'static str>>>,
    ) -> Probe {
        Probe {
            priority,
            tag,
            log: Arc::clone(log),
            final_response: false,
            fail: false,
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[tokio::test]
    async fn test_request_phase_runs_in_priority_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(Arc::new(probe(200, "late", &log)));
        chain.add(Arc::new(probe(100, "first", &log)));
        chain.add(Arc::new(probe(100, "second", &log)));
        chain.sort();

        let mut req = test_request_parts("GET", "/x");
        let (mut sink, _head_rx, _body_rx) = ServerSink::channel(None);
        let done = chain.handle_request(&mut req, &mut sink).await.unwrap();
        assert!(!done);
        // Stable sort: ties keep insertion order.
        assert_eq!(*log.lock(), ["first", "second", "late"]);
    }

    #[tokio::test]
    async fn test_final_plugin_short_circuits() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(Arc::new(probe(1, "ran", &log)));
        let mut early = probe(2, "final", &log);
        early.final_response = true;
        chain.add(Arc::new(early));
        chain.add(Arc::new(probe(3, "skipped", &log)));
        chain.sort();

        let mut req = test_request_parts("GET", "/x");
        let (mut sink, head_rx, _body_rx) = ServerSink::channel(None);
        let done = chain.handle_request(&mut req, &mut sink).await.unwrap();
        assert!(done);
        assert_eq!(*log.lock(), ["ran", "final"]);
        assert_eq!(head_rx.await.unwrap().status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_plugin_error_aborts_chain() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        let mut failing = probe(1, "fail", &log);
        failing.fail = true;
        chain.add(Arc::new(failing));
        chain.add(Arc::new(probe(2, "skipped", &log)));
        chain.sort();

        let mut req = test_request_parts("GET", "/x");
        let (mut sink, _head_rx, _body_rx) = ServerSink::channel(None);
        let err = chain.handle_request(&mut req, &mut sink).await.unwrap_err();
        assert!(err.to_string().contains("probe failure"));
        assert_eq!(*log.lock(), ["fail"]);
    }

    #[test]
    fn test_destroy_reaches_every_plugin() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut chain = Chain::new();
        for _ in 0..3 {
            let mut p = probe(100, "p", &log);
            p.destroyed = Arc::clone(&destroyed);
            chain.add(Arc::new(p));
        }
        chain.destroy();
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_registry_is_closed_set() {
        let registry = Registry::builtin();
        assert!(registry.get("headers").is_some());
        assert!(registry.get("responsecache").is_some());
        assert!(registry.get("bespoke").is_none());
    }
}
