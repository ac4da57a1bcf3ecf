//! Per-listener HTTP router
//!
//! Holds the current routing-table generation behind an atomic swap. Every
//! dispatch works against the table it loaded: a reload builds a complete
//! replacement table, swaps it in, and destroys the previous generation's
//! plugin chains, so no in-flight request ever observes a half-updated table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::config::Dynamic;
use crate::error::{error_response, write_error, ProxyErrorCode};
use crate::matcher::{HeaderMatcher, MethodMatcher, PathMatcher};
use crate::plugin::{Chain, Registry};
use crate::proxy::{is_websocket_upgrade, ReverseProxy};
use crate::sink::{response_from_head, ProxyBody, ResponseSink, ServerSink};
use crate::task::spawn_guarded;
use crate::upstream::{Upstream, UpstreamFactory};

/// A compiled route: its plugin chain and upstream binding. Matching state
/// lives in the table's matchers.
pub struct Route {
    pub name: String,
    pub plugins: Arc<Chain>,
    pub upstream: Arc<Upstream>,
}

/// One generation of routing state.
pub struct RoutingTable {
    path: PathMatcher,
    method: MethodMatcher,
    header: HeaderMatcher,
    chains: Vec<Arc<Chain>>,
}

impl RoutingTable {
    fn empty() -> Self {
        Self {
            path: PathMatcher::new(),
            method: MethodMatcher::new(),
            header: HeaderMatcher::new(),
            chains: Vec::new(),
        }
    }
}

pub struct HttpRouter {
    listener: String,
    table: ArcSwap<RoutingTable>,
    upstream_factory: Arc<UpstreamFactory>,
    registry: Arc<Registry>,
    proxy: Arc<ReverseProxy>,
}

impl HttpRouter {
    pub fn new(
        listener: impl Into<String>,
        upstream_factory: Arc<UpstreamFactory>,
        registry: Arc<Registry>,
        proxy: Arc<ReverseProxy>,
    ) -> Self {
        Self {
            listener: listener.into(),
            table: ArcSwap::from_pointee(RoutingTable::empty()),
            upstream_factory,
            registry,
            proxy,
        }
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    /// Build a fresh routing table from a per-listener document and swap it
    /// in. On error the previous table stays active. The replaced
    /// generation's plugin chains are destroyed after the swap.
    pub fn update_routes(&self, doc: &Dynamic) -> anyhow::Result<()> {
        let mut table = RoutingTable::empty();

        let upstream_by_name: HashMap<&str, &crate::config::UpstreamConfig> = doc
            .upstreams
            .iter()
            .map(|u| (u.name.as_str(), u))
            .collect();
        let plugin_by_name: HashMap<&str, &crate::config::PluginConfig> = doc
            .plugins
            .iter()
            .map(|p| (p.name.as_str(), p))
            .collect();

        for route_cfg in &doc.routes {
            let Some(upstream_ref) = &route_cfg.upstream else {
                continue;
            };
            // A named reference resolves against the document's upstream
            // list; anything else is used inline as written.
            let upstream_cfg = upstream_by_name
                .get(upstream_ref.name.as_str())
                .copied()
                .unwrap_or(upstream_ref);
            let upstream = self.upstream_factory.build(upstream_cfg)?;

            let mut chain = Chain::new();
            for plugin_ref in &route_cfg.plugins {
                let plugin_cfg = plugin_by_name
                    .get(plugin_ref.name.as_str())
                    .copied()
                    .unwrap_or(plugin_ref);
                let Some(factory) = self.registry.get(&plugin_cfg.plugin_type) else {
                    warn!(
                        listener = %self.listener,
                        route = %route_cfg.name,
                        plugin = %plugin_cfg.name,
                        plugin_type = %plugin_cfg.plugin_type,
                        "Plugin type not found, skipping"
                    );
                    continue;
                };
                let mut plugin = factory();
                match plugin.validate_and_set_config(plugin_cfg.config.clone()) {
                    Ok(()) => {
                        info!(
                            listener = %self.listener,
                            route = %route_cfg.name,
                            plugin = %plugin_cfg.name,
                            "Adding plugin to route"
                        );
                        chain.add(Arc::from(plugin));
                    }
                    Err(err) => {
                        warn!(
                            listener = %self.listener,
                            route = %route_cfg.name,
                            plugin = %plugin_cfg.name,
                            error = %err,
                            "Plugin rejected its configuration, skipping"
                        );
                    }
                }
            }
            chain.sort();
            let chain = Arc::new(chain);
            table.chains.push(Arc::clone(&chain));

            let route = Arc::new(Route {
                name: route_cfg.name.clone(),
                plugins: chain,
                upstream,
            });

            let mut constrains_path = false;
            let mut constrains_method = false;
            let mut constrains_headers = false;
            for m in &route_cfg.matches {
                if let Some(path) = &m.path {
                    table.path.add(path, Arc::clone(&route));
                    constrains_path = true;
                }
                if let Some(method) = &m.method {
                    table.method.add(method, Arc::clone(&route));
                    constrains_method = true;
                }
                if !m.headers.is_empty() {
                    table.header.add(&m.headers, Arc::clone(&route));
                    constrains_headers = true;
                }
            }
            // A dimension with no constraint matches everything in it.
            if !constrains_path {
                table.path.add_any(Arc::clone(&route));
            }
            if !constrains_method {
                table.method.add_any(Arc::clone(&route));
            }
            if !constrains_headers {
                table.header.add(&Default::default(), Arc::clone(&route));
            }
        }

        let route_count = doc.routes.len();
        let old = self.table.swap(Arc::new(table));
        for chain in &old.chains {
            chain.destroy();
        }
        info!(listener = %self.listener, routes = route_count, "Routing table updated");
        Ok(())
    }

    /// Serve one request: match, run the plugin request phase, pick a node,
    /// and hand off to the transport with the plugin-wrapped sink.
    pub async fn dispatch(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        tls: bool,
    ) -> Response<ProxyBody> {
        let table = self.table.load_full();

        let path = req.uri().path().to_string();
        let path_routes = table.path.matches(&path);
        if path_routes.is_empty() {
            return error_response(ProxyErrorCode::RouteNotFound, "404 page not found");
        }

        let method_routes = table.method.matches(req.method().as_str());
        let candidates = intersect(&path_routes, &method_routes);
        if candidates.is_empty() {
            return error_response(ProxyErrorCode::RouteNotFound, "404 page not found");
        }

        let matched = table.header.matches(req.headers(), &candidates);
        let Some(route) = matched.first().cloned() else {
            return error_response(ProxyErrorCode::RouteNotFound, "404 page not found");
        };
        debug!(
            listener = %self.listener,
            route = %route.name,
            method = %req.method(),
            path = %path,
            "Matched route"
        );

        stamp_forwarded_headers(&mut req, client_addr, tls);

        let on_upgrade = is_websocket_upgrade(req.headers()).then(|| hyper::upgrade::on(&mut req));
        let (mut parts, body) = req.into_parts();
        let (sink, head_rx, body_rx) = ServerSink::channel(on_upgrade);

        let proxy = Arc::clone(&self.proxy);
        let task_label = format!("{}/{}", self.listener, route.name);
        spawn_guarded("router", task_label, async move {
            let mut sink: Box<dyn ResponseSink> = Box::new(sink);
            match route.plugins.handle_request(&mut parts, sink.as_mut()).await {
                Err(err) => {
                    warn!(route = %route.name, error = %err, "Plugin chain failed");
                    write_error(sink.as_mut(), ProxyErrorCode::PluginFailed, &err.to_string())
                        .await;
                }
                Ok(true) => {
                    // The plugin finished the response; make sure a head went
                    // out even if it only wrote a body.
                    sink.write_header(StatusCode::OK).await;
                }
                Ok(false) => match route.upstream.select_node() {
                    None => {
                        write_error(
                            sink.as_mut(),
                            ProxyErrorCode::NoAvailableUpstream,
                            "No available upstream nodes",
                        )
                        .await;
                    }
                    Some(node) => {
                        let mut wrapped = route.plugins.handle_response(&parts, sink);
                        proxy.serve(parts, body, wrapped.as_mut(), &node).await;
                    }
                },
            }
        });

        match head_rx.await {
            Ok(head) => response_from_head(head, body_rx),
            // The pipeline died without writing a head; the task already
            // logged why.
            Err(_) => error_response(ProxyErrorCode::Internal, "Internal Server Error"),
        }
    }
}

fn intersect(a: &[Arc<Route>], b: &[Arc<Route>]) -> Vec<Arc<Route>> {
    a.iter()
        .filter(|route| b.iter().any(|other| Arc::ptr_eq(route, other)))
        .cloned()
        .collect()
}

/// Overwrite (never append) the forwarding headers: this proxy assumes it is
/// the first trusted hop, and client-supplied values are spoofable.
fn stamp_forwarded_headers(req: &mut Request<Incoming>, client_addr: SocketAddr, tls: bool) {
    let host = req.headers().get(hyper::header::HOST).cloned();
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if tls { "https" } else { "http" }),
    );
    if let Some(host) = host {
        headers.insert("x-forwarded-host", host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryManager;
    use crate::proxy::PoolConfig;

    fn test_router() -> Arc<HttpRouter> {
        let discovery = Arc::new(DiscoveryManager::new());
        Arc::new(HttpRouter::new(
            "l1",
            Arc::new(UpstreamFactory::new(discovery)),
            Arc::new(Registry::builtin()),
            Arc::new(ReverseProxy::new(PoolConfig::default())),
        ))
    }

    fn doc(yaml: &str) -> Dynamic {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_update_routes_builds_table() {
        let router = test_router();
        router
            .update_routes(&doc(
                r#"
routes:
  - name: r1
    listener: l1
    matches:
      - path: /ip
    upstream:
      name: backend
upstreams:
  - name: backend
    nodes:
      - url: http://127.0.0.1:9090
"#,
            ))
            .unwrap();

        let table = router.table.load();
        assert_eq!(table.path.matches("/ip").len(), 1);
        assert_eq!(table.path.matches("/other").len(), 0);
        // No method constraint: every verb matches.
        assert_eq!(table.method.matches("POST").len(), 1);
    }

    #[tokio::test]
    async fn test_update_routes_resolves_named_upstream() {
        let router = test_router();
        router
            .update_routes(&doc(
                r#"
routes:
  - name: r1
    listener: l1
    matches:
      - path: /x
    upstream:
      name: pool
upstreams:
  - name: pool
    nodes:
      - url: http://127.0.0.1:9001
      - url: http://127.0.0.1:9002
"#,
            ))
            .unwrap();
        let table = router.table.load();
        let route = &table.path.matches("/x")[0];
        assert_eq!(route.upstream.node_count(), 2);
    }

    #[tokio::test]
    async fn test_update_routes_bad_node_url_keeps_previous_table() {
        let router = test_router();
        router
            .update_routes(&doc(
                r#"
routes:
  - name: r1
    listener: l1
    matches:
      - path: /old
    upstream:
      nodes:
        - url: http://127.0.0.1:9090
"#,
            ))
            .unwrap();

        let err = router.update_routes(&doc(
            r#"
routes:
  - name: r1
    listener: l1
    matches:
      - path: /new
    upstream:
      nodes:
        - url: "http://[broken"
"#,
        ));
        assert!(err.is_err());
        // Previous generation still routes.
        let table = router.table.load();
        assert_eq!(table.path.matches("/old").len(), 1);
        assert_eq!(table.path.matches("/new").len(), 0);
    }

    #[tokio::test]
    async fn test_update_routes_skips_unknown_plugin_type() {
        let router = test_router();
        router
            .update_routes(&doc(
                r#"
routes:
  - name: r1
    listener: l1
    matches:
      - path: /x
    plugins:
      - name: mystery
        type: nonexistent
    upstream:
      nodes:
        - url: http://127.0.0.1:9090
"#,
            ))
            .unwrap();
        let table = router.table.load();
        let route = &table.path.matches("/x")[0];
        assert!(route.plugins.is_empty());
    }

    #[tokio::test]
    async fn test_update_routes_resolves_named_plugin_config() {
        let router = test_router();
        router
            .update_routes(&doc(
                r#"
routes:
  - name: r1
    listener: l1
    matches:
      - path: /x
    plugins:
      - name: cache
    upstream:
      nodes:
        - url: http://127.0.0.1:9090
plugins:
  - name: cache
    type: responsecache
    config:
      size: 10
      ttl: 30
      key: uri
"#,
            ))
            .unwrap();
        let table = router.table.load();
        let route = &table.path.matches("/x")[0];
        assert_eq!(route.plugins.len(), 1);
    }

    #[tokio::test]
    async fn test_swap_destroys_old_generation() {
        let router = test_router();
        let base = r#"
routes:
  - name: r1
    listener: l1
    matches:
      - path: /x
    plugins:
      - name: cache
        type: responsecache
        config:
          size: 10
          ttl: 30
          key: uri
    upstream:
      nodes:
        - url: http://127.0.0.1:9090
"#;
        router.update_routes(&doc(base)).unwrap();
        let old_table = router.table.load_full();
        assert_eq!(old_table.chains.len(), 1);

        router.update_routes(&Dynamic::default()).unwrap();
        // New generation is empty; the old chain was destroyed (observable
        // only through the plugin's own teardown, so just confirm the swap).
        assert_eq!(router.table.load().chains.len(), 0);
    }

    #[test]
    fn test_intersect_uses_identity() {
        let a = Arc::new(Route {
            name: "a".to_string(),
            plugins: Arc::new(Chain::new()),
            upstream: Arc::new(Upstream::new("u", "", vec![])),
        });
        let b = Arc::new(Route {
            name: "b".to_string(),
            plugins: Arc::new(Chain::new()),
            upstream: Arc::new(Upstream::new("u", "", vec![])),
        });
        let left = vec![Arc::clone(&a), Arc::clone(&b)];
        let right = vec![Arc::clone(&b)];
        let both = intersect(&left, &right);
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].name, "b");
    }
}
