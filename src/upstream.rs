//! Upstreams: named node pools with a load-balancing policy
//!
//! The node set is replaced wholesale (never edited in place), so request
//! paths always observe either the previous or the next complete set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use tracing::debug;
use url::Url;

use crate::config::UpstreamConfig;
use crate::discovery::DiscoveryManager;
use crate::task::spawn_guarded;

pub const POLICY_ROUND_ROBIN: &str = "round_robin";

/// A single backend endpoint. Immutable once built; discovery pushes replace
/// whole node sets rather than mutating nodes.
#[derive(Debug, Clone)]
pub struct Node {
    pub service_name: String,
    pub url: Url,
    pub weight: Option<u32>,
}

impl Node {
    /// `host:port` dial target for this node.
    pub fn authority(&self) -> Option<String> {
        let host = self.url.host_str()?;
        let port = self.url.port_or_known_default()?;
        Some(format!("{host}:{port}"))
    }
}

/// A pool of nodes plus the rotating round-robin cursor.
pub struct Upstream {
    name: String,
    policy: String,
    nodes: ArcSwap<Vec<Arc<Node>>>,
    cursor: AtomicUsize,
}

impl Upstream {
    pub fn new(name: impl Into<String>, policy: impl Into<String>, nodes: Vec<Arc<Node>>) -> Self {
        let mut policy = policy.into();
        if policy.is_empty() {
            policy = POLICY_ROUND_ROBIN.to_string();
        }
        Self {
            name: name.into(),
            policy,
            nodes: ArcSwap::from_pointee(nodes),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.load().len()
    }

    /// Pick a node under the configured policy. Returns `None` for an empty
    /// node set or an unsupported policy.
    pub fn select_node(&self) -> Option<Arc<Node>> {
        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return None;
        }
        if self.policy != POLICY_ROUND_ROBIN {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(nodes[i].clone())
    }

    /// Replace the node set and restart the rotation from the first node.
    pub fn update_nodes(&self, nodes: Vec<Arc<Node>>) {
        debug!(upstream = %self.name, nodes = nodes.len(), "Replacing upstream node set");
        self.nodes.store(Arc::new(nodes));
        self.cursor.store(0, Ordering::Relaxed);
    }
}

/// Builds `Upstream` instances from dynamic configuration, wiring discovery
/// subscriptions for service-backed pools.
pub struct UpstreamFactory {
    discovery: Arc<DiscoveryManager>,
}

impl UpstreamFactory {
    pub fn new(discovery: Arc<DiscoveryManager>) -> Self {
        Self { discovery }
    }

    /// Build an upstream from its config. Static node URLs must parse; a
    /// discovery reference subscribes to `sd_{type}_{service}` and replaces
    /// the node set on every push for as long as the upstream is alive.
    pub fn build(&self, cfg: &UpstreamConfig) -> anyhow::Result<Arc<Upstream>> {
        let mut nodes = Vec::with_capacity(cfg.nodes.len());
        for node_cfg in &cfg.nodes {
            let url = Url::parse(&node_cfg.url)
                .with_context(|| format!("invalid node URL {}", node_cfg.url))?;
            nodes.push(Arc::new(Node {
                service_name: cfg.service.clone(),
                url,
                weight: node_cfg.weight,
            }));
        }

        let upstream = Arc::new(Upstream::new(cfg.name.clone(), cfg.policy.clone(), nodes));

        if let Some(discovery_ref) = &cfg.discovery {
            let mut subscription = self
                .discovery
                .subscribe(discovery_ref, &cfg.service)
                .with_context(|| format!("failed to initialize discovery for upstream {}", cfg.name))?;
            let weak = Arc::downgrade(&upstream);
            let label = format!("{}/{}", discovery_ref.discovery_type, cfg.service);
            spawn_guarded("upstream", label, async move {
                while let Some(nodes) = subscription.recv().await {
                    match weak.upgrade() {
                        Some(upstream) => upstream.update_nodes(nodes),
                        // The routing-table generation owning this upstream
                        // is gone; drop the subscription with it.
                        None => break,
                    }
                }
            });
        }

        Ok(upstream)
    }
}
