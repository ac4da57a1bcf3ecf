//! Service discovery backends and their manager
//!
//! A backend publishes node-set updates onto the event bus under
//! `sd_{type}_{service}` at its own cadence until cancelled. The manager owns
//! the configured backends (one per type) and hands out subscriptions to
//! upstreams. The backend set is closed: types are registered at startup, not
//! at runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::bus::{discovery_topic, EventBus, Subscription};
use crate::config::{DiscoveryConfig, DiscoveryRef, OptionsMap};
use crate::task::spawn_guarded;
use crate::upstream::Node;

/// Payload published for every discovery update: the full node set for one
/// `(type, service)` pair.
pub type NodeSet = Vec<Arc<Node>>;

/// One discovery backend. `start` kicks off the publishing loop and returns;
/// the loop runs until the cancellation token fires.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn start(
        &self,
        ctx: CancellationToken,
        discovery_type: &str,
        bus: Arc<EventBus<NodeSet>>,
        options: OptionsMap,
    ) -> anyhow::Result<()>;
}

pub struct DiscoveryManager {
    backends: Mutex<HashMap<String, Arc<dyn Discovery>>>,
    bus: Arc<EventBus<NodeSet>>,
}

impl Default for DiscoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryManager {
    pub fn new() -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
            bus: Arc::new(EventBus::new()),
        }
    }

    fn backend_for(discovery_type: &str) -> Option<Arc<dyn Discovery>> {
        match discovery_type {
            "demo" => Some(Arc::new(DemoDiscovery)),
            _ => None,
        }
    }

    /// Instantiate and start every configured backend. Unknown types are a
    /// startup error.
    pub async fn init(
        &self,
        ctx: &CancellationToken,
        configs: &[DiscoveryConfig],
    ) -> anyhow::Result<()> {
        for cfg in configs {
            let backend = Self::backend_for(&cfg.discovery_type).ok_or_else(|| {
                anyhow::anyhow!("unsupported discovery type: {}", cfg.discovery_type)
            })?;
            info!(discovery_type = %cfg.discovery_type, "Starting discovery backend");
            backend
                .start(
                    ctx.child_token(),
                    &cfg.discovery_type,
                    Arc::clone(&self.bus),
                    cfg.config.clone(),
                )
                .await?;
            self.backends
                .lock()
                .insert(cfg.discovery_type.clone(), backend);
        }
        Ok(())
    }

    /// Subscribe to node updates for a `(type, service)` pair. Fails when the
    /// referenced backend type was never configured.
    pub fn subscribe(
        &self,
        discovery_ref: &DiscoveryRef,
        service: &str,
    ) -> anyhow::Result<Subscription<NodeSet>> {
        if !self.backends.lock().contains_key(&discovery_ref.discovery_type) {
            anyhow::bail!("unsupported discovery type: {}", discovery_ref.discovery_type);
        }
        Ok(self
            .bus
            .subscribe(&discovery_topic(&discovery_ref.discovery_type, service)))
    }
}

const DEMO_DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const DEMO_SERVICE_ADDRESS: &str = "localhost:9090";

/// Reference backend: periodically re-publishes a fixed node list per
/// service. Services and URLs come from its options; without any it
/// advertises the bundled demo upstream.
pub struct DemoDiscovery;

impl DemoDiscovery {
    fn interval(options: &OptionsMap) -> Duration {
        match options.get("interval") {
            Some(v) => {
                if let Some(secs) = v.as_u64() {
                    return Duration::from_secs(secs);
                }
                if let Some(s) = v.as_str() {
                    if let Ok(secs) = s.trim_end_matches('s').parse::<u64>() {
                        return Duration::from_secs(secs);
                    }
                }
                DEMO_DEFAULT_INTERVAL
            }
            None => DEMO_DEFAULT_INTERVAL,
        }
    }

    fn services(options: &OptionsMap) -> Vec<(String, Vec<Url>)> {
        let configured = options.get("services").and_then(|v| v.as_mapping());
        if let Some(mapping) = configured {
            let mut services = Vec::new();
            for (key, value) in mapping {
                let Some(service) = key.as_str() else { continue };
                let urls: Vec<Url> = match value {
                    serde_yaml::Value::Sequence(seq) => seq
                        .iter()
                        .filter_map(|v| v.as_str())
                        .filter_map(|s| Url::parse(s).ok())
                        .collect(),
                    serde_yaml::Value::String(s) => Url::parse(s).ok().into_iter().collect(),
                    _ => Vec::new(),
                };
                services.push((service.to_string(), urls));
            }
            return services;
        }

        // Matches the bundled demo upstream's endpoints.
        vec![
            (
                "header".to_string(),
                vec![Url::parse(&format!("http://{DEMO_SERVICE_ADDRESS}/headers")).unwrap()],
            ),
            (
                "ip".to_string(),
                vec![Url::parse(&format!("http://{DEMO_SERVICE_ADDRESS}/ip")).unwrap()],
            ),
        ]
    }
}

#[async_trait]
impl Discovery for DemoDiscovery {
    async fn start(
        &self,
        ctx: CancellationToken,
        discovery_type: &str,
        bus: Arc<EventBus<NodeSet>>,
        options: OptionsMap,
    ) -> anyhow::Result<()> {
        let interval = Self::interval(&options);
        let services = Self::services(&options);
        info!(
            discovery_type,
            interval_secs = interval.as_secs(),
            services = services.len(),
            "Demo discovery started"
        );

        let typ = discovery_type.to_string();
        spawn_guarded("discovery", typ.clone(), async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately so subscribers converge
            // without waiting a full interval.
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        info!(discovery_type = %typ, "Demo discovery stopped");
                        return;
                    }
                    _ = tick.tick() => {
                        for (service, urls) in &services {
                            let nodes: NodeSet = urls
                                .iter()
                                .map(|url| {
                                    Arc::new(Node {
                                        service_name: service.clone(),
                                        url: url.clone(),
                                        weight: None,
                                    })
                                })
                                .collect();
                            debug!(discovery_type = %typ, service = %service, nodes = nodes.len(),
                                "Demo discovery publishing nodes");
                            bus.publish(&discovery_topic(&typ, service), nodes);
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;

    fn options(yaml: &str) -> OptionsMap {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(DemoDiscovery::interval(&OptionsMap::new()), Duration::from_secs(10));
        assert_eq!(
            DemoDiscovery::interval(&options("interval: 3")),
            Duration::from_secs(3)
        );
        assert_eq!(
            DemoDiscovery::interval(&options("interval: 5s")),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_configured_services() {
        let opts = options(
            r#"
services:
  api:
    - http://127.0.0.1:9001
    - http://127.0.0.1:9002
"#,
        );
        let services = DemoDiscovery::services(&opts);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].0, "api");
        assert_eq!(services[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_backend_type_rejected() {
        let manager = DiscoveryManager::new();
        let ctx = CancellationToken::new();
        let err = manager
            .init(
                &ctx,
                &[DiscoveryConfig {
                    discovery_type: "kubernetes".to_string(),
                    config: OptionsMap::new(),
                }],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported discovery type"));
    }

    #[tokio::test]
    async fn test_demo_publishes_until_cancelled() {
        let manager = DiscoveryManager::new();
        let ctx = CancellationToken::new();
        manager
            .init(
                &ctx,
                &[DiscoveryConfig {
                    discovery_type: "demo".to_string(),
                    config: options(
                        r#"
interval: 1
services:
  svc:
    - http://127.0.0.1:9001
"#,
                    ),
                }],
            )
            .await
            .unwrap();

        let mut sub = manager
            .subscribe(
                &DiscoveryRef {
                    discovery_type: "demo".to_string(),
                    params: Default::default(),
                },
                "svc",
            )
            .unwrap();

        let nodes = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].service_name, "svc");
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_subscribe_requires_configured_type() {
        let manager = DiscoveryManager::new();
        let err = manager
            .subscribe(
                &DiscoveryRef {
                    discovery_type: "demo".to_string(),
                    params: Default::default(),
                },
                "svc",
            )
            .unwrap_err();
        assert!(err.to_string().contains("unsupported discovery type"));
    }
}
