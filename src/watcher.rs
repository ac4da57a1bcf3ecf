//! Configuration watcher: provider fan-in and latest-wins throttling
//!
//! Providers push documents into one bounded receive channel. The watcher
//! validates each document and hands it to the processor through a
//! capacity-one apply channel, holding at most a single pending document: a
//! newer arrival overwrites an undelivered one. The processor may skip
//! intermediate configurations but never sees them out of order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Dynamic, DynamicValidator, ProviderConfig};
use crate::provider::{build_provider, Provider};
use crate::task::spawn_guarded;

const RECEIVE_CAPACITY: usize = 10;

/// Consumer of validated configuration documents.
pub trait Processor: Send + 'static {
    fn process(&mut self, doc: &Dynamic);
}

pub struct Watcher {
    receive_tx: mpsc::Sender<Dynamic>,
    receive_rx: mpsc::Receiver<Dynamic>,
    providers: Vec<(String, Arc<dyn Provider>)>,
}

impl Watcher {
    /// Build a watcher over the configured providers. Returns `None` when no
    /// usable provider is configured (the proxy then simply serves no
    /// dynamic routes).
    pub fn new(provider_configs: &[ProviderConfig]) -> Option<Self> {
        let mut providers: Vec<(String, Arc<dyn Provider>)> = Vec::new();
        for cfg in provider_configs {
            match build_provider(cfg) {
                Some(Ok(provider)) => {
                    providers.push((cfg.name.clone(), Arc::from(provider)));
                }
                Some(Err(err)) => {
                    warn!(provider = %cfg.name, error = %err, "Skipping misconfigured provider");
                }
                None => {
                    warn!(provider = %cfg.name, provider_type = %cfg.provider_type,
                        "Skipping unsupported provider type");
                }
            }
        }
        if providers.is_empty() {
            return None;
        }

        let (receive_tx, receive_rx) = mpsc::channel(RECEIVE_CAPACITY);
        Some(Self {
            receive_tx,
            receive_rx,
            providers,
        })
    }

    /// Run the providers and the throttle loop until cancelled.
    pub async fn watch<P: Processor>(mut self, ctx: CancellationToken, mut processor: P) {
        for (name, provider) in &self.providers {
            let provider = Arc::clone(provider);
            let tx = self.receive_tx.clone();
            let token = ctx.child_token();
            spawn_guarded("provider", name.clone(), async move {
                provider.provide(tx, token).await;
            });
        }
        // Our own sender copy would keep the receive channel open forever.
        drop(self.receive_tx);

        let (apply_tx, mut apply_rx) = mpsc::channel::<Dynamic>(1);
        spawn_guarded("watcher", "processor", async move {
            while let Some(doc) = apply_rx.recv().await {
                processor.process(&doc);
            }
        });

        let mut pending: Option<Dynamic> = None;
        loop {
            match pending.take() {
                None => {
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            info!("Watcher received shutdown signal");
                            return;
                        }
                        received = self.receive_rx.recv() => match received {
                            None => return,
                            Some(doc) => pending = admit(doc),
                        }
                    }
                }
                Some(doc) => {
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            info!("Watcher received shutdown signal");
                            return;
                        }
                        received = self.receive_rx.recv() => match received {
                            None => {
                                let _ = apply_tx.send(doc).await;
                                return;
                            }
                            // Latest wins: an undelivered document is
                            // overwritten, never queued behind the new one.
                            Some(newer) => pending = admit(newer).or(Some(doc)),
                        },
                        permit = apply_tx.reserve() => match permit {
                            Ok(permit) => permit.send(doc),
                            Err(_) => return,
                        }
                    }
                }
            }
        }
    }
}

/// Gate documents on validation: a rejected document is logged and skipped,
/// leaving whatever was applied before in effect.
fn admit(doc: Dynamic) -> Option<Dynamic> {
    match DynamicValidator::new().validate(&doc) {
        Ok(()) => Some(doc),
        Err(err) => {
            warn!(error = %err, "Rejecting invalid dynamic configuration");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatchConfig, NodeConfig, RouteConfig, UpstreamConfig};
    use std::time::Duration;

    struct Recorder {
        seen: mpsc::UnboundedSender<String>,
        delay: Duration,
    }

    impl Processor for Recorder {
        fn process(&mut self, doc: &Dynamic) {
            if let Some(route) = doc.routes.first() {
                let _ = self.seen.send(route.name.clone());
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }
    }

    fn doc(route_name: &str) -> Dynamic {
        Dynamic {
            routes: vec![RouteConfig {
                name: route_name.to_string(),
                listener: "l1".to_string(),
                matches: vec![MatchConfig {
                    path: Some("/x".to_string()),
                    ..Default::default()
                }],
                plugins: vec![],
                upstream: Some(UpstreamConfig {
                    nodes: vec![NodeConfig {
                        url: "http://127.0.0.1:9000".to_string(),
                        weight: None,
                    }],
                    ..Default::default()
                }),
            }],
            ..Default::default()
        }
    }

    /// A watcher built directly on a hand-fed receive channel, bypassing
    /// providers, to drive the throttle loop deterministically.
    fn hand_fed() -> (Watcher, mpsc::Sender<Dynamic>) {
        let (receive_tx, receive_rx) = mpsc::channel(RECEIVE_CAPACITY);
        let feeder = receive_tx.clone();
        let watcher = Watcher {
            receive_tx,
            receive_rx,
            providers: Vec::new(),
        };
        (watcher, feeder)
    }

    #[tokio::test]
    async fn test_documents_flow_to_processor() {
        let (watcher, feeder) = hand_fed();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            watcher
                .watch(
                    task_ctx,
                    Recorder {
                        seen: seen_tx,
                        delay: Duration::ZERO,
                    },
                )
                .await;
        });

        feeder.send(doc("a")).await.unwrap();
        let name = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "a");
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_invalid_document_is_skipped() {
        let (watcher, feeder) = hand_fed();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            watcher
                .watch(
                    task_ctx,
                    Recorder {
                        seen: seen_tx,
                        delay: Duration::ZERO,
                    },
                )
                .await;
        });

        // Route without listener or matches: rejected by validation.
        let mut invalid = doc("bad");
        invalid.routes[0].listener = String::new();
        feeder.send(invalid).await.unwrap();
        feeder.send(doc("good")).await.unwrap();

        let name = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "good");
        ctx.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_latest_wins_never_reorders() {
        let (watcher, feeder) = hand_fed();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            watcher
                .watch(
                    task_ctx,
                    Recorder {
                        seen: seen_tx,
                        delay: Duration::from_millis(150),
                    },
                )
                .await;
        });

        for i in 0..6 {
            feeder.send(doc(&format!("v{i}"))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Let the slow processor drain.
        tokio::time::sleep(Duration::from_secs(2)).await;
        ctx.cancel();

        let mut seen = Vec::new();
        while let Ok(name) = seen_rx.try_recv() {
            seen.push(name);
        }
        assert!(!seen.is_empty());
        // Monotonic: intermediate versions may be skipped, but nothing older
        // than an already-processed document ever shows up.
        let versions: Vec<u32> = seen
            .iter()
            .map(|s| s.trim_start_matches('v').parse().unwrap())
            .collect();
        for pair in versions.windows(2) {
            assert!(pair[0] < pair[1], "processed out of order: {seen:?}");
        }
        // The final document always lands.
        assert_eq!(*versions.last().unwrap(), 5);
    }
}
