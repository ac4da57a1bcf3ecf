//! Application wiring and lifecycle
//!
//! Builds the shared infrastructure (event bus, discovery, plugin registry,
//! transport), brings up one listener per static config entry, starts the
//! provider/watcher/processor pipeline, and runs until a shutdown signal.
//! Shutdown cancels every background task and bounds the listener drain.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::{Dynamic, StaticConfig};
use crate::discovery::DiscoveryManager;
use crate::listener::Listener;
use crate::plugin::Registry;
use crate::processor::ListenerProcessor;
use crate::proxy::{PoolConfig, ReverseProxy};
use crate::task::spawn_guarded;
use crate::upstream::UpstreamFactory;
use crate::watcher::Watcher;

/// Bound on the graceful listener drain at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct App {
    config: StaticConfig,
}

impl App {
    pub fn new(config: StaticConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();

        let bus: Arc<EventBus<Dynamic>> = Arc::new(EventBus::new());
        let discovery = Arc::new(DiscoveryManager::new());
        discovery.init(&shutdown, &self.config.discovery).await?;

        let registry = Arc::new(Registry::builtin());
        let upstream_factory = Arc::new(UpstreamFactory::new(discovery));
        let proxy = Arc::new(ReverseProxy::new(PoolConfig::default()));

        let mut listener_handles = Vec::new();
        for listener_cfg in &self.config.listeners {
            let listener = Listener::new(
                listener_cfg.clone(),
                &bus,
                Arc::clone(&upstream_factory),
                Arc::clone(&registry),
                Arc::clone(&proxy),
                shutdown.child_token(),
            )?;
            let name = listener.name().to_string();
            info!(listener = %name, "Starting listener");
            let handle = spawn_guarded("listener", name.clone(), async move {
                if let Err(err) = listener.run().await {
                    error!(listener = %name, error = %err, "Listener failed");
                }
            });
            listener_handles.push(handle);
        }

        if let Some(watcher) = Watcher::new(&self.config.providers) {
            let processor = ListenerProcessor::new(Arc::clone(&bus));
            let token = shutdown.child_token();
            spawn_guarded("watcher", "config", async move {
                watcher.watch(token, processor).await;
                info!("Configuration watcher stopped");
            });
        } else {
            info!("No dynamic configuration providers configured");
        }

        info!(
            listeners = self.config.listeners.len(),
            "arp server started"
        );

        wait_for_shutdown_signal(&shutdown).await;

        info!("Initiating graceful shutdown");
        shutdown.cancel();

        let drain = async {
            for handle in listener_handles {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await {
            Ok(()) => info!("Shutdown completed"),
            Err(_) => warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Shutdown timeout exceeded, forcing exit"
            ),
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(ctx: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "Failed to install SIGTERM handler");
            ctx.cancelled().await;
            return;
        }
    };
    let mut sigquit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "Failed to install SIGQUIT handler");
            ctx.cancelled().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigquit.recv() => info!("Received SIGQUIT"),
        _ = ctx.cancelled() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(ctx: &CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        _ = ctx.cancelled() => {}
    }
}
