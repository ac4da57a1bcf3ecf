//! Dynamic configuration providers
//!
//! A provider pushes parsed `Dynamic` documents into the watcher's receive
//! channel. The file provider watches a YAML file (and its directory, to
//! survive renames and recreations), deduplicates on an MD5 content hash,
//! and drops updates with a warning when the channel is full.

use std::path::PathBuf;

use async_trait::async_trait;
use notify::{RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Dynamic, ProviderConfig};

#[async_trait]
pub trait Provider: Send + Sync {
    /// Run until cancelled, pushing configuration documents into `tx`.
    async fn provide(&self, tx: mpsc::Sender<Dynamic>, ctx: CancellationToken);
}

pub struct FileProvider {
    name: String,
    path: PathBuf,
}

impl FileProvider {
    pub fn new(cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let path = cfg
            .config
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("file provider missing 'path' configuration"))?;
        let path = std::path::absolute(path)
            .map_err(|e| anyhow::anyhow!("failed to resolve absolute path {path}: {e}"))?;
        Ok(Self {
            name: cfg.name.clone(),
            path,
        })
    }

    /// Read, hash, parse, and forward the file if its content changed.
    /// Returns the new hash once the update was offered downstream (even if
    /// the channel was full and the update dropped).
    fn read_and_send(&self, tx: &mpsc::Sender<Dynamic>, last_hash: &mut Option<String>) {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(err) => {
                warn!(provider = %self.name, path = %self.path.display(), error = %err,
                    "Failed to read config file");
                return;
            }
        };

        let hash = format!("{:x}", md5::compute(&content));
        if last_hash.as_deref() == Some(hash.as_str()) {
            return;
        }

        let doc: Dynamic = match serde_yaml::from_slice(&content) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(provider = %self.name, path = %self.path.display(), error = %err,
                    "Failed to parse config YAML");
                return;
            }
        };

        match tx.try_send(doc) {
            Ok(()) => {
                info!(provider = %self.name, "File provider sent updated configuration");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(provider = %self.name, "Config channel is full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(provider = %self.name, "Config channel closed");
            }
        }
        *last_hash = Some(hash);
    }
}

#[async_trait]
impl Provider for FileProvider {
    async fn provide(&self, tx: mpsc::Sender<Dynamic>, ctx: CancellationToken) {
        // notify delivers on its own thread; bridge into the async world.
        let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<notify::Event>>(16);
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = event_tx.blocking_send(res);
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!(provider = %self.name, error = %err, "Failed to create file watcher");
                return;
            }
        };

        if let Err(err) = watcher.watch(&self.path, RecursiveMode::NonRecursive) {
            warn!(provider = %self.name, path = %self.path.display(), error = %err,
                "Failed to watch file");
        }
        // Watch the directory too so renames and recreations are seen.
        if let Some(dir) = self.path.parent() {
            if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(provider = %self.name, dir = %dir.display(), error = %err,
                    "Failed to watch directory");
            }
        }

        let mut last_hash: Option<String> = None;
        self.read_and_send(&tx, &mut last_hash);
        info!(provider = %self.name, path = %self.path.display(), "File provider watching");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!(provider = %self.name, "File provider stopped");
                    return;
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        Ok(event) => {
                            if !event.paths.iter().any(|p| p == &self.path) {
                                continue;
                            }
                            match event.kind {
                                notify::EventKind::Create(_) => {
                                    // Recreated after a remove/rename; re-arm
                                    // the direct watch before reading.
                                    let _ = watcher.watch(&self.path, RecursiveMode::NonRecursive);
                                    self.read_and_send(&tx, &mut last_hash);
                                }
                                notify::EventKind::Modify(_) => {
                                    self.read_and_send(&tx, &mut last_hash);
                                }
                                notify::EventKind::Remove(_) => {
                                    let _ = watcher.unwatch(&self.path);
                                }
                                _ => {}
                            }
                        }
                        Err(err) => {
                            warn!(provider = %self.name, error = %err, "File watcher error");
                        }
                    }
                }
            }
        }
    }
}

/// Build a provider from its static config entry. Unknown types yield `None`
/// so the watcher can skip them with a warning.
pub fn build_provider(cfg: &ProviderConfig) -> Option<anyhow::Result<Box<dyn Provider>>> {
    match cfg.provider_type.as_str() {
        "file" => Some(FileProvider::new(cfg).map(|p| Box::new(p) as Box<dyn Provider>)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptionsMap;
    use std::io::Write;
    use std::time::Duration;

    fn provider_config(path: &str) -> ProviderConfig {
        let mut config = OptionsMap::new();
        config.insert("path".to_string(), serde_yaml::Value::String(path.to_string()));
        ProviderConfig {
            name: "files".to_string(),
            provider_type: "file".to_string(),
            config,
        }
    }

    #[test]
    fn test_missing_path_rejected() {
        let cfg = ProviderConfig {
            name: "files".to_string(),
            provider_type: "file".to_string(),
            config: OptionsMap::new(),
        };
        assert!(FileProvider::new(&cfg).is_err());
    }

    #[test]
    fn test_unknown_provider_type() {
        let mut cfg = provider_config("/tmp/x.yaml");
        cfg.provider_type = "consul".to_string();
        assert!(build_provider(&cfg).is_none());
    }

    #[tokio::test]
    async fn test_content_hash_suppresses_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynamic.yaml");
        std::fs::write(&path, "routes: []\n").unwrap();

        let provider = FileProvider::new(&provider_config(path.to_str().unwrap())).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let mut last_hash = None;

        provider.read_and_send(&tx, &mut last_hash);
        assert!(rx.try_recv().is_ok());

        // Unchanged content: hash matches, nothing forwarded.
        provider.read_and_send(&tx, &mut last_hash);
        assert!(rx.try_recv().is_err());

        std::fs::write(&path, "routes: []\nplugins: []\n").unwrap();
        provider.read_and_send(&tx, &mut last_hash);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_watch_picks_up_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynamic.yaml");
        std::fs::write(&path, "routes: []\n").unwrap();

        let provider = FileProvider::new(&provider_config(path.to_str().unwrap())).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = CancellationToken::new();
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { provider.provide(tx, task_ctx).await });

        // Initial read.
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(first.is_some());

        // Give the watcher a moment to arm, then rewrite the file.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut file = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        writeln!(
            file,
            "routes:\n  - name: r1\n    listener: l1\n    matches:\n      - path: /x\n    upstream:\n      nodes:\n        - url: http://127.0.0.1:9000"
        )
        .unwrap();
        drop(file);

        let updated = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.routes.len(), 1);

        ctx.cancel();
        let _ = handle.await;
    }
}
