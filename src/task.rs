//! Panic-isolating task spawning for background work

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::error;

/// Spawn a background task whose panics are caught and logged instead of
/// silently unwinding. The surrounding process keeps running; only the
/// offending task dies.
pub fn spawn_guarded<F>(component: &'static str, id: impl Into<String>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let id = id.into();
    tokio::spawn(async move {
        let inner = tokio::spawn(fut);
        if let Err(err) = inner.await {
            if err.is_panic() {
                let panic = err.into_panic();
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(component, id, panic = %msg, "Background task panicked");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_is_contained() {
        let handle = spawn_guarded("test", "boom", async {
            panic!("deliberate");
        });
        // The guard task itself must complete without propagating the panic.
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_normal_completion() {
        let handle = spawn_guarded("test", "fine", async {});
        assert!(handle.await.is_ok());
    }
}
