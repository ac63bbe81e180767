//! Process-wide shutdown coordination.
//!
//! One root `CancellationToken` per process. Connections take child tokens
//! so a Ctrl-C reaches every pending request, while a single dropped
//! connection does not stop the process.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to all spawned tasks
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Register a task handle for shutdown coordination
    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Cancel from a Ctrl-C in the background; the token fires either way.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
                    }
                    token.cancel();
                }
            }
        })
    }

    /// Cancel everything and wait (bounded) for registered tasks.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();

        let shutdown_tasks = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });

        match tokio::time::timeout(JOIN_TIMEOUT, shutdown_tasks).await {
            Ok(_) => {
                tracing::info!("✓ All tasks shut down gracefully");
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
