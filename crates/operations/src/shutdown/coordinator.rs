//! Ordered shutdown of the daemon's components.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::errors::ShutdownError;
use crate::shutdown::components::ShutdownAware;
use crate::shutdown::signals::ShutdownReason;

/// Stops components in reverse registration order.
///
/// The daemon registers the cache sweepers before the network registry, so
/// every sync task is stopped before the caches it invalidates.
pub struct ShutdownCoordinator {
    components: Mutex<Vec<Arc<dyn ShutdownAware>>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// `timeout` bounds each component separately.
    pub fn new(timeout: Duration) -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            timeout,
        }
    }

    pub async fn register(&self, component: Arc<dyn ShutdownAware>) {
        tracing::debug!(component = component.name(), "Registered for shutdown");
        self.components.lock().await.push(component);
    }

    /// Names in the order they will be stopped.
    pub async fn stop_order(&self) -> Vec<String> {
        self.components
            .lock()
            .await
            .iter()
            .rev()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Stop everything registered. A component that overruns the timeout is
    /// abandoned and the rest still stop; overrunning names come back in
    /// `ShutdownError::Incomplete`.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Result<(), ShutdownError> {
        let components = std::mem::take(&mut *self.components.lock().await);
        tracing::info!(%reason, components = components.len(), "Shutting down");

        let mut timed_out = Vec::new();
        for component in components.into_iter().rev() {
            let name = component.name().to_string();
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, component.shutdown(self.timeout)).await {
                Ok(()) => tracing::info!(
                    component = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Stopped"
                ),
                Err(_) => {
                    tracing::warn!(component = %name, timeout = ?self.timeout, "Did not stop in time");
                    timed_out.push(name);
                }
            }
        }

        if timed_out.is_empty() {
            tracing::info!("Shutdown complete");
            Ok(())
        } else {
            Err(ShutdownError::Incomplete(timed_out))
        }
    }
}
