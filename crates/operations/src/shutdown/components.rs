//! Components stopped by the `ShutdownCoordinator`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Something the daemon stops on shutdown: the network registry, the cache
/// sweepers.
#[async_trait]
pub trait ShutdownAware: Send + Sync {
    fn name(&self) -> &str;

    /// Stop, waiting at most `timeout` for in-flight work.
    async fn shutdown(&self, timeout: Duration);
}

/// Background tasks that share one stop flag, such as the cache sweepers
/// started by `StakingQueryService::spawn_sweepers`.
pub struct TaskGroup {
    name: String,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            name: name.into(),
            stop,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receiver handed to each task; flips to `true` on shutdown.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub async fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.lock().await.extend(handles);
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl ShutdownAware for TaskGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self, timeout: Duration) {
        self.stop.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let count = tasks.len();
        let joined = tokio::time::timeout(timeout, join_counting_failures(tasks)).await;
        match joined {
            Ok(failed) if failed > 0 => {
                tracing::warn!(group = %self.name, failed, "Tasks ended abnormally")
            }
            Ok(_) => tracing::debug!(group = %self.name, count, "Tasks stopped"),
            Err(_) => tracing::warn!(group = %self.name, count, "Tasks still running after timeout"),
        }
    }
}

/// Await every handle, counting the ones that panicked or were aborted.
async fn join_counting_failures(tasks: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for task in tasks {
        if task.await.is_err() {
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sweeper(mut stop: watch::Receiver<bool>, ticks: Arc<AtomicUsize>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_task_group_stops_tracked_tasks() {
        let group = TaskGroup::new("cache-sweepers");
        let ticks = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| sweeper(group.stop_signal(), ticks.clone()))
            .collect();
        group.track(handles).await;
        assert_eq!(group.task_count().await, 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        group.shutdown(Duration::from_secs(1)).await;

        assert_eq!(group.task_count().await, 0);
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_task_group_gives_up_on_stuck_task() {
        let group = TaskGroup::new("stuck");
        group
            .track([tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
            })])
            .await;

        let start = std::time::Instant::now();
        group.shutdown(Duration::from_millis(20)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
