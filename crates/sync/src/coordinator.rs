//! Per-network sync lifecycle.
//!
//! `start` spawns three tasks sharing one cancellation channel:
//!
//! - backfill: aggregate catch-up, then heights from the resume point to the
//!   head observed at start
//! - live: the node's push feed, resubscribing on failure
//! - monitor: phase completion checks and aggregate catch-up on an interval
//!
//! `stop` flips the channel and waits for all three. The live feed ends right
//! away; a backfill batch already being ingested finishes first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stakeidx_chain_index::{Clock, IndexStore};
use stakeidx_operations::config::SyncConfig;
use stakeidx_operations::ShutdownAware;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backfill::Backfill;
use crate::client::ChainClient;
use crate::error::{SyncError, SyncResult};
use crate::ingest::Ingestor;
use crate::live::LiveFeed;
use crate::retry::RetryPolicy;
use crate::status::{StatusHandle, SyncStatus};

/// Tunables for one network's sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Heights per backfill batch, also the live drain limit.
    pub batch_size: u64,
    pub bootstrap_window: u64,
    /// Batch-level retry for node calls.
    pub retry: RetryPolicy,
    pub live_enabled: bool,
    pub resubscribe_delay: Duration,
    pub phase_check_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            bootstrap_window: config.bootstrap_window,
            retry: RetryPolicy::from_config(config),
            live_enabled: config.live_enabled,
            resubscribe_delay: Duration::from_millis(config.resubscribe_delay_ms),
            phase_check_interval: Duration::from_secs(config.phase_check_interval_secs.max(1)),
        }
    }
}

/// Resolves once `cancel` holds `true` or its sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

struct Running {
    cancel: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Drives backfill and live ingestion for one network.
pub struct SyncCoordinator<C, S> {
    network: String,
    component_name: String,
    client: Arc<C>,
    ingestor: Arc<Ingestor<S>>,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
    status: StatusHandle,
    running: Mutex<Option<Running>>,
}

impl<C, S> SyncCoordinator<C, S>
where
    C: ChainClient + 'static,
    S: IndexStore + 'static,
{
    pub fn new(
        client: Arc<C>,
        ingestor: Arc<Ingestor<S>>,
        settings: SyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let network = ingestor.network().to_string();
        Self {
            component_name: format!("sync:{network}"),
            status: StatusHandle::new(&network),
            network,
            client,
            ingestor,
            settings,
            clock,
            running: Mutex::new(None),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn ingestor(&self) -> &Arc<Ingestor<S>> {
        &self.ingestor
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Begin ingestion. Fails with `AlreadyRunning` if already started.
    pub fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SyncError::AlreadyRunning(self.network.clone()));
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        let backfill = Backfill::new(
            Arc::clone(&self.client),
            Arc::clone(&self.ingestor),
            self.settings.clone(),
            self.status.clone(),
            Arc::clone(&self.clock),
        );
        let ingestor = Arc::clone(&self.ingestor);
        let status = self.status.clone();
        let rx = cancel_rx.clone();
        tasks.push((
            "backfill",
            tokio::spawn(async move {
                catch_up(&ingestor).await;
                if let Err(e) = backfill.run(rx).await {
                    tracing::error!(network = %ingestor.network(), error = %e, "Backfill aborted");
                    status.update(|s| s.last_error = Some(e.to_string()));
                }
            }),
        ));

        if self.settings.live_enabled {
            let live = LiveFeed::new(
                Arc::clone(&self.client),
                Arc::clone(&self.ingestor),
                self.settings.clone(),
                self.status.clone(),
            );
            let rx = cancel_rx.clone();
            tasks.push(("live", tokio::spawn(async move { live.run(rx).await })));
        }

        tasks.push((
            "monitor",
            tokio::spawn(monitor(
                Arc::clone(&self.client),
                Arc::clone(&self.ingestor),
                Arc::clone(&self.clock),
                self.settings.phase_check_interval,
                cancel_rx,
            )),
        ));

        *running = Some(Running { cancel, tasks });
        self.status.update(|s| {
            s.running = true;
            s.last_error = None;
        });
        tracing::info!(network = %self.network, live = self.settings.live_enabled, "Sync started");
        Ok(())
    }

    /// Run one phase completion pass against the current head.
    pub async fn run_phase_check(&self) -> SyncResult<()> {
        let head = self.client.current_height().await?;
        check_phases(&self.ingestor, self.clock.now_secs(), head).await;
        Ok(())
    }

    /// Halt ingestion and wait for the tasks to wind down. No-op when stopped.
    pub async fn stop(&self) -> SyncResult<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.cancel.send(true);

        let mut failed = None;
        for (task, handle) in running.tasks {
            if let Err(e) = handle.await {
                tracing::error!(network = %self.network, task, error = %e, "Sync task failed");
                failed = Some(SyncError::from(e));
            }
        }

        self.status.update(|s| {
            s.running = false;
            s.live_connected = false;
        });
        tracing::info!(network = %self.network, "Sync stopped");
        failed.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl<C, S> ShutdownAware for SyncCoordinator<C, S>
where
    C: ChainClient + 'static,
    S: IndexStore + 'static,
{
    fn name(&self) -> &str {
        &self.component_name
    }

    async fn shutdown(&self, _timeout: Duration) {
        if let Err(e) = self.stop().await {
            tracing::warn!(network = %self.network, error = %e, "Sync did not stop cleanly");
        }
    }
}

/// Replay log rows whose aggregate update never landed.
async fn catch_up<S: IndexStore + 'static>(ingestor: &Ingestor<S>) {
    let reindexer = Arc::clone(ingestor.reindexer());
    match tokio::task::spawn_blocking(move || reindexer.catch_up()).await {
        Ok(Ok(report)) if report.applied > 0 || !report.failed.is_empty() => {
            tracing::info!(
                network = %ingestor.network(),
                applied = report.applied,
                failed = report.failed.len(),
                "Aggregate catch-up"
            );
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::warn!(network = %ingestor.network(), error = %e, "Aggregate catch-up failed");
        }
        Err(e) => {
            tracing::warn!(network = %ingestor.network(), error = %e, "Aggregate catch-up task failed");
        }
    }
}

async fn monitor<C, S>(
    client: Arc<C>,
    ingestor: Arc<Ingestor<S>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) where
    C: ChainClient + 'static,
    S: IndexStore + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; let the backfill get going first.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancelled(&mut cancel) => break,
        }

        match client.current_height().await {
            Ok(head) => check_phases(&ingestor, clock.now_secs(), head).await,
            Err(e) => {
                tracing::debug!(network = %ingestor.network(), error = %e, "Skipping phase check; head unknown");
            }
        }
        catch_up(&ingestor).await;
    }
}

/// Complete every phase whose trigger holds and drop its cached statistics.
pub async fn check_phases<S: IndexStore + 'static>(ingestor: &Ingestor<S>, now: u64, head: u64) {
    let accountant = Arc::clone(ingestor.accountant());
    match tokio::task::spawn_blocking(move || accountant.check_completion(now, head)).await {
        Ok(Ok(completed)) => {
            if let Some(invalidation) = ingestor.invalidation() {
                for stats in &completed {
                    invalidation.on_phase_completed(stats.phase);
                }
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(network = %ingestor.network(), error = %e, "Phase completion check failed");
        }
        Err(e) => {
            tracing::warn!(network = %ingestor.network(), error = %e, "Phase completion task failed");
        }
    }
}
