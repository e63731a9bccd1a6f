//! Termination signals turned into a shutdown request.

use std::fmt;

use tokio::sync::watch;

/// Why the daemon is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    /// Requested from inside the process, e.g. a fatal task error.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "{name}"),
            Self::Requested => f.write_str("requested"),
        }
    }
}

/// Broadcasts the first shutdown reason to every subscriber.
pub struct SignalHandler {
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl SignalHandler {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self { reason }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.reason.subscribe()
    }

    /// Spawn the task listening for SIGTERM and SIGINT (Ctrl-C elsewhere).
    pub fn start(&self) {
        let reason = self.reason.clone();
        tokio::spawn(async move {
            let name = wait_for_signal().await;
            tracing::info!(signal = name, "Received termination signal");
            record(&reason, ShutdownReason::Signal(name));
        });
    }

    pub fn trigger(&self) {
        record(&self.reason, ShutdownReason::Requested);
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.borrow()
    }

    /// Resolve with the reason once shutdown has been requested.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|r| *r);
        match result {
            Ok(Some(reason)) => reason,
            // The sender lives in `self`, so the channel cannot close here.
            _ => ShutdownReason::Requested,
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep the first reason; a second Ctrl-C does not overwrite SIGTERM.
fn record(tx: &watch::Sender<Option<ShutdownReason>>, reason: ShutdownReason) {
    tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        },
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Cannot install unix signal handlers, using ctrl-c");
            wait_for_ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for ctrl-c");
        // Only `trigger` can stop the daemon now.
        std::future::pending::<()>().await;
    }
    "ctrl-c"
}
