//! Cancellation handle shared by the scheduler, the phase engine and the
//! agent subprocess supervisor.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owned by the scheduler and cloned into everything that may block.
///
/// `cancel` is the single way to stop: the running agent is terminated, the
/// in-flight task is rolled back and the loop returns.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    token: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("stop requested");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Route SIGINT and SIGTERM to `cancel`.
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            supervisor.cancel();
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(err = %err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
