//! Periodic driver for the reconciliation controller.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controller::Reconciler;
use crate::error::ProbeError;

/// Runs a [`Reconciler`] on a fixed schedule until shut down.
pub struct FleetService {
    reconciler: Arc<Reconciler>,
    period: Duration,
}

impl FleetService {
    /// Run `reconciler` every `period`, starting immediately.
    pub fn new(reconciler: Arc<Reconciler>, period: Duration) -> Self {
        Self { reconciler, period }
    }

    /// Loop until `shutdown` is cancelled. A cycle in flight is finished
    /// before returning; failed cycles are logged and retried next period.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProbeError> {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period_secs = self.period.as_secs(), "fleet service started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reconciler.run_cycle().await {
                Ok(report) if report.is_noop() => info!("fleet already reconciled"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "reconciliation cycle failed"),
            }
        }

        info!("fleet service stopped");
        Ok(())
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn cancel_on_signals(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
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
    let _ = tokio::signal::ctrl_c().await;
}
