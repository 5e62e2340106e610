//! HTTP surface, metrics, leader election and shutdown
//!
//! Provides Kubernetes health probes and Prometheus metrics:
//! - `/healthz` - Liveness probe (process is running)
//! - `/readyz` - Readiness probe (controller loops started)
//! - `/metrics` - Prometheus metrics

mod health;
pub mod leader;
pub mod metrics;

pub use health::{run_health_server, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};

use tokio::sync::watch;
use tracing::{info, warn};

/// Receiving side of the process shutdown flag
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Trips every [`ShutdownSignal`] created with it
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was requested or the trigger is gone
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM, waiting for SIGINT only"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;

#[cfg(test)]
#[path = "leader_test.rs"]
mod leader_tests;
