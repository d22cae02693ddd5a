//! Maintenance Loops
//!
//! Periodic propagation drain, metrics refresh (with health evaluation)
//! and expiry sweep. Each loop skips missed ticks and stops on shutdown.

use crate::application::FabricService;
use crate::config::Config;
use crate::infrastructure::ShutdownController;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceIntervals {
    pub propagation_drain: Duration,
    pub metrics: Duration,
    pub expiry_sweep: Duration,
}

impl From<&Config> for MaintenanceIntervals {
    fn from(config: &Config) -> Self {
        Self {
            propagation_drain: Duration::from_millis(config.propagation_drain_interval_ms.max(1)),
            metrics: Duration::from_millis(config.metrics_interval_ms.max(1)),
            expiry_sweep: Duration::from_millis(config.expiry_sweep_interval_ms.max(1)),
        }
    }
}

/// Start the three maintenance loops.
pub fn spawn_maintenance(
    service: Arc<FabricService>,
    intervals: MaintenanceIntervals,
    shutdown: ShutdownController,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_loop("propagation", intervals.propagation_drain, shutdown.clone(), {
            let service = Arc::clone(&service);
            move || {
                let service = Arc::clone(&service);
                async move {
                    service.drain_propagation().await;
                }
            }
        }),
        spawn_loop("metrics", intervals.metrics, shutdown.clone(), {
            let service = Arc::clone(&service);
            move || {
                for t in service.evaluate_health() {
                    tracing::info!(
                        edge = %t.edge_id,
                        from = %t.from,
                        to = %t.to,
                        error_rate = t.error_rate,
                        "health transition"
                    );
                }
                service.refresh_metrics();
                std::future::ready(())
            }
        }),
        spawn_loop("expiry", intervals.expiry_sweep, shutdown, move || {
            let service = Arc::clone(&service);
            async move {
                service.sweep_expired().await;
            }
        }),
    ]
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: ShutdownController,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut rx = shutdown.subscribe();
        if shutdown.is_shutdown() {
            return;
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => pass().await,
                _ = rx.recv() => break,
            }
        }
        tracing::debug!(task = name, "maintenance loop stopped");
    })
}
