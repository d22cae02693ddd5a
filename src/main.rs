//! edge-fabric - Global Edge Distribution Core
//!
//! Composition root: wires the edges, the fabric service, the maintenance
//! loops and the HTTP API together.

use edge_fabric::adapters::inbound::{ApiServer, ApiState};
use edge_fabric::adapters::outbound::{DashMapMetricsStore, SystemClock};
use edge_fabric::application::{spawn_maintenance, FabricService, MaintenanceIntervals};
use edge_fabric::infrastructure::{shutdown_signal, ShutdownController};
use edge_fabric::{load_config, load_topology};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

/// How long open streams get to close after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let topology = load_topology(&cfg)?;
    tracing::info!(
        "starting edge-fabric listen={} regions={} edges={}",
        cfg.api_listen_addr,
        topology.regions().len(),
        topology.edges().len()
    );

    // ===== COMPOSITION ROOT =====

    let metrics = Arc::new(DashMapMetricsStore::new());
    let service = Arc::new(FabricService::new(
        &cfg,
        topology,
        metrics,
        Arc::new(SystemClock),
    ));

    let shutdown = ShutdownController::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let loops = spawn_maintenance(
        service.clone(),
        MaintenanceIntervals::from(&cfg),
        shutdown.clone(),
    );

    let server = ApiServer::new(
        cfg.api_listen_addr.clone(),
        ApiState::new(service.clone(), shutdown.clone()),
    );
    let served = server.run().await;

    // Server stopped: either shutdown or a bind/serve failure
    shutdown.shutdown();
    shutdown.wait_for_drain(DRAIN_TIMEOUT).await;
    let closed = service.close_streams();
    for handle in loops {
        let _ = handle.await;
    }
    tracing::info!(closed_streams = closed, "edge-fabric stopped");

    served
}
