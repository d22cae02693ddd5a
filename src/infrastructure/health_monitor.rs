//! Edge Health Monitor
//!
//! Tracks windowed operation outcomes per edge and moves edges between
//! active and degraded when their error rate crosses a threshold.

use crate::infrastructure::edge_node::EdgeNode;
use crate::domain::value_objects::EdgeStatus;
use dashmap::DashMap;
use std::sync::Arc;

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Error rate above which an edge is degraded
    pub error_threshold: f64,
    /// Length of the counting window
    pub window_ms: u64,
    /// Operations required in a window before the rate is trusted
    pub min_samples: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            window_ms: 10_000,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Default)]
struct EdgeWindow {
    started_at_ms: u64,
    successes: u64,
    errors: u64,
    /// Degraded by this monitor rather than an operator
    degraded_by_monitor: bool,
}

impl EdgeWindow {
    fn total(&self) -> u64 {
        self.successes + self.errors
    }

    fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.errors as f64 / n as f64,
        }
    }
}

/// Status change applied by [`HealthMonitor::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthTransition {
    pub edge_id: String,
    pub from: EdgeStatus,
    pub to: EdgeStatus,
    pub error_rate: f64,
}

pub struct HealthMonitor {
    config: HealthMonitorConfig,
    windows: DashMap<String, EdgeWindow>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Record the outcome of one operation on an edge.
    pub fn record(&self, edge_id: &str, ok: bool, now_ms: u64) {
        let mut window = self
            .windows
            .entry(edge_id.to_string())
            .or_insert_with(|| EdgeWindow {
                started_at_ms: now_ms,
                ..Default::default()
            });
        if ok {
            window.successes += 1;
        } else {
            window.errors += 1;
        }
    }

    /// Error rate of the current window.
    pub fn error_rate(&self, edge_id: &str) -> f64 {
        self.windows
            .get(edge_id)
            .map(|w| w.error_rate())
            .unwrap_or(0.0)
    }

    /// Stop tracking monitor ownership of an edge's status.
    ///
    /// Called when an operator sets the status explicitly.
    pub fn release(&self, edge_id: &str) {
        if let Some(mut window) = self.windows.get_mut(edge_id) {
            window.degraded_by_monitor = false;
        }
    }

    /// Apply health transitions to the given edges.
    ///
    /// An active edge whose error rate exceeds the threshold (over at least
    /// `min_samples` operations) becomes degraded. An edge degraded here
    /// returns to active once a full window passes without errors.
    pub fn evaluate(&self, edges: &[Arc<EdgeNode>], now_ms: u64) -> Vec<HealthTransition> {
        let mut transitions = Vec::new();

        for edge in edges {
            let Some(mut window) = self.windows.get_mut(edge.id()) else {
                continue;
            };

            let rate = window.error_rate();
            if window.total() >= self.config.min_samples
                && rate > self.config.error_threshold
                && edge.transition_status(EdgeStatus::Active, EdgeStatus::Degraded)
            {
                window.degraded_by_monitor = true;
                tracing::warn!(
                    edge = %edge.id(),
                    error_rate = rate,
                    "edge degraded by health monitor"
                );
                transitions.push(HealthTransition {
                    edge_id: edge.id().to_string(),
                    from: EdgeStatus::Active,
                    to: EdgeStatus::Degraded,
                    error_rate: rate,
                });
            }

            if now_ms.saturating_sub(window.started_at_ms) < self.config.window_ms {
                continue;
            }

            // Window elapsed: a clean one restores edges this monitor degraded
            if window.degraded_by_monitor && window.errors == 0 {
                if edge.transition_status(EdgeStatus::Degraded, EdgeStatus::Active) {
                    tracing::info!(edge = %edge.id(), "edge recovered");
                    transitions.push(HealthTransition {
                        edge_id: edge.id().to_string(),
                        from: EdgeStatus::Degraded,
                        to: EdgeStatus::Active,
                        error_rate: rate,
                    });
                }
                window.degraded_by_monitor = false;
            }

            window.started_at_ms = now_ms;
            window.successes = 0;
            window.errors = 0;
        }

        transitions
    }
}
