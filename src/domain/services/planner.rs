//! Distribution Planner
//!
//! Pure strategy selection and edge ranking for writes. Execution of a plan
//! lives in the application layer.

use crate::domain::value_objects::{DataKind, Strategy};

/// Load signals of one write target.
#[derive(Debug, Clone)]
pub struct EdgeCandidate {
    pub edge_id: String,
    /// Active stream channels for the written kind
    pub subscribers: usize,
    pub current_connections: u32,
    pub max_connections: u32,
    /// Rolling average latency in ms
    pub latency_ms: f64,
}

impl EdgeCandidate {
    /// `subscribers × (1 − connections/max) × 1/max(1, latency)`
    pub fn score(&self) -> f64 {
        let headroom = if self.max_connections == 0 {
            0.0
        } else {
            (1.0 - self.current_connections as f64 / self.max_connections as f64).max(0.0)
        };
        self.subscribers as f64 * headroom / self.latency_ms.max(1.0)
    }
}

/// Edges split into the synchronous and background halves of an
/// intelligent write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntelligentPlan {
    pub synchronous: Vec<String>,
    pub background: Vec<String>,
}

pub struct DistributionPlanner;

impl DistributionPlanner {
    /// Fixed kind to strategy mapping.
    pub fn strategy_for(kind: &DataKind) -> Strategy {
        match kind {
            DataKind::MarketPrices | DataKind::TradeExecutions => Strategy::PushAll,
            DataKind::AgentPositions | DataKind::EconomicIndicators => Strategy::OriginLazy,
            DataKind::OrderBook | DataKind::VolatilityData => Strategy::Intelligent,
            DataKind::TradeVolumes | DataKind::Custom(_) => Strategy::Intelligent,
        }
    }

    /// Rank candidates by descending score; ties go to the lowest edge id.
    pub fn rank(mut candidates: Vec<EdgeCandidate>) -> Vec<EdgeCandidate> {
        candidates.sort_by(|a, b| {
            b.score()
                .total_cmp(&a.score())
                .then_with(|| a.edge_id.cmp(&b.edge_id))
        });
        candidates
    }

    /// Rank and split candidates; the top `sync_fanout` are written inline.
    pub fn plan_intelligent(candidates: Vec<EdgeCandidate>, sync_fanout: usize) -> IntelligentPlan {
        let mut ranked = Self::rank(candidates).into_iter().map(|c| c.edge_id);
        let synchronous = ranked.by_ref().take(sync_fanout).collect();
        let background = ranked.collect();
        IntelligentPlan {
            synchronous,
            background,
        }
    }
}
