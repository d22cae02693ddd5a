//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical family of market data.
///
/// Each kind maps to a dedicated codec and a fixed distribution strategy.
/// Identifiers outside the known set are carried as [`DataKind::Custom`]
/// and stored uncompressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    MarketPrices,
    TradeExecutions,
    TradeVolumes,
    OrderBook,
    VolatilityData,
    AgentPositions,
    EconomicIndicators,
    /// Any other non-empty identifier
    Custom(String),
}

impl DataKind {
    /// Parse a kind identifier.
    ///
    /// Returns None for empty or whitespace-only identifiers.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return None;
        }
        let kind = match trimmed.to_lowercase().as_str() {
            "market_prices" => Self::MarketPrices,
            "trade_executions" => Self::TradeExecutions,
            "trade_volumes" => Self::TradeVolumes,
            "order_book" => Self::OrderBook,
            "volatility_data" => Self::VolatilityData,
            "agent_positions" => Self::AgentPositions,
            "economic_indicators" => Self::EconomicIndicators,
            _ => Self::Custom(trimmed.to_string()),
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::MarketPrices => "market_prices",
            Self::TradeExecutions => "trade_executions",
            Self::TradeVolumes => "trade_volumes",
            Self::OrderBook => "order_book",
            Self::VolatilityData => "volatility_data",
            Self::AgentPositions => "agent_positions",
            Self::EconomicIndicators => "economic_indicators",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Whether this kind is one the fabric knows a codec and strategy for.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DataKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom("data kind must not be empty"))
    }
}

/// Geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// A coordinate is valid when both components are finite and in range.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Health state of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    /// Eligible for every path
    Active,
    /// Excluded from primary selection, still usable for fallback reads
    Degraded,
    /// Excluded from all paths
    Disabled,
}

impl EdgeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "degraded" => Some(Self::Degraded),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Disabled => "disabled",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Degraded => 1,
            Self::Disabled => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Degraded,
            _ => Self::Disabled,
        }
    }
}

impl fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Region status shares the edge lifecycle.
pub type RegionStatus = EdgeStatus;

/// Tag identifying how a stored payload must be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecId {
    Identity,
    Delta,
    #[serde(rename = "rle")]
    RunLength,
    Quantized,
    BookDiff,
}

impl CodecId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Delta => "delta",
            Self::RunLength => "rle",
            Self::Quantized => "quantized",
            Self::BookDiff => "book_diff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "identity" => Some(Self::Identity),
            "delta" => Some(Self::Delta),
            "rle" => Some(Self::RunLength),
            "quantized" => Some(Self::Quantized),
            "book_diff" => Some(Self::BookDiff),
            _ => None,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write strategy chosen by the distribution planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Synchronous write to every active edge
    PushAll,
    /// Origin region synchronously, other regions through the propagation queue
    OriginLazy,
    /// Top-ranked edges synchronously, the rest in the background
    Intelligent,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PushAll => "push_all",
            Self::OriginLazy => "origin_lazy",
            Self::Intelligent => "intelligent",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    Primary,
    Fallback,
}
