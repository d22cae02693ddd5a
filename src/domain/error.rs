//! Fabric errors
//!
//! Every failure the distribution core can surface to a caller.

use crate::domain::value_objects::{CodecId, DataKind};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, FabricError>;

/// Error raised by a codec while encoding or decoding a payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed {kind} value: {reason}")]
    MalformedValue { kind: String, reason: String },
    #[error("cannot decode {codec} payload: {reason}")]
    Corrupt { codec: CodecId, reason: String },
}

/// A write that failed on one edge during fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeWriteError {
    pub edge_id: String,
    pub error: String,
    pub retriable: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FabricError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("edge {edge_id} is unavailable ({status})")]
    EdgeUnavailable { edge_id: String, status: String },

    #[error("capacity exhausted on {scope}: {reason}")]
    CapacityExhausted { scope: String, reason: String },

    #[error("{operation} on edge {edge_id} timed out after {timeout_ms}ms")]
    Timeout {
        edge_id: String,
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("no fresh entry for {kind}/{key}")]
    NotFound { kind: DataKind, key: String },

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("fatal invariant violation on edge {edge_id}: {reason}")]
    Fatal { edge_id: String, reason: String },

    #[error("distribution of {kind} reached no edge ({} failures)", errors.len())]
    DistributionFailed {
        kind: DataKind,
        errors: Vec<EdgeWriteError>,
    },
}

impl FabricError {
    /// Whether the caller may retry the same operation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::EdgeUnavailable { .. }
                | Self::CapacityExhausted { .. }
                | Self::Timeout { .. }
                | Self::DistributionFailed { .. }
        )
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::EdgeUnavailable { .. } => "edge_unavailable",
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::NotFound { .. } => "not_found",
            Self::DecodingFailed(_) => "decoding_failed",
            Self::Fatal { .. } => "fatal",
            Self::DistributionFailed { .. } => "distribution_failed",
        }
    }
}

impl From<CodecError> for FabricError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedValue { .. } => Self::InvalidInput(err.to_string()),
            CodecError::Corrupt { .. } => Self::DecodingFailed(err.to_string()),
        }
    }
}
