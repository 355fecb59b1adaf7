//! Error taxonomy shared by every component.
//!
//! Local validation errors (`EmptyDimension`, `InvalidPeriodExpression`,
//! `InvalidDescriptor`) are raised before any network I/O. Upstream errors
//! carry the endpoint family and a dimension summary so that "no data"
//! complaints can be told apart from outages.

use thiserror::Error;

use crate::models::{Dimension, EndpointFamily};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A required query dimension (`dx`, `pe`, `ou`) is absent or empty.
    #[error("query dimension '{which}' must not be empty")]
    EmptyDimension { which: Dimension },

    /// A period keyword is unknown or a concrete period code is malformed.
    #[error("invalid period expression '{expr}'")]
    InvalidPeriodExpression { expr: String },

    /// The descriptor string is structurally malformed.
    #[error("invalid query descriptor: {message}")]
    InvalidDescriptor { message: String },

    /// Network, HTTP, or authentication failure talking to the upstream source.
    #[error("upstream {endpoint} unavailable ({summary}): {cause}")]
    UpstreamUnavailable {
        endpoint: EndpointFamily,
        summary: String,
        cause: String,
    },

    /// The upstream source answered 2xx but the body had the wrong shape.
    #[error("upstream {endpoint} returned a malformed payload: {message}")]
    UpstreamMalformed {
        endpoint: EndpointFamily,
        message: String,
    },

    /// A boundary feature whose coordinates resolve to no geometry type.
    #[error("invalid geometry for feature '{feature_id}': {reason}")]
    InvalidGeometry { feature_id: String, reason: String },

    /// Two distinct labels ended up with the same column name.
    #[error("column name collision on '{name}'")]
    ColumnCollision { name: String },

    /// A reconciled column reference does not name any dataset column.
    #[error("column reference '{reference}' does not match any dataset column")]
    UnknownColumn { reference: String },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Stable machine-readable code used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::EmptyDimension { .. } => "empty_dimension",
            BridgeError::InvalidPeriodExpression { .. } => "invalid_period",
            BridgeError::InvalidDescriptor { .. } => "invalid_descriptor",
            BridgeError::UpstreamUnavailable { .. } => "upstream_unavailable",
            BridgeError::UpstreamMalformed { .. } => "upstream_malformed",
            BridgeError::InvalidGeometry { .. } => "invalid_geometry",
            BridgeError::ColumnCollision { .. } => "column_collision",
            BridgeError::UnknownColumn { .. } => "unknown_column",
            BridgeError::DeadlineExceeded => "timeout",
            BridgeError::Cancelled => "cancelled",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// Only upstream outages qualify; the adapter itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::UpstreamUnavailable { .. })
    }

    /// Whether the error was raised by local validation, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::EmptyDimension { .. }
                | BridgeError::InvalidPeriodExpression { .. }
                | BridgeError::InvalidDescriptor { .. }
                | BridgeError::UnknownColumn { .. }
        )
    }
}
