//! Error taxonomy for the analytics engine

use std::fmt;

/// Failures surfaced to callers of the engine.
///
/// Per-cell problems (a descriptor undefined for one series, an empty
/// resample bin) are represented as absent values, not as errors. These
/// variants cover the cases where an operation cannot produce a result at
/// all for the entity it was asked about.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A selector or numeric parameter is outside the accepted domain.
    InvalidParameter(String),
    /// A series is too short for the requested computation.
    InsufficientData {
        entity: String,
        needed: usize,
        actual: usize,
    },
    /// No candidate lag had enough overlapping points.
    InsufficientOverlap { needed: usize, best: usize },
    /// A referenced sensor or stress id is absent from the input tables.
    MissingKey { key: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            EngineError::InsufficientData {
                entity,
                needed,
                actual,
            } => write!(
                f,
                "insufficient data for {}: {} points required, {} present",
                entity, needed, actual
            ),
            EngineError::InsufficientOverlap { needed, best } => write!(
                f,
                "no lag reaches the minimum overlap of {} points (best overlap {})",
                needed, best
            ),
            EngineError::MissingKey { key } => write!(f, "unknown sensor or stress id: {}", key),
        }
    }
}

impl std::error::Error for EngineError {}

pub type Result<T> = std::result::Result<T, EngineError>;
