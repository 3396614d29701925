use thiserror::Error;

/// Errors surfaced by block construction, training steps and data handling.
///
/// None of these are transient: every variant describes a configuration or
/// orchestration mistake that the caller has to fix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),
    #[error("ordering violation: {0}")]
    OrderingViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
