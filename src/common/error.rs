use thiserror::Error;

use crate::common::types::Modality;

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No algorithm registered for modality: {0}")]
    UnknownModality(Modality),

    #[error("Algorithm for {modality} is not ready (status: {status})")]
    AlgorithmUnavailable { modality: Modality, status: String },

    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Strategy {id} is not active (status: {status})")]
    StrategyInactive { id: String, status: String },

    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("No applicable authentication strategy for this request")]
    NoApplicableStrategy,

    #[error("Strategy preconditions not met: {0}")]
    PreconditionFailed(String),

    #[error("Controller is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AccessError>;
