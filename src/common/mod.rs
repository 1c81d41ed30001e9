pub mod config;
pub mod error;
pub mod types;

pub use config::{AlgorithmParams, CoreConfig, EngineConfig, LivenessConfig, StrategyConfig};
pub use error::{AccessError, Result};
pub use types::{
    AccessType, DeviceStatus, Modality, NetworkType, OperationIdGenerator, RiskLevel,
    SecurityLevel, UserStatus,
};
