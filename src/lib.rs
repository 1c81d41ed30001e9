// Core modules
pub mod access;
pub mod algorithm;
pub mod common;
pub mod engine;
pub mod liveness;
pub mod strategy;

// Re-export commonly used types
pub use access::{AccessController, AccessDecision, AccessRequest, EmergencyType};
pub use algorithm::{
    AlgorithmStatus, BatchResult, BiometricAlgorithm, BiometricResult, ModalityAlgorithm,
    PerformanceMetrics,
};
pub use common::{
    AccessError, AccessType, CoreConfig, DeviceStatus, Modality, NetworkType, Result, RiskLevel,
    SecurityLevel, UserStatus,
};
pub use engine::fusion::{fuse, FusionStrategy};
pub use engine::{AuthRequest, MultimodalRequest, RecognitionEngine};
pub use liveness::{ChallengeType, LivenessEngine};
pub use strategy::{AuthStrategy, RequestContext, StrategyManager, StrategyStatus};
