pub mod matcher;
pub mod modalities;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::config::AlgorithmParams;
use crate::common::types::Modality;

pub use modalities::ModalityAlgorithm;

/// Lifecycle state of a registered algorithm. Only `Ready` serves calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmStatus {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    Error,
    Stopped,
}

impl fmt::Display for AlgorithmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlgorithmStatus::Uninitialized => "uninitialized",
            AlgorithmStatus::Initializing => "initializing",
            AlgorithmStatus::Ready => "ready",
            AlgorithmStatus::Busy => "busy",
            AlgorithmStatus::Error => "error",
            AlgorithmStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Outcome of a single enroll/delete/authenticate call. Immutable once built.
#[derive(Debug, Clone)]
pub struct BiometricResult {
    pub success: bool,
    pub confidence: f64,
    pub processing_time: Duration,
    pub message: String,
    pub template_id: Option<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BiometricResult {
    pub fn ok(
        confidence: f64,
        processing_time: Duration,
        message: impl Into<String>,
        template_id: Option<String>,
    ) -> Self {
        Self {
            success: true,
            confidence: confidence.clamp(0.0, 1.0),
            processing_time,
            message: message.into(),
            template_id,
            extra: serde_json::Map::new(),
        }
    }

    pub fn fail(processing_time: Duration, message: impl Into<String>) -> Self {
        Self {
            success: false,
            confidence: 0.0,
            processing_time,
            message: message.into(),
            template_id: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// Aggregate outcome of `batch_authenticate`.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub all_success: bool,
    pub success_count: usize,
    pub failure_count: usize,
    pub min_confidence: f64,
    pub avg_confidence: f64,
    pub max_confidence: f64,
    pub processing_time: Duration,
    pub results: Vec<BiometricResult>,
}

impl BatchResult {
    pub fn from_results(results: Vec<BiometricResult>, processing_time: Duration) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;

        let (min, max, sum) = results.iter().fold(
            (f64::MAX, f64::MIN, 0.0f64),
            |(min, max, sum), r| (min.min(r.confidence), max.max(r.confidence), sum + r.confidence),
        );
        let (min_confidence, max_confidence, avg_confidence) = if results.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (min, max, sum / results.len() as f64)
        };

        Self {
            all_success: !results.is_empty() && failure_count == 0,
            success_count,
            failure_count,
            min_confidence,
            avg_confidence,
            max_confidence,
            processing_time,
            results,
        }
    }
}

/// Cumulative call statistics reported by an algorithm.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub avg_processing_time_ms: f64,
    pub avg_confidence: f64,
    pub template_count: usize,
}

/// Capability contract every biometric modality implements.
///
/// Implementations must never panic across this boundary on bad input;
/// failures come back as `success = false` results with a reason. Every
/// call records its own processing time.
pub trait BiometricAlgorithm: Send + Sync {
    fn modality(&self) -> Modality;

    /// Prepare the algorithm for use. Returns false if it cannot become Ready.
    fn initialize(&self, params: &AlgorithmParams) -> bool;

    /// Create a new template from a raw sample. Re-enrollment creates a new
    /// template id; existing templates are never mutated.
    fn enroll(&self, user_id: u64, device_id: &str, sample: &[u8]) -> BiometricResult;

    fn delete(&self, template_id: &str) -> BiometricResult;

    /// Match a sample against a stored template. With no explicit template id
    /// the caller's most recently enrolled template for this modality is used.
    fn authenticate(
        &self,
        user_id: u64,
        device_id: &str,
        sample: &[u8],
        template_id: Option<&str>,
    ) -> BiometricResult;

    fn batch_authenticate(&self, user_id: u64, device_id: &str, samples: &[Vec<u8>]) -> BatchResult;

    fn status(&self) -> AlgorithmStatus;

    fn metrics(&self) -> PerformanceMetrics;

    /// Release resources and stop serving. Terminal; re-registration builds a
    /// fresh instance.
    fn cleanup(&self);
}
