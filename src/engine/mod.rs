pub mod fusion;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::algorithm::{
    AlgorithmStatus, BiometricAlgorithm, BiometricResult, PerformanceMetrics,
};
use crate::common::config::EngineConfig;
use crate::common::error::{AccessError, Result};
use crate::common::types::{Modality, OperationIdGenerator, SecurityLevel};
use crate::engine::fusion::{fuse, FusionResult, FusionStrategy};
use crate::liveness::{ChallengeType, LivenessEngine, SessionStatus};

/// Single-modality authentication request.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub user_id: u64,
    pub device_id: String,
    pub modality: Modality,
    pub sample: Vec<u8>,
    pub template_id: Option<String>,
    pub security_level: SecurityLevel,
    pub require_liveness: bool,
}

/// Multi-modality authentication request. `samples` carries one raw sample
/// per requested modality, in dispatch order.
#[derive(Debug, Clone)]
pub struct MultimodalRequest {
    pub user_id: u64,
    pub device_id: String,
    pub security_level: SecurityLevel,
    pub samples: Vec<(Modality, Vec<u8>)>,
    pub fusion: FusionStrategy,
    pub require_liveness: bool,
    /// Overrides the engine default when set.
    pub confidence_threshold: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub operation_id: String,
    pub modality: Modality,
    pub result: BiometricResult,
    pub total_time: Duration,
}

#[derive(Debug, Clone)]
pub struct MultimodalOutcome {
    pub operation_id: String,
    pub success: bool,
    pub confidence: f64,
    pub fusion: FusionResult,
    pub sub_results: Vec<(Modality, BiometricResult)>,
    pub total_time: Duration,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub algorithms: HashMap<String, AlgorithmStatusReport>,
    pub statistics: EngineStatistics,
}

#[derive(Debug, Serialize)]
pub struct AlgorithmStatusReport {
    pub status: AlgorithmStatus,
    pub metrics: PerformanceMetrics,
}

#[derive(Debug, Default, Serialize)]
pub struct EngineStatistics {
    pub successful_authentications: u64,
    pub failed_authentications: u64,
    pub successful_multimodal: u64,
    pub failed_multimodal: u64,
    pub enrollments: u64,
    pub deletions: u64,
    pub avg_processing_time_ms: f64,
}

#[derive(Default)]
struct Counters {
    auth_success: AtomicU64,
    auth_failure: AtomicU64,
    multi_success: AtomicU64,
    multi_failure: AtomicU64,
    enrollments: AtomicU64,
    deletions: AtomicU64,
    total_ops: AtomicU64,
    total_time_us: AtomicU64,
}

struct EngineInner {
    registry: DashMap<Modality, Arc<dyn BiometricAlgorithm>>,
    liveness: Arc<LivenessEngine>,
    pool: Arc<Semaphore>,
    default_threshold: f64,
    counters: Counters,
    ids: OperationIdGenerator,
}

/// Registry of biometric algorithms plus the orchestration of single and
/// multimodal authentication over a bounded worker pool. Cheap to clone.
#[derive(Clone)]
pub struct RecognitionEngine {
    inner: Arc<EngineInner>,
}

impl RecognitionEngine {
    pub fn new(config: &EngineConfig, liveness: Arc<LivenessEngine>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: DashMap::new(),
                liveness,
                pool: Arc::new(Semaphore::new(config.worker_pool_size)),
                default_threshold: config.default_confidence_threshold,
                counters: Counters::default(),
                ids: OperationIdGenerator::new("AUTH"),
            }),
        }
    }

    pub fn liveness(&self) -> &Arc<LivenessEngine> {
        &self.inner.liveness
    }

    pub fn default_threshold(&self) -> f64 {
        self.inner.default_threshold
    }

    /// Initialize and register an algorithm. A failed `initialize` rejects the
    /// registration and leaves the registry unchanged.
    pub fn register(
        &self,
        algorithm: Arc<dyn BiometricAlgorithm>,
        params: &crate::common::config::AlgorithmParams,
    ) -> Result<()> {
        let modality = algorithm.modality();
        if !algorithm.initialize(params) {
            return Err(AccessError::Validation(format!(
                "Algorithm for {} failed to initialize",
                modality
            )));
        }
        self.inner.registry.insert(modality, algorithm);
        info!(%modality, "algorithm registered");
        Ok(())
    }

    pub fn unregister(&self, modality: Modality) -> Result<()> {
        match self.inner.registry.remove(&modality) {
            Some((_, algorithm)) => {
                algorithm.cleanup();
                info!(%modality, "algorithm unregistered");
                Ok(())
            }
            None => Err(AccessError::UnknownModality(modality)),
        }
    }

    pub fn registered_modalities(&self) -> Vec<Modality> {
        self.inner.registry.iter().map(|e| *e.key()).collect()
    }

    fn resolve_ready(&self, modality: Modality) -> Result<Arc<dyn BiometricAlgorithm>> {
        let algorithm = self
            .inner
            .registry
            .get(&modality)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(AccessError::UnknownModality(modality))?;

        let status = algorithm.status();
        if status != AlgorithmStatus::Ready {
            return Err(AccessError::AlgorithmUnavailable {
                modality,
                status: status.to_string(),
            });
        }
        Ok(algorithm)
    }

    fn validate_auth_request(request: &AuthRequest) -> Result<()> {
        if request.user_id == 0 {
            return Err(AccessError::Validation("User id is required".into()));
        }
        if request.device_id.is_empty() {
            return Err(AccessError::Validation("Device id is required".into()));
        }
        if request.sample.is_empty() {
            return Err(AccessError::Validation("Sample must not be empty".into()));
        }
        Ok(())
    }

    fn liveness_required(request: &AuthRequest) -> bool {
        // Only face samples can be replayed with a photograph; other
        // modalities are treated as trivially live.
        request.modality == Modality::Face
            && (request.require_liveness || request.security_level >= SecurityLevel::Medium)
    }

    /// Run the challenge sequence against the presented sample. Returns false
    /// on any terminal state other than Completed, including an evicted
    /// (timed-out) session.
    fn run_liveness_check(&self, request: &AuthRequest) -> bool {
        let challenge = if request.security_level >= SecurityLevel::High {
            ChallengeType::MultiChallenge
        } else {
            ChallengeType::TextureAnalysis
        };
        let session_id =
            self.inner
                .liveness
                .create_session(request.user_id, &request.device_id, challenge);

        loop {
            match self.inner.liveness.process_frame(&session_id, &request.sample) {
                Some(outcome) => match outcome.session_status {
                    SessionStatus::Completed => return true,
                    SessionStatus::Active => continue,
                    SessionStatus::Failed | SessionStatus::Timeout => return false,
                },
                None => return false,
            }
        }
    }

    fn record_op(&self, elapsed: Duration) {
        self.inner.counters.total_ops.fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.inner.pool)
            .acquire_owned()
            .await
            .map_err(|_| AccessError::ShuttingDown)
    }

    /// Authenticate one sample against one modality. Algorithm panics are
    /// contained at this boundary and come back as failed results.
    pub async fn authenticate(&self, request: AuthRequest) -> Result<AuthOutcome> {
        let start = Instant::now();
        let operation_id = self.inner.ids.next();
        let _permit = self.acquire_permit().await?;

        Self::validate_auth_request(&request)?;
        let algorithm = self.resolve_ready(request.modality)?;

        if Self::liveness_required(&request) && !self.run_liveness_check(&request) {
            let result = BiometricResult::fail(start.elapsed(), "Liveness check failed");
            self.inner.counters.auth_failure.fetch_add(1, Ordering::Relaxed);
            self.record_op(start.elapsed());
            warn!(operation_id = %operation_id, user_id = request.user_id, "liveness rejection");
            return Ok(AuthOutcome {
                operation_id,
                modality: request.modality,
                result,
                total_time: start.elapsed(),
            });
        }

        let modality = request.modality;
        let handle = tokio::task::spawn_blocking(move || {
            algorithm.authenticate(
                request.user_id,
                &request.device_id,
                &request.sample,
                request.template_id.as_deref(),
            )
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(%modality, error = %join_err, "algorithm task aborted");
                BiometricResult::fail(start.elapsed(), "Algorithm task aborted unexpectedly")
            }
        };

        if result.success {
            self.inner.counters.auth_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.counters.auth_failure.fetch_add(1, Ordering::Relaxed);
        }
        self.record_op(start.elapsed());

        debug!(
            operation_id = %operation_id,
            %modality,
            success = result.success,
            confidence = result.confidence,
            "authentication finished"
        );

        Ok(AuthOutcome {
            operation_id,
            modality,
            result,
            total_time: start.elapsed(),
        })
    }

    /// Fan one sub-request per modality onto the pool, wait for all of them,
    /// then fuse. A failed or aborted sub-task never cancels its siblings.
    pub async fn authenticate_multimodal(
        &self,
        request: MultimodalRequest,
    ) -> Result<MultimodalOutcome> {
        let start = Instant::now();
        let operation_id = self.inner.ids.next();

        if request.samples.is_empty() {
            return Err(AccessError::Validation(
                "Multimodal request carries no samples".into(),
            ));
        }

        let mut distinct: Vec<Modality> = request.samples.iter().map(|(m, _)| *m).collect();
        distinct.sort_by_key(|m| m.as_str());
        distinct.dedup();
        let required = request.security_level.min_modalities();
        if distinct.len() < required {
            return Err(AccessError::Validation(format!(
                "Security level {} requires at least {} distinct modalities, got {}",
                request.security_level,
                required,
                distinct.len()
            )));
        }

        let threshold = request
            .confidence_threshold
            .unwrap_or(self.inner.default_threshold);

        let mut handles = Vec::with_capacity(request.samples.len());
        for (modality, sample) in &request.samples {
            let engine = self.clone();
            let sub_request = AuthRequest {
                user_id: request.user_id,
                device_id: request.device_id.clone(),
                modality: *modality,
                sample: sample.clone(),
                template_id: None,
                security_level: request.security_level,
                require_liveness: request.require_liveness,
            };
            let modality = *modality;
            handles.push((
                modality,
                tokio::spawn(async move { engine.authenticate(sub_request).await }),
            ));
        }

        let mut sub_results = Vec::with_capacity(handles.len());
        for (modality, handle) in handles {
            let result = match handle.await {
                Ok(Ok(outcome)) => outcome.result,
                Ok(Err(err)) => {
                    warn!(%modality, error = %err, "sub-authentication rejected");
                    BiometricResult::fail(start.elapsed(), err.to_string())
                }
                Err(join_err) => {
                    error!(%modality, error = %join_err, "sub-authentication task aborted");
                    BiometricResult::fail(start.elapsed(), "Sub-authentication task aborted")
                }
            };
            sub_results.push((modality, result));
        }

        let fusion = fuse(&sub_results, request.fusion, threshold);
        if fusion.success {
            self.inner.counters.multi_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.counters.multi_failure.fetch_add(1, Ordering::Relaxed);
        }
        self.record_op(start.elapsed());

        info!(
            operation_id = %operation_id,
            user_id = request.user_id,
            success = fusion.success,
            confidence = fusion.confidence,
            strategy = ?request.fusion,
            "multimodal authentication finished"
        );

        Ok(MultimodalOutcome {
            operation_id,
            success: fusion.success,
            confidence: fusion.confidence,
            fusion,
            sub_results,
            total_time: start.elapsed(),
        })
    }

    /// Enroll a new template. Honors the liveness-required flag for face
    /// samples before the sample reaches the algorithm.
    pub async fn register_template(
        &self,
        user_id: u64,
        device_id: &str,
        modality: Modality,
        sample: Vec<u8>,
        require_liveness: bool,
    ) -> Result<BiometricResult> {
        let start = Instant::now();
        let _permit = self.acquire_permit().await?;

        if user_id == 0 {
            return Err(AccessError::Validation("User id is required".into()));
        }
        if sample.is_empty() {
            return Err(AccessError::Validation("Sample must not be empty".into()));
        }
        let algorithm = self.resolve_ready(modality)?;

        let gate = AuthRequest {
            user_id,
            device_id: device_id.to_string(),
            modality,
            sample: sample.clone(),
            template_id: None,
            security_level: SecurityLevel::Low,
            require_liveness,
        };
        if require_liveness && modality == Modality::Face && !self.run_liveness_check(&gate) {
            self.record_op(start.elapsed());
            return Ok(BiometricResult::fail(
                start.elapsed(),
                "Enrollment rejected at liveness stage",
            ));
        }

        let device_id = device_id.to_string();
        let handle =
            tokio::task::spawn_blocking(move || algorithm.enroll(user_id, &device_id, &sample));
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(%modality, error = %join_err, "enrollment task aborted");
                BiometricResult::fail(start.elapsed(), "Enrollment task aborted unexpectedly")
            }
        };

        if result.success {
            self.inner.counters.enrollments.fetch_add(1, Ordering::Relaxed);
        }
        self.record_op(start.elapsed());
        Ok(result)
    }

    pub async fn delete_template(
        &self,
        modality: Modality,
        template_id: &str,
    ) -> Result<BiometricResult> {
        let start = Instant::now();
        let _permit = self.acquire_permit().await?;

        if template_id.is_empty() {
            return Err(AccessError::Validation("Template id is required".into()));
        }
        let algorithm = self.resolve_ready(modality)?;

        let template_id = template_id.to_string();
        let handle = tokio::task::spawn_blocking(move || algorithm.delete(&template_id));
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(%modality, error = %join_err, "deletion task aborted");
                BiometricResult::fail(start.elapsed(), "Deletion task aborted unexpectedly")
            }
        };

        if result.success {
            self.inner.counters.deletions.fetch_add(1, Ordering::Relaxed);
        }
        self.record_op(start.elapsed());
        Ok(result)
    }

    pub fn status(&self) -> EngineStatus {
        let algorithms = self
            .inner
            .registry
            .iter()
            .map(|entry| {
                (
                    entry.key().to_string(),
                    AlgorithmStatusReport {
                        status: entry.value().status(),
                        metrics: entry.value().metrics(),
                    },
                )
            })
            .collect();

        EngineStatus {
            algorithms,
            statistics: self.statistics(),
        }
    }

    pub fn statistics(&self) -> EngineStatistics {
        let c = &self.inner.counters;
        let ops = c.total_ops.load(Ordering::Relaxed);
        let avg = if ops > 0 {
            c.total_time_us.load(Ordering::Relaxed) as f64 / ops as f64 / 1_000.0
        } else {
            0.0
        };
        EngineStatistics {
            successful_authentications: c.auth_success.load(Ordering::Relaxed),
            failed_authentications: c.auth_failure.load(Ordering::Relaxed),
            successful_multimodal: c.multi_success.load(Ordering::Relaxed),
            failed_multimodal: c.multi_failure.load(Ordering::Relaxed),
            enrollments: c.enrollments.load(Ordering::Relaxed),
            deletions: c.deletions.load(Ordering::Relaxed),
            avg_processing_time_ms: avg,
        }
    }

    /// Stop accepting work, clean up every algorithm, clear the registry and
    /// the liveness session set.
    pub fn shutdown(&self) {
        self.inner.pool.close();
        for entry in self.inner.registry.iter() {
            entry.value().cleanup();
        }
        self.inner.registry.clear();
        self.inner.liveness.clear();
        info!("recognition engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::ModalityAlgorithm;
    use crate::common::config::{AlgorithmParams, LivenessConfig};

    fn engine() -> RecognitionEngine {
        let liveness = Arc::new(LivenessEngine::new(LivenessConfig::default()));
        let engine = RecognitionEngine::new(&EngineConfig::default(), liveness);
        for modality in Modality::ALL {
            engine
                .register(
                    Arc::new(ModalityAlgorithm::new(modality)),
                    &AlgorithmParams::default(),
                )
                .unwrap();
        }
        engine
    }

    fn sample(seed: usize) -> Vec<u8> {
        (0..512).map(|i| ((i * 31 + seed * 7) % 256) as u8).collect()
    }

    #[tokio::test]
    async fn enroll_then_authenticate_roundtrip() {
        let engine = engine();
        let s = sample(1);

        let enrolled = engine
            .register_template(42, "dev-1", Modality::Fingerprint, s.clone(), false)
            .await
            .unwrap();
        assert!(enrolled.success, "{}", enrolled.message);

        let outcome = engine
            .authenticate(AuthRequest {
                user_id: 42,
                device_id: "dev-1".into(),
                modality: Modality::Fingerprint,
                sample: s,
                template_id: None,
                security_level: SecurityLevel::Low,
                require_liveness: false,
            })
            .await
            .unwrap();
        assert!(outcome.result.success);
        assert!(outcome.result.confidence >= 0.99);
    }

    #[tokio::test]
    async fn unknown_modality_is_rejected() {
        let liveness = Arc::new(LivenessEngine::new(LivenessConfig::default()));
        let engine = RecognitionEngine::new(&EngineConfig::default(), liveness);

        let err = engine
            .authenticate(AuthRequest {
                user_id: 1,
                device_id: "dev-1".into(),
                modality: Modality::Iris,
                sample: sample(1),
                template_id: None,
                security_level: SecurityLevel::Low,
                require_liveness: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::UnknownModality(Modality::Iris)));
    }

    #[tokio::test]
    async fn empty_sample_is_a_validation_error() {
        let engine = engine();
        let err = engine
            .authenticate(AuthRequest {
                user_id: 1,
                device_id: "dev-1".into(),
                modality: Modality::Face,
                sample: Vec::new(),
                template_id: None,
                security_level: SecurityLevel::Low,
                require_liveness: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Validation(_)));
    }

    #[tokio::test]
    async fn multimodal_requires_enough_distinct_modalities() {
        let engine = engine();
        let err = engine
            .authenticate_multimodal(MultimodalRequest {
                user_id: 1,
                device_id: "dev-1".into(),
                security_level: SecurityLevel::Critical,
                samples: vec![(Modality::Face, sample(1)), (Modality::Iris, sample(2))],
                fusion: FusionStrategy::WeightedAverage,
                require_liveness: false,
                confidence_threshold: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Validation(_)));
    }

    #[tokio::test]
    async fn multimodal_fuses_enrolled_modalities() {
        let engine = engine();
        let fp = sample(3);
        let iris = sample(4);
        engine
            .register_template(7, "dev-1", Modality::Fingerprint, fp.clone(), false)
            .await
            .unwrap();
        engine
            .register_template(7, "dev-1", Modality::Iris, iris.clone(), false)
            .await
            .unwrap();

        let outcome = engine
            .authenticate_multimodal(MultimodalRequest {
                user_id: 7,
                device_id: "dev-1".into(),
                security_level: SecurityLevel::High,
                samples: vec![(Modality::Fingerprint, fp), (Modality::Iris, iris)],
                fusion: FusionStrategy::WeightedAverage,
                require_liveness: false,
                confidence_threshold: None,
            })
            .await
            .unwrap();
        assert!(outcome.success, "{}", outcome.fusion.message);
        assert_eq!(outcome.sub_results.len(), 2);
        assert!(outcome.confidence >= 0.99);
    }

    #[tokio::test]
    async fn failed_subresult_fails_weighted_fusion_without_cancelling_siblings() {
        let engine = engine();
        let iris = sample(5);
        engine
            .register_template(8, "dev-1", Modality::Iris, iris.clone(), false)
            .await
            .unwrap();
        // no fingerprint template enrolled for user 8

        let outcome = engine
            .authenticate_multimodal(MultimodalRequest {
                user_id: 8,
                device_id: "dev-1".into(),
                security_level: SecurityLevel::High,
                samples: vec![
                    (Modality::Iris, iris),
                    (Modality::Fingerprint, sample(6)),
                ],
                fusion: FusionStrategy::WeightedAverage,
                require_liveness: false,
                confidence_threshold: None,
            })
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.sub_results.iter().any(|(_, r)| r.success));
        assert!(outcome.sub_results.iter().any(|(_, r)| !r.success));
    }

    #[tokio::test]
    async fn panicking_algorithm_becomes_a_failed_result() {
        struct PanickyAlgorithm;
        impl BiometricAlgorithm for PanickyAlgorithm {
            fn modality(&self) -> Modality {
                Modality::Palm
            }
            fn initialize(&self, _: &AlgorithmParams) -> bool {
                true
            }
            fn enroll(&self, _: u64, _: &str, _: &[u8]) -> BiometricResult {
                panic!("enroll blew up")
            }
            fn delete(&self, _: &str) -> BiometricResult {
                panic!("delete blew up")
            }
            fn authenticate(&self, _: u64, _: &str, _: &[u8], _: Option<&str>) -> BiometricResult {
                panic!("authenticate blew up")
            }
            fn batch_authenticate(
                &self,
                _: u64,
                _: &str,
                _: &[Vec<u8>],
            ) -> crate::algorithm::BatchResult {
                panic!("batch blew up")
            }
            fn status(&self) -> AlgorithmStatus {
                AlgorithmStatus::Ready
            }
            fn metrics(&self) -> PerformanceMetrics {
                PerformanceMetrics::default()
            }
            fn cleanup(&self) {}
        }

        let liveness = Arc::new(LivenessEngine::new(LivenessConfig::default()));
        let engine = RecognitionEngine::new(&EngineConfig::default(), liveness);
        engine
            .register(Arc::new(PanickyAlgorithm), &AlgorithmParams::default())
            .unwrap();

        let outcome = engine
            .authenticate(AuthRequest {
                user_id: 1,
                device_id: "dev-1".into(),
                modality: Modality::Palm,
                sample: sample(1),
                template_id: None,
                security_level: SecurityLevel::Low,
                require_liveness: false,
            })
            .await
            .unwrap();
        assert!(!outcome.result.success);
        assert!(outcome.result.message.contains("aborted"));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let engine = engine();
        engine.shutdown();

        let err = engine
            .authenticate(AuthRequest {
                user_id: 1,
                device_id: "dev-1".into(),
                modality: Modality::Face,
                sample: sample(1),
                template_id: None,
                security_level: SecurityLevel::Low,
                require_liveness: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::ShuttingDown));
    }

    #[tokio::test]
    async fn unregister_removes_the_algorithm() {
        let engine = engine();
        engine.unregister(Modality::Palm).unwrap();
        assert!(engine.unregister(Modality::Palm).is_err());
        assert_eq!(engine.registered_modalities().len(), 3);
    }

    #[tokio::test]
    async fn statistics_reflect_outcomes() {
        let engine = engine();
        let s = sample(9);
        engine
            .register_template(3, "dev-1", Modality::Iris, s.clone(), false)
            .await
            .unwrap();
        engine
            .authenticate(AuthRequest {
                user_id: 3,
                device_id: "dev-1".into(),
                modality: Modality::Iris,
                sample: s,
                template_id: None,
                security_level: SecurityLevel::Low,
                require_liveness: false,
            })
            .await
            .unwrap();

        let stats = engine.statistics();
        assert_eq!(stats.enrollments, 1);
        assert_eq!(stats.successful_authentications, 1);
        assert!(stats.avg_processing_time_ms >= 0.0);
    }
}
