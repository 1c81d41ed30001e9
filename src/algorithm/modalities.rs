//! In-memory reference algorithms for the four supported modalities. They run
//! the full staged pipeline (decode, quality, feature extraction, matching)
//! over deterministic histogram embeddings, so the surrounding engine can be
//! exercised without real capture hardware or recognition models.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::algorithm::matcher::{
    cosine_similarity, extract_embedding, feature_count, Embedding, SampleQuality,
    SampleRejection, MIN_SAMPLE_LEN,
};
use crate::algorithm::{
    AlgorithmStatus, BatchResult, BiometricAlgorithm, BiometricResult, PerformanceMetrics,
};
use crate::common::config::AlgorithmParams;
use crate::common::types::Modality;

#[derive(Debug, Clone)]
struct StoredTemplate {
    template_id: String,
    user_id: u64,
    device_id: String,
    embedding: Embedding,
    enrolled_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct CallStats {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_time_us: AtomicU64,
    // Confidence sum in fixed-point millionths so it fits an atomic.
    confidence_sum_micro: AtomicU64,
}

impl CallStats {
    fn record(&self, result: &BiometricResult) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_time_us
            .fetch_add(result.processing_time.as_micros() as u64, Ordering::Relaxed);
        self.confidence_sum_micro
            .fetch_add((result.confidence * 1_000_000.0) as u64, Ordering::Relaxed);
    }
}

/// One in-memory algorithm instance per modality, owning its template store.
pub struct ModalityAlgorithm {
    modality: Modality,
    status: RwLock<AlgorithmStatus>,
    params: RwLock<AlgorithmParams>,
    templates: DashMap<String, StoredTemplate>,
    latest_by_user: DashMap<u64, String>,
    stats: CallStats,
}

impl ModalityAlgorithm {
    pub fn new(modality: Modality) -> Self {
        Self {
            modality,
            status: RwLock::new(AlgorithmStatus::Uninitialized),
            params: RwLock::new(AlgorithmParams::default()),
            templates: DashMap::new(),
            latest_by_user: DashMap::new(),
            stats: CallStats::default(),
        }
    }

    fn set_status(&self, status: AlgorithmStatus) {
        if let Ok(mut guard) = self.status.write() {
            *guard = status;
        }
    }

    fn current_params(&self) -> AlgorithmParams {
        self.params
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn derive_template_id(&self, user_id: u64, sample: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.modality.as_str().as_bytes());
        hasher.update(user_id.to_be_bytes());
        hasher.update(sample);
        hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        let digest = hasher.finalize();
        format!("{}-{:x}", self.modality.as_str(), digest)[..40].to_string()
    }

    /// Run the staged pipeline over a raw sample. Err names the rejecting stage.
    fn process_sample(
        &self,
        sample: &[u8],
        params: &AlgorithmParams,
    ) -> Result<(Embedding, SampleQuality), SampleRejection> {
        if sample.len() < MIN_SAMPLE_LEN {
            return Err(SampleRejection::Decode);
        }

        let quality = SampleQuality::measure(sample);
        if !quality.meets_minimum(params.min_sample_quality) {
            return Err(SampleRejection::Quality);
        }

        let embedding = extract_embedding(sample);
        if embedding.iter().all(|&v| v == 0.0) {
            return Err(SampleRejection::FeatureExtraction);
        }
        if feature_count(&embedding) < params.min_feature_count {
            return Err(SampleRejection::FeatureCount);
        }

        Ok((embedding, quality))
    }

    fn resolve_template(
        &self,
        user_id: u64,
        template_id: Option<&str>,
    ) -> Option<StoredTemplate> {
        let id = match template_id {
            Some(id) => id.to_string(),
            None => self.latest_by_user.get(&user_id)?.value().clone(),
        };
        let template = self.templates.get(&id)?.value().clone();
        if template.user_id != user_id {
            return None;
        }
        Some(template)
    }
}

impl BiometricAlgorithm for ModalityAlgorithm {
    fn modality(&self) -> Modality {
        self.modality
    }

    fn initialize(&self, params: &AlgorithmParams) -> bool {
        self.set_status(AlgorithmStatus::Initializing);

        if !(0.0..=1.0).contains(&params.similarity_threshold)
            || !(0.0..=1.0).contains(&params.min_sample_quality)
        {
            self.set_status(AlgorithmStatus::Error);
            return false;
        }

        if let Ok(mut guard) = self.params.write() {
            *guard = params.clone();
        }
        self.set_status(AlgorithmStatus::Ready);
        info!("{} algorithm initialized", self.modality);
        true
    }

    fn enroll(&self, user_id: u64, device_id: &str, sample: &[u8]) -> BiometricResult {
        let start = Instant::now();
        let params = self.current_params();

        let result = match self.process_sample(sample, &params) {
            Ok((embedding, quality)) => {
                let template_id = self.derive_template_id(user_id, sample);
                let template = StoredTemplate {
                    template_id: template_id.clone(),
                    user_id,
                    device_id: device_id.to_string(),
                    embedding,
                    enrolled_at: chrono::Utc::now(),
                };
                self.templates.insert(template_id.clone(), template);
                self.latest_by_user.insert(user_id, template_id.clone());

                debug!(
                    user_id,
                    template_id = %template_id,
                    "{} template enrolled",
                    self.modality
                );
                BiometricResult::ok(
                    quality.overall_score,
                    start.elapsed(),
                    format!("{} template enrolled", self.modality),
                    Some(template_id),
                )
            }
            Err(stage) => BiometricResult::fail(
                start.elapsed(),
                format!("Enrollment rejected at {} stage", stage),
            ),
        };

        self.stats.record(&result);
        result
    }

    fn delete(&self, template_id: &str) -> BiometricResult {
        let start = Instant::now();

        let result = match self.templates.remove(template_id) {
            Some((_, template)) => {
                // Drop the latest-template pointer only if it named this template.
                self.latest_by_user
                    .remove_if(&template.user_id, |_, latest| latest.as_str() == template_id);
                BiometricResult::ok(
                    1.0,
                    start.elapsed(),
                    format!("Template {} deleted", template_id),
                    Some(template_id.to_string()),
                )
            }
            None => BiometricResult::fail(
                start.elapsed(),
                format!("Template not found: {}", template_id),
            ),
        };

        self.stats.record(&result);
        result
    }

    fn authenticate(
        &self,
        user_id: u64,
        device_id: &str,
        sample: &[u8],
        template_id: Option<&str>,
    ) -> BiometricResult {
        let start = Instant::now();

        if self.status() != AlgorithmStatus::Ready {
            let result = BiometricResult::fail(
                start.elapsed(),
                format!("{} algorithm not ready", self.modality),
            );
            self.stats.record(&result);
            return result;
        }

        let params = self.current_params();
        let result = match self.process_sample(sample, &params) {
            Ok((embedding, _)) => match self.resolve_template(user_id, template_id) {
                Some(template) => {
                    let similarity = cosine_similarity(&embedding, &template.embedding) as f64;
                    if similarity >= params.similarity_threshold {
                        BiometricResult::ok(
                            similarity,
                            start.elapsed(),
                            format!("{} match", self.modality),
                            Some(template.template_id.clone()),
                        )
                        .with_extra("device_id", serde_json::Value::from(device_id))
                        .with_extra(
                            "enrolled_device_id",
                            serde_json::Value::from(template.device_id.clone()),
                        )
                        .with_extra(
                            "enrolled_at",
                            serde_json::Value::from(template.enrolled_at.to_rfc3339()),
                        )
                    } else {
                        BiometricResult::fail(
                            start.elapsed(),
                            format!(
                                "Similarity {:.3} below threshold {:.3}",
                                similarity, params.similarity_threshold
                            ),
                        )
                    }
                }
                None => BiometricResult::fail(
                    start.elapsed(),
                    format!("No {} template enrolled for user {}", self.modality, user_id),
                ),
            },
            Err(stage) => BiometricResult::fail(
                start.elapsed(),
                format!("Sample rejected at {} stage", stage),
            ),
        };

        self.stats.record(&result);
        result
    }

    fn batch_authenticate(
        &self,
        user_id: u64,
        device_id: &str,
        samples: &[Vec<u8>],
    ) -> BatchResult {
        let start = Instant::now();
        let results: Vec<BiometricResult> = samples
            .iter()
            .map(|sample| self.authenticate(user_id, device_id, sample, None))
            .collect();
        BatchResult::from_results(results, start.elapsed())
    }

    fn status(&self) -> AlgorithmStatus {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(AlgorithmStatus::Error)
    }

    fn metrics(&self) -> PerformanceMetrics {
        let total = self.stats.total.load(Ordering::Relaxed);
        let (avg_time, avg_conf) = if total > 0 {
            (
                self.stats.total_time_us.load(Ordering::Relaxed) as f64 / total as f64 / 1_000.0,
                self.stats.confidence_sum_micro.load(Ordering::Relaxed) as f64
                    / total as f64
                    / 1_000_000.0,
            )
        } else {
            (0.0, 0.0)
        };

        PerformanceMetrics {
            total_calls: total,
            successful_calls: self.stats.successes.load(Ordering::Relaxed),
            failed_calls: self.stats.failures.load(Ordering::Relaxed),
            avg_processing_time_ms: avg_time,
            avg_confidence: avg_conf,
            template_count: self.templates.len(),
        }
    }

    fn cleanup(&self) {
        self.set_status(AlgorithmStatus::Stopped);
        self.templates.clear();
        self.latest_by_user.clear();
        info!("{} algorithm stopped", self.modality);
    }
}
