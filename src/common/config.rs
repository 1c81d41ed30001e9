use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::error::{AccessError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// Bounded worker pool shared by all authentication/enrollment/deletion calls.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_confidence_threshold")]
    pub default_confidence_threshold: f64,
    /// Per-algorithm init parameters, keyed by modality name (face, fingerprint, ...).
    #[serde(default)]
    pub algorithms: HashMap<String, AlgorithmParams>,
}

fn default_worker_pool_size() -> usize { 8 }
fn default_confidence_threshold() -> f64 { 0.8 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            default_confidence_threshold: default_confidence_threshold(),
            algorithms: HashMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AlgorithmParams {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_min_feature_count")]
    pub min_feature_count: usize,
    #[serde(default = "default_min_sample_quality")]
    pub min_sample_quality: f64,
}

fn default_similarity_threshold() -> f64 { 0.8 }
fn default_min_feature_count() -> usize { 8 }
fn default_min_sample_quality() -> f64 { 0.2 }

impl Default for AlgorithmParams {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_feature_count: default_min_feature_count(),
            min_sample_quality: default_min_sample_quality(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_blink_timeout_ms")]
    pub blink_timeout_ms: u64,
    #[serde(default = "default_head_movement_timeout_ms")]
    pub head_movement_timeout_ms: u64,
    #[serde(default = "default_expression_timeout_ms")]
    pub expression_timeout_ms: u64,
    #[serde(default = "default_texture_timeout_ms")]
    pub texture_timeout_ms: u64,
    #[serde(default = "default_min_blinks")]
    pub min_blinks: u32,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_min_challenge_score")]
    pub min_challenge_score: f64,
}

fn default_session_timeout_ms() -> u64 { 60_000 }
fn default_blink_timeout_ms() -> u64 { 10_000 }
fn default_head_movement_timeout_ms() -> u64 { 15_000 }
fn default_expression_timeout_ms() -> u64 { 8_000 }
fn default_texture_timeout_ms() -> u64 { 5_000 }
fn default_min_blinks() -> u32 { 1 }
fn default_max_failed_attempts() -> u32 { 3 }
fn default_min_challenge_score() -> f64 { 0.5 }

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            blink_timeout_ms: default_blink_timeout_ms(),
            head_movement_timeout_ms: default_head_movement_timeout_ms(),
            expression_timeout_ms: default_expression_timeout_ms(),
            texture_timeout_ms: default_texture_timeout_ms(),
            min_blinks: default_min_blinks(),
            max_failed_attempts: default_max_failed_attempts(),
            min_challenge_score: default_min_challenge_score(),
        }
    }
}

/// Scoring and risk weights are configurable defaults, not a validated security model.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StrategyConfig {
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub risk: RiskWeights,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScoringWeights {
    #[serde(default = "default_w_security")]
    pub security_match: f64,
    #[serde(default = "default_w_risk")]
    pub risk_fit: f64,
    #[serde(default = "default_w_environment")]
    pub environment: f64,
    #[serde(default = "default_w_complexity")]
    pub complexity: f64,
    #[serde(default = "default_w_priority")]
    pub priority: f64,
}

fn default_w_security() -> f64 { 30.0 }
fn default_w_risk() -> f64 { 25.0 }
fn default_w_environment() -> f64 { 20.0 }
fn default_w_complexity() -> f64 { 15.0 }
fn default_w_priority() -> f64 { 10.0 }

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            security_match: default_w_security(),
            risk_fit: default_w_risk(),
            environment: default_w_environment(),
            complexity: default_w_complexity(),
            priority: default_w_priority(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RiskWeights {
    #[serde(default = "default_unknown_device")]
    pub unknown_device: f64,
    #[serde(default = "default_suspicious_device")]
    pub suspicious_device: f64,
    #[serde(default = "default_blacklisted_device")]
    pub blacklisted_device: f64,
    #[serde(default = "default_public_network")]
    pub public_network: f64,
    #[serde(default = "default_off_hours")]
    pub off_hours: f64,
    /// Work hours used by the off-hours penalty, inclusive start / exclusive end.
    #[serde(default = "default_work_start_hour")]
    pub work_start_hour: u32,
    #[serde(default = "default_work_end_hour")]
    pub work_end_hour: u32,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
}

fn default_unknown_device() -> f64 { 0.3 }
fn default_suspicious_device() -> f64 { 0.6 }
fn default_blacklisted_device() -> f64 { 1.0 }
fn default_public_network() -> f64 { 0.2 }
fn default_off_hours() -> f64 { 0.1 }
fn default_work_start_hour() -> u32 { 6 }
fn default_work_end_hour() -> u32 { 22 }
fn default_critical_threshold() -> f64 { 0.8 }
fn default_high_threshold() -> f64 { 0.5 }
fn default_medium_threshold() -> f64 { 0.2 }

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            unknown_device: default_unknown_device(),
            suspicious_device: default_suspicious_device(),
            blacklisted_device: default_blacklisted_device(),
            public_network: default_public_network(),
            off_hours: default_off_hours(),
            work_start_hour: default_work_start_hour(),
            work_end_hour: default_work_end_hour(),
            critical_threshold: default_critical_threshold(),
            high_threshold: default_high_threshold(),
            medium_threshold: default_medium_threshold(),
        }
    }
}

impl CoreConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AccessError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: CoreConfig = toml::from_str(&contents)
            .map_err(|e| AccessError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.worker_pool_size == 0 || self.engine.worker_pool_size > 1024 {
            return Err(AccessError::Config(format!(
                "Worker pool size must be between 1 and 1024, got {}",
                self.engine.worker_pool_size
            )));
        }

        if !(0.0..=1.0).contains(&self.engine.default_confidence_threshold) {
            return Err(AccessError::Config(format!(
                "Default confidence threshold must be between 0.0 and 1.0, got {}",
                self.engine.default_confidence_threshold
            )));
        }

        for (name, params) in &self.engine.algorithms {
            if !(0.0..=1.0).contains(&params.similarity_threshold) {
                return Err(AccessError::Config(format!(
                    "Similarity threshold for '{}' must be between 0.0 and 1.0, got {}",
                    name, params.similarity_threshold
                )));
            }
            if !(0.0..=1.0).contains(&params.min_sample_quality) {
                return Err(AccessError::Config(format!(
                    "Minimum sample quality for '{}' must be between 0.0 and 1.0, got {}",
                    name, params.min_sample_quality
                )));
            }
        }

        if self.liveness.session_timeout_ms == 0 {
            return Err(AccessError::Config(
                "Liveness session timeout must be greater than zero".into(),
            ));
        }
        if self.liveness.max_failed_attempts == 0 {
            return Err(AccessError::Config(
                "Max failed liveness attempts must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.liveness.min_challenge_score) {
            return Err(AccessError::Config(format!(
                "Minimum challenge score must be between 0.0 and 1.0, got {}",
                self.liveness.min_challenge_score
            )));
        }

        if self.strategy.risk.work_start_hour >= 24 || self.strategy.risk.work_end_hour > 24 {
            return Err(AccessError::Config(
                "Work hours must be within a 24 hour day".into(),
            ));
        }

        Ok(())
    }
}
