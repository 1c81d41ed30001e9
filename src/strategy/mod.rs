//! Named authentication policies: registry, risk assessment, candidate
//! scoring and selection, adaptive tightening, and policy execution.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveTime, Timelike};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::config::StrategyConfig;
use crate::common::error::{AccessError, Result};
use crate::common::types::{
    DeviceStatus, Modality, NetworkType, OperationIdGenerator, RiskLevel, SecurityLevel,
    UserStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Draft,
    Active,
    Inactive,
    Disabled,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyStatus::Draft => "draft",
            StrategyStatus::Active => "active",
            StrategyStatus::Inactive => "inactive",
            StrategyStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// What evidence a strategy demands from the recognition engine.
#[derive(Debug, Clone)]
pub struct StrategyRequirements {
    pub required_modalities: Vec<Modality>,
    pub min_modality_count: usize,
    pub require_liveness: bool,
    pub max_retry_attempts: u32,
    pub timeout: Duration,
    pub confidence_threshold: f64,
}

/// A daily time window like `08:00-18:00`. Windows may wrap midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(window: &str) -> Result<Self> {
        let (start, end) = window
            .split_once('-')
            .ok_or_else(|| AccessError::InvalidStrategy(format!("Bad time window: {}", window)))?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
            .map_err(|e| AccessError::InvalidStrategy(format!("Bad time window start: {}", e)))?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
            .map_err(|e| AccessError::InvalidStrategy(format!("Bad time window end: {}", e)))?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Under what circumstances a strategy may be applied.
#[derive(Debug, Clone, Default)]
pub struct StrategyConditions {
    pub allowed_risk_levels: Vec<RiskLevel>,
    /// Empty means any time of day.
    pub allowed_time_windows: Vec<TimeWindow>,
    /// Empty means any location.
    pub allowed_locations: Vec<String>,
    pub max_concurrent_sessions: usize,
    pub extra_verification: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthStrategy {
    pub id: String,
    pub name: String,
    pub description: String,
    pub security_level: SecurityLevel,
    pub priority: u32,
    pub status: StrategyStatus,
    pub requirements: StrategyRequirements,
    pub conditions: StrategyConditions,
    /// Set on adaptive clones; names the registered strategy they tightened.
    pub adapted_from: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl AuthStrategy {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AccessError::InvalidStrategy("Strategy id is empty".into()));
        }
        if self.requirements.required_modalities.is_empty() {
            return Err(AccessError::InvalidStrategy(format!(
                "Strategy {} has no required modalities",
                self.id
            )));
        }
        let count = self.requirements.min_modality_count;
        if count < 1 || count > self.requirements.required_modalities.len() {
            return Err(AccessError::InvalidStrategy(format!(
                "Strategy {}: min modality count {} out of range 1..={}",
                self.id,
                count,
                self.requirements.required_modalities.len()
            )));
        }
        if !(0.0..=1.0).contains(&self.requirements.confidence_threshold) {
            return Err(AccessError::InvalidStrategy(format!(
                "Strategy {}: confidence threshold {} out of range",
                self.id, self.requirements.confidence_threshold
            )));
        }
        Ok(())
    }

    fn conditions_satisfied(&self, ctx: &RequestContext, risk: RiskLevel) -> bool {
        if !self.conditions.allowed_risk_levels.is_empty()
            && !self.conditions.allowed_risk_levels.contains(&risk)
        {
            return false;
        }
        if !self.conditions.allowed_time_windows.is_empty() {
            let t = ctx.requested_at.time();
            if !self
                .conditions
                .allowed_time_windows
                .iter()
                .any(|w| w.contains(t))
            {
                return false;
            }
        }
        if !self.conditions.allowed_locations.is_empty()
            && !self.conditions.allowed_locations.contains(&ctx.location)
        {
            return false;
        }
        true
    }

    /// Applicability adds the security-level fit on top of the conditions.
    fn is_applicable(&self, ctx: &RequestContext, risk: RiskLevel) -> bool {
        self.conditions_satisfied(ctx, risk)
            && self.security_level >= effective_required_level(ctx, risk)
    }

    /// Tightened clone for elevated risk. The clone carries a derived id and
    /// is returned to the caller, never registered.
    fn tightened(&self) -> AuthStrategy {
        let mut adapted = self.clone();
        adapted.id = format!("{}-adaptive", self.id);
        adapted.name = format!("{} (adaptive)", self.name);
        adapted.adapted_from = Some(self.id.clone());
        adapted.requirements.min_modality_count = (self.requirements.min_modality_count + 1)
            .min(self.requirements.required_modalities.len());
        adapted.requirements.confidence_threshold =
            (self.requirements.confidence_threshold + 0.05).min(0.99);
        adapted.requirements.require_liveness = true;
        adapted.updated_at = chrono::Utc::now();
        adapted
    }
}

/// Contextual signals carried by one access request. `requested_at` is set by
/// the caller so time-of-day logic is deterministic under test.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: u64,
    pub device_id: String,
    pub location: String,
    pub device_type: String,
    pub network_type: NetworkType,
    pub required_security_level: Option<SecurityLevel>,
    pub user_status: UserStatus,
    pub device_status: DeviceStatus,
    pub requested_at: chrono::DateTime<chrono::Local>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub factors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub location: String,
    pub hour: u32,
    pub device_type: String,
    pub network_type: NetworkType,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub strategy_id: String,
    pub score: f64,
}

/// Full record of one evaluate-and-select pass.
#[derive(Debug, Clone)]
pub struct StrategyEvaluation {
    pub evaluation_id: String,
    pub risk: RiskAssessment,
    pub environment: EnvironmentInfo,
    pub candidates: Vec<ScoredCandidate>,
    /// Id of the strategy picked before any tightening.
    pub selected_id: String,
    /// The strategy to actually enforce; a tightened clone under elevated risk.
    pub final_strategy: AuthStrategy,
    pub processing_time: Duration,
}

/// Implemented by whatever result type a strategy body produces, so the
/// manager can record success/failure without knowing the body's domain.
pub trait ExecutionOutcome {
    fn succeeded(&self) -> bool;
    fn achieved_confidence(&self) -> f64;
}

#[derive(Default)]
struct StrategyCounters {
    evaluations: AtomicU64,
    selections: AtomicU64,
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StrategyStatistics {
    pub evaluations: u64,
    pub selections: u64,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
}

pub struct StrategyManager {
    config: StrategyConfig,
    registry: DashMap<String, AuthStrategy>,
    counters: DashMap<String, Arc<StrategyCounters>>,
    ids: OperationIdGenerator,
}

impl StrategyManager {
    /// Build a manager pre-loaded with the default Low/Medium/High/Critical
    /// catalog.
    pub fn with_default_catalog(config: StrategyConfig) -> Self {
        let manager = Self::empty(config);
        for strategy in default_catalog() {
            // catalog entries are valid by construction
            if let Err(err) = manager.register(strategy) {
                warn!(error = %err, "default strategy rejected");
            }
        }
        manager
    }

    pub fn empty(config: StrategyConfig) -> Self {
        Self {
            config,
            registry: DashMap::new(),
            counters: DashMap::new(),
            ids: OperationIdGenerator::new("EVAL"),
        }
    }

    pub fn register(&self, strategy: AuthStrategy) -> Result<()> {
        strategy.validate()?;
        if self.registry.contains_key(&strategy.id) {
            return Err(AccessError::InvalidStrategy(format!(
                "Strategy id already registered: {}",
                strategy.id
            )));
        }
        info!(id = %strategy.id, level = %strategy.security_level, "strategy registered");
        self.counters
            .insert(strategy.id.clone(), Arc::new(StrategyCounters::default()));
        self.registry.insert(strategy.id.clone(), strategy);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<AuthStrategy> {
        self.registry
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AccessError::StrategyNotFound(id.to_string()))
    }

    /// Replace a registered strategy. The candidate is validated before it
    /// becomes visible to readers; a rejected update leaves the registered
    /// strategy untouched.
    pub fn update(&self, strategy: AuthStrategy) -> Result<()> {
        if let Err(err) = strategy.validate() {
            warn!(id = %strategy.id, error = %err, "strategy update rejected");
            return Err(err);
        }
        let id = strategy.id.clone();
        match self.registry.get_mut(&id) {
            Some(mut entry) => {
                *entry.value_mut() = strategy;
                info!(id = %id, "strategy updated");
                Ok(())
            }
            None => Err(AccessError::StrategyNotFound(id)),
        }
    }

    pub fn unregister(&self, id: &str) -> Result<AuthStrategy> {
        let (_, strategy) = self
            .registry
            .remove(id)
            .ok_or_else(|| AccessError::StrategyNotFound(id.to_string()))?;
        self.counters.remove(id);
        info!(id = %id, "strategy unregistered");
        Ok(strategy)
    }

    pub fn strategy_count(&self) -> usize {
        self.registry.len()
    }

    /// Additive risk score from device trust, network exposure, and time of
    /// day, capped at 1.0, then bucketed into a risk level.
    pub fn assess_risk(&self, ctx: &RequestContext) -> RiskAssessment {
        let weights = &self.config.risk;
        let mut score = 0.0;
        let mut factors = Vec::new();

        match ctx.device_status {
            DeviceStatus::Trusted => {}
            DeviceStatus::Unknown => {
                score += weights.unknown_device;
                factors.push("unknown device".to_string());
            }
            DeviceStatus::Suspicious => {
                score += weights.suspicious_device;
                factors.push("suspicious device".to_string());
            }
            DeviceStatus::Blacklisted => {
                score += weights.blacklisted_device;
                factors.push("blacklisted device".to_string());
            }
        }

        if ctx.network_type.is_public() {
            score += weights.public_network;
            factors.push("public network".to_string());
        }

        let hour = ctx.requested_at.hour();
        if hour < weights.work_start_hour || hour >= weights.work_end_hour {
            score += weights.off_hours;
            factors.push("outside work hours".to_string());
        }

        let score = score.min(1.0);
        let level = if score >= weights.critical_threshold {
            RiskLevel::Critical
        } else if score >= weights.high_threshold {
            RiskLevel::High
        } else if score >= weights.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        RiskAssessment {
            score,
            level,
            factors,
        }
    }

    fn analyze_environment(ctx: &RequestContext) -> EnvironmentInfo {
        EnvironmentInfo {
            location: ctx.location.clone(),
            hour: ctx.requested_at.hour(),
            device_type: ctx.device_type.clone(),
            network_type: ctx.network_type,
        }
    }

    /// Weighted score out of 100 across security match, risk fit, environment
    /// match, strategy complexity, and raw priority.
    fn score_candidate(
        &self,
        strategy: &AuthStrategy,
        ctx: &RequestContext,
        risk: &RiskAssessment,
    ) -> f64 {
        let weights = &self.config.scoring;

        let required = effective_required_level(ctx, risk.level);
        let diff = strategy.security_level.level().abs_diff(required.level()) as f64;
        let security_frac = (1.0 - diff * 0.25).max(0.0);

        let risk_frac = if strategy.conditions.allowed_risk_levels.is_empty()
            || strategy.conditions.allowed_risk_levels.contains(&risk.level)
        {
            // lower assessed risk earns a larger bonus
            (1.0 - risk.score * 0.4).max(0.0)
        } else {
            0.0
        };

        let mut environment_hits = 0u32;
        if strategy.conditions.allowed_time_windows.is_empty()
            || strategy
                .conditions
                .allowed_time_windows
                .iter()
                .any(|w| w.contains(ctx.requested_at.time()))
        {
            environment_hits += 1;
        }
        if strategy.conditions.allowed_locations.is_empty()
            || strategy.conditions.allowed_locations.contains(&ctx.location)
        {
            environment_hits += 1;
        }
        let environment_frac = environment_hits as f64 / 2.0;

        let timeout_secs = strategy.requirements.timeout.as_secs().max(30) as f64;
        let complexity_frac = (strategy.requirements.min_modality_count as f64 * 0.2
            + if strategy.requirements.require_liveness { 0.3 } else { 0.0 }
            + strategy.requirements.confidence_threshold * 0.3
            + (60.0 / timeout_secs) * 0.2)
            .min(1.0);

        let priority_frac = (strategy.priority as f64 / 4.0).min(1.0);

        security_frac * weights.security_match
            + risk_frac * weights.risk_fit
            + environment_frac * weights.environment
            + complexity_frac * weights.complexity
            + priority_frac * weights.priority
    }

    fn bump(&self, id: &str, pick: impl Fn(&StrategyCounters) -> &AtomicU64) {
        if let Some(entry) = self.counters.get(id) {
            pick(entry.value()).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Assess risk, filter and score candidates, select a strategy, and
    /// tighten it if the assessed risk is High or Critical.
    pub fn evaluate_and_select(&self, ctx: &RequestContext) -> Result<StrategyEvaluation> {
        let start = Instant::now();
        let evaluation_id = self.ids.next();

        let risk = self.assess_risk(ctx);
        let environment = Self::analyze_environment(ctx);

        let mut filtered: Vec<AuthStrategy> = self
            .registry
            .iter()
            .filter(|entry| {
                entry.value().status == StrategyStatus::Active
                    && entry.value().conditions_satisfied(ctx, risk.level)
            })
            .map(|entry| entry.value().clone())
            .collect();
        filtered.sort_by(|a, b| b.priority.cmp(&a.priority));

        if filtered.is_empty() {
            warn!(
                evaluation_id = %evaluation_id,
                risk = %risk.level,
                "no strategy matches request conditions"
            );
            return Err(AccessError::NoApplicableStrategy);
        }

        for strategy in &filtered {
            self.bump(&strategy.id, |c| &c.evaluations);
        }

        let mut ranked: Vec<(AuthStrategy, f64)> = filtered
            .into_iter()
            .map(|s| {
                let score = self.score_candidate(&s, ctx, &risk);
                (s, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let candidates: Vec<ScoredCandidate> = ranked
            .iter()
            .map(|(s, score)| ScoredCandidate {
                strategy_id: s.id.clone(),
                score: *score,
            })
            .collect();

        // highest-ranked still-applicable candidate, else the top one
        let selected = ranked
            .iter()
            .find(|(s, _)| s.is_applicable(ctx, risk.level))
            .or_else(|| ranked.first())
            .map(|(s, _)| s.clone())
            .ok_or(AccessError::NoApplicableStrategy)?;

        self.bump(&selected.id, |c| &c.selections);

        let final_strategy = if risk.level >= RiskLevel::High {
            let adapted = selected.tightened();
            info!(
                evaluation_id = %evaluation_id,
                original = %selected.id,
                adapted = %adapted.id,
                threshold = adapted.requirements.confidence_threshold,
                "strategy tightened for elevated risk"
            );
            adapted
        } else {
            selected.clone()
        };

        debug!(
            evaluation_id = %evaluation_id,
            selected = %selected.id,
            risk = %risk.level,
            score = candidates.first().map(|c| c.score).unwrap_or(0.0),
            "strategy selected"
        );

        Ok(StrategyEvaluation {
            evaluation_id,
            risk,
            environment,
            candidates,
            selected_id: selected.id,
            final_strategy,
            processing_time: start.elapsed(),
        })
    }

    fn check_preconditions(ctx: &RequestContext) -> Result<()> {
        if ctx.user_status != UserStatus::Active {
            return Err(AccessError::PreconditionFailed(format!(
                "User {} is not active",
                ctx.user_id
            )));
        }
        if ctx.device_status != DeviceStatus::Trusted {
            return Err(AccessError::PreconditionFailed(format!(
                "Device {} is not trusted",
                ctx.device_id
            )));
        }
        Ok(())
    }

    /// Execute a strategy body under a registered strategy. The strategy must
    /// exist and be Active; preconditions must hold. Per-strategy counters
    /// attribute the execution to the registered id, so callers holding an
    /// adaptive clone pass the original id here.
    pub async fn execute<T, F, Fut>(
        &self,
        strategy_id: &str,
        ctx: &RequestContext,
        body: F,
    ) -> Result<T>
    where
        T: ExecutionOutcome,
        F: FnOnce(AuthStrategy) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let strategy = self.get(strategy_id)?;
        if strategy.status != StrategyStatus::Active {
            return Err(AccessError::StrategyInactive {
                id: strategy.id,
                status: strategy.status.to_string(),
            });
        }
        Self::check_preconditions(ctx)?;

        self.bump(strategy_id, |c| &c.executions);
        let outcome = body(strategy).await;

        match &outcome {
            Ok(result) if result.succeeded() => self.bump(strategy_id, |c| &c.successes),
            _ => self.bump(strategy_id, |c| &c.failures),
        }
        outcome
    }

    pub fn statistics(&self, id: &str) -> Option<StrategyStatistics> {
        self.counters.get(id).map(|entry| {
            let c = entry.value();
            StrategyStatistics {
                evaluations: c.evaluations.load(Ordering::Relaxed),
                selections: c.selections.load(Ordering::Relaxed),
                executions: c.executions.load(Ordering::Relaxed),
                successes: c.successes.load(Ordering::Relaxed),
                failures: c.failures.load(Ordering::Relaxed),
            }
        })
    }

    pub fn overall_statistics(&self) -> StrategyStatistics {
        let mut total = StrategyStatistics::default();
        for entry in self.counters.iter() {
            let c = entry.value();
            total.evaluations += c.evaluations.load(Ordering::Relaxed);
            total.selections += c.selections.load(Ordering::Relaxed);
            total.executions += c.executions.load(Ordering::Relaxed);
            total.successes += c.successes.load(Ordering::Relaxed);
            total.failures += c.failures.load(Ordering::Relaxed);
        }
        total
    }
}

/// The security tier a request effectively demands: the caller's explicit
/// requirement, else the tier matching the assessed risk.
fn effective_required_level(ctx: &RequestContext, risk: RiskLevel) -> SecurityLevel {
    ctx.required_security_level.unwrap_or(match risk {
        RiskLevel::Low => SecurityLevel::Low,
        RiskLevel::Medium => SecurityLevel::Medium,
        RiskLevel::High => SecurityLevel::High,
        RiskLevel::Critical => SecurityLevel::Critical,
    })
}

fn strategy(
    id: &str,
    name: &str,
    security_level: SecurityLevel,
    priority: u32,
    requirements: StrategyRequirements,
    conditions: StrategyConditions,
) -> AuthStrategy {
    let now = chrono::Utc::now();
    AuthStrategy {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        security_level,
        priority,
        status: StrategyStatus::Active,
        requirements,
        conditions,
        adapted_from: None,
        created_at: now,
        updated_at: now,
    }
}

/// The fixed catalog created at process start. Each tier allows every risk
/// level up to its own, so a riskier request escalates to a stricter tier
/// instead of falling out of policy.
pub fn default_catalog() -> Vec<AuthStrategy> {
    vec![
        strategy(
            "strategy-low",
            "Low security access",
            SecurityLevel::Low,
            1,
            StrategyRequirements {
                required_modalities: vec![Modality::Face],
                min_modality_count: 1,
                require_liveness: false,
                max_retry_attempts: 3,
                timeout: Duration::from_secs(30),
                confidence_threshold: 0.70,
            },
            StrategyConditions {
                allowed_risk_levels: vec![RiskLevel::Low, RiskLevel::Medium],
                ..Default::default()
            },
        ),
        strategy(
            "strategy-medium",
            "Medium security access",
            SecurityLevel::Medium,
            2,
            StrategyRequirements {
                required_modalities: vec![Modality::Face, Modality::Fingerprint],
                min_modality_count: 1,
                require_liveness: true,
                max_retry_attempts: 3,
                timeout: Duration::from_secs(60),
                confidence_threshold: 0.80,
            },
            StrategyConditions {
                allowed_risk_levels: vec![RiskLevel::Low, RiskLevel::Medium],
                ..Default::default()
            },
        ),
        strategy(
            "strategy-high",
            "High security access",
            SecurityLevel::High,
            3,
            StrategyRequirements {
                required_modalities: vec![Modality::Face, Modality::Fingerprint, Modality::Iris],
                min_modality_count: 2,
                require_liveness: true,
                max_retry_attempts: 2,
                timeout: Duration::from_secs(60),
                confidence_threshold: 0.85,
            },
            StrategyConditions {
                allowed_risk_levels: vec![RiskLevel::Low, RiskLevel::Medium, RiskLevel::High],
                ..Default::default()
            },
        ),
        strategy(
            "strategy-critical",
            "Critical security access",
            SecurityLevel::Critical,
            4,
            StrategyRequirements {
                required_modalities: vec![
                    Modality::Face,
                    Modality::Fingerprint,
                    Modality::Iris,
                    Modality::Palm,
                ],
                min_modality_count: 3,
                require_liveness: true,
                max_retry_attempts: 1,
                timeout: Duration::from_secs(120),
                confidence_threshold: 0.90,
            },
            StrategyConditions {
                allowed_risk_levels: vec![
                    RiskLevel::Low,
                    RiskLevel::Medium,
                    RiskLevel::High,
                    RiskLevel::Critical,
                ],
                ..Default::default()
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> RequestContext {
        RequestContext {
            user_id: 1,
            device_id: "dev-1".into(),
            location: "lobby".into(),
            device_type: "terminal".into(),
            network_type: NetworkType::Corporate,
            required_security_level: None,
            user_status: UserStatus::Active,
            device_status: DeviceStatus::Trusted,
            // a Tuesday at noon, inside work hours
            requested_at: chrono::Local.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
        }
    }

    fn manager() -> StrategyManager {
        StrategyManager::with_default_catalog(StrategyConfig::default())
    }

    #[test]
    fn catalog_loads_four_strategies() {
        assert_eq!(manager().strategy_count(), 4);
    }

    #[test]
    fn time_window_parses_and_wraps() {
        let day = TimeWindow::parse("08:00-18:00").unwrap();
        assert!(day.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(!day.contains(NaiveTime::from_hms_opt(19, 0, 0).unwrap()));

        let night = TimeWindow::parse("22:00-06:00").unwrap();
        assert!(night.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(night.contains(NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
        assert!(!night.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn invalid_strategy_is_rejected_and_registry_unchanged() {
        let manager = manager();
        let mut bad = default_catalog().remove(0);
        bad.id = "strategy-bad".into();
        bad.requirements.min_modality_count = 5;
        assert!(manager.register(bad).is_err());
        assert_eq!(manager.strategy_count(), 4);
    }

    #[test]
    fn invalid_update_never_replaces_the_registered_strategy() {
        let manager = manager();
        let mut updated = manager.get("strategy-low").unwrap();
        updated.requirements.confidence_threshold = 2.0;
        assert!(manager.update(updated).is_err());

        // the rejected candidate was never visible
        let current = manager.get("strategy-low").unwrap();
        assert_eq!(current.requirements.confidence_threshold, 0.70);
    }

    #[test]
    fn update_of_unknown_strategy_is_not_found() {
        let manager = manager();
        let mut ghost = manager.get("strategy-low").unwrap();
        ghost.id = "strategy-ghost".into();
        assert!(matches!(
            manager.update(ghost),
            Err(AccessError::StrategyNotFound(_))
        ));
        assert_eq!(manager.strategy_count(), 4);
    }

    #[test]
    fn trusted_daytime_request_is_low_risk() {
        let risk = manager().assess_risk(&ctx());
        assert_eq!(risk.level, RiskLevel::Low);
        assert_eq!(risk.score, 0.0);
    }

    #[test]
    fn blacklisted_device_is_critical_risk() {
        let mut ctx = ctx();
        ctx.device_status = DeviceStatus::Blacklisted;
        let risk = manager().assess_risk(&ctx);
        assert_eq!(risk.score, 1.0);
        assert_eq!(risk.level, RiskLevel::Critical);
        assert!(risk.factors.iter().any(|f| f.contains("blacklisted")));
    }

    #[test]
    fn risk_score_is_additive_and_capped() {
        let mut ctx = ctx();
        ctx.device_status = DeviceStatus::Suspicious;
        ctx.network_type = NetworkType::PublicWifi;
        ctx.requested_at = chrono::Local.with_ymd_and_hms(2024, 3, 5, 23, 0, 0).unwrap();
        let risk = manager().assess_risk(&ctx);
        assert!((risk.score - 0.9).abs() < 1e-9);
        assert_eq!(risk.level, RiskLevel::Critical);
    }

    #[test]
    fn low_risk_selects_without_tightening() {
        let manager = manager();
        let evaluation = manager.evaluate_and_select(&ctx()).unwrap();
        assert_eq!(evaluation.risk.level, RiskLevel::Low);
        assert!(evaluation.final_strategy.adapted_from.is_none());
        assert_eq!(evaluation.selected_id, evaluation.final_strategy.id);
        // low-risk requests land on the low tier, not the strictest one
        assert_eq!(evaluation.selected_id, "strategy-low");
    }

    #[test]
    fn required_level_steers_selection() {
        let manager = manager();
        let mut ctx = ctx();
        ctx.required_security_level = Some(SecurityLevel::High);
        let evaluation = manager.evaluate_and_select(&ctx).unwrap();
        let selected = manager.get(&evaluation.selected_id).unwrap();
        assert!(selected.security_level >= SecurityLevel::High);
    }

    #[test]
    fn high_risk_tightens_the_selected_strategy() {
        let manager = manager();
        let mut ctx = ctx();
        ctx.device_status = DeviceStatus::Suspicious; // 0.6 -> High

        let evaluation = manager.evaluate_and_select(&ctx).unwrap();
        let original = manager.get(&evaluation.selected_id).unwrap();
        let adapted = &evaluation.final_strategy;

        assert_eq!(adapted.adapted_from.as_deref(), Some(original.id.as_str()));
        assert!(adapted.id.ends_with("-adaptive"));
        assert_eq!(
            adapted.requirements.min_modality_count,
            (original.requirements.min_modality_count + 1)
                .min(original.requirements.required_modalities.len())
        );
        assert!(
            (adapted.requirements.confidence_threshold
                - (original.requirements.confidence_threshold + 0.05).min(0.99))
            .abs()
                < 1e-9
        );
        assert!(adapted.requirements.require_liveness);
    }

    #[test]
    fn tightening_example_medium_strategy_under_high_risk() {
        let medium = default_catalog().remove(1);
        let mut base = medium.clone();
        base.requirements.min_modality_count = 1;
        base.requirements.confidence_threshold = 0.85;

        let adapted = base.tightened();
        assert_eq!(adapted.requirements.min_modality_count, 2);
        assert!((adapted.requirements.confidence_threshold - 0.90).abs() < 1e-9);
        assert!(adapted.requirements.require_liveness);
    }

    #[test]
    fn threshold_tightening_caps_at_099() {
        let mut base = default_catalog().remove(3);
        base.requirements.confidence_threshold = 0.97;
        let adapted = base.tightened();
        assert!((adapted.requirements.confidence_threshold - 0.99).abs() < 1e-9);
    }

    #[test]
    fn no_candidate_yields_no_applicable_strategy() {
        let manager = StrategyManager::empty(StrategyConfig::default());
        assert!(matches!(
            manager.evaluate_and_select(&ctx()),
            Err(AccessError::NoApplicableStrategy)
        ));
    }

    #[derive(Debug)]
    struct FakeOutcome(bool);
    impl ExecutionOutcome for FakeOutcome {
        fn succeeded(&self) -> bool {
            self.0
        }
        fn achieved_confidence(&self) -> f64 {
            if self.0 {
                0.9
            } else {
                0.0
            }
        }
    }

    #[tokio::test]
    async fn execute_records_counters_against_the_registered_id() {
        let manager = manager();
        let ctx = ctx();

        let outcome = manager
            .execute("strategy-low", &ctx, |_s| async { Ok(FakeOutcome(true)) })
            .await
            .unwrap();
        assert!(outcome.succeeded());

        manager
            .execute("strategy-low", &ctx, |_s| async { Ok(FakeOutcome(false)) })
            .await
            .unwrap();

        let stats = manager.statistics("strategy-low").unwrap();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn execute_rejects_inactive_strategy_and_bad_preconditions() {
        let manager = manager();
        let mut inactive = manager.get("strategy-low").unwrap();
        inactive.status = StrategyStatus::Inactive;
        manager.update(inactive).unwrap();

        let err = manager
            .execute("strategy-low", &ctx(), |_s| async { Ok(FakeOutcome(true)) })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::StrategyInactive { .. }));

        let mut bad_ctx = ctx();
        bad_ctx.user_status = UserStatus::Suspended;
        let err = manager
            .execute("strategy-medium", &bad_ctx, |_s| async { Ok(FakeOutcome(true)) })
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::PreconditionFailed(_)));
    }
}
