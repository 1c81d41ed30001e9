//! Top-level access decision pipeline: request validation, emergency
//! handling, strategy evaluation, multimodal authentication, and the final
//! admit/deny decision with its side effects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::common::error::{AccessError, Result};
use crate::common::types::{
    AccessType, DeviceStatus, Modality, NetworkType, OperationIdGenerator, RiskLevel,
    SecurityLevel, UserStatus,
};
use crate::engine::fusion::FusionStrategy;
use crate::engine::{MultimodalOutcome, MultimodalRequest, RecognitionEngine};
use crate::strategy::{ExecutionOutcome, RequestContext, StrategyManager};

impl ExecutionOutcome for MultimodalOutcome {
    fn succeeded(&self) -> bool {
        self.success
    }
    fn achieved_confidence(&self) -> f64 {
        self.confidence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSessionStatus {
    Active,
    AccessGranted,
    AccessDenied,
    Completed,
    Failed,
    Terminated,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    Fire,
    Earthquake,
    SecurityBreach,
    Medical,
    PowerOutage,
    Lockdown,
    Manual,
}

impl EmergencyType {
    /// Fire and earthquake still allow egress for safety; every other
    /// emergency type denies all movement.
    pub fn allows_exit(&self) -> bool {
        matches!(self, EmergencyType::Fire | EmergencyType::Earthquake)
    }
}

/// Inbound request for one access decision.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub user_id: u64,
    pub device_id: String,
    pub door_id: String,
    pub access_type: AccessType,
    pub location: String,
    pub device_type: String,
    pub network_type: NetworkType,
    pub required_security_level: Option<SecurityLevel>,
    pub samples: Vec<(Modality, Vec<u8>)>,
    pub user_status: UserStatus,
    pub device_status: DeviceStatus,
}

#[derive(Debug, Clone)]
pub struct AccessSession {
    pub session_id: String,
    pub user_id: u64,
    pub door_id: String,
    pub access_type: AccessType,
    pub status: AccessSessionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub decided_at: Option<chrono::DateTime<chrono::Utc>>,
    pub reason: Option<String>,
}

/// Final decision with full provenance for audit.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub session_id: String,
    pub allowed: bool,
    pub status: AccessSessionStatus,
    pub reason: String,
    pub confidence: f64,
    pub threshold: f64,
    pub risk_level: Option<RiskLevel>,
    pub strategy_id: Option<String>,
    pub duration: Option<Duration>,
    pub processing_time: Duration,
}

/// Event-log collaborator. Failures here never affect the decision.
pub trait AccessEventSink: Send + Sync {
    fn record(&self, session_id: &str, user_id: u64, door_id: &str, event: &str, detail: &str);
}

/// Door-control collaborator.
pub trait DoorController: Send + Sync {
    fn control(&self, door_id: &str, open: bool, duration: Duration);
}

/// Security-alert collaborator for high-risk denials.
pub trait SecurityAlertSink: Send + Sync {
    fn alert(&self, user_id: u64, door_id: &str, risk: RiskLevel, reason: &str);
}

/// Default collaborators log and do nothing else.
pub struct LoggingEventSink;

impl AccessEventSink for LoggingEventSink {
    fn record(&self, session_id: &str, user_id: u64, door_id: &str, event: &str, detail: &str) {
        info!(session_id, user_id, door_id, event, detail, "access event");
    }
}

pub struct LoggingDoorController;

impl DoorController for LoggingDoorController {
    fn control(&self, door_id: &str, open: bool, duration: Duration) {
        info!(door_id, open, duration_ms = duration.as_millis() as u64, "door control");
    }
}

pub struct LoggingAlertSink;

impl SecurityAlertSink for LoggingAlertSink {
    fn alert(&self, user_id: u64, door_id: &str, risk: RiskLevel, reason: &str) {
        warn!(user_id, door_id, %risk, reason, "security alert");
    }
}

#[derive(Debug, Serialize)]
pub struct RealTimeStatus {
    pub accepting: bool,
    pub active_sessions: usize,
    pub emergency_active: bool,
    pub emergency_type: Option<EmergencyType>,
    pub granted: u64,
    pub denied: u64,
    pub failed: u64,
}

#[derive(Default)]
struct DecisionCounters {
    granted: AtomicU64,
    denied: AtomicU64,
    failed: AtomicU64,
}

pub struct AccessController {
    engine: RecognitionEngine,
    strategies: Arc<StrategyManager>,
    sessions: DashMap<String, AccessSession>,
    emergency: Mutex<Option<EmergencyType>>,
    emergency_active: AtomicBool,
    accepting: AtomicBool,
    counters: DecisionCounters,
    ids: OperationIdGenerator,
    events: Arc<dyn AccessEventSink>,
    doors: Arc<dyn DoorController>,
    alerts: Arc<dyn SecurityAlertSink>,
}

/// How long the door stays open for each access type.
pub fn access_duration(access_type: AccessType) -> Duration {
    match access_type {
        AccessType::Entry | AccessType::Exit => Duration::from_secs(5),
        AccessType::Temporary => Duration::from_secs(10),
        AccessType::Maintenance => Duration::from_secs(300),
        AccessType::Emergency => Duration::from_secs(30),
    }
}

impl AccessController {
    pub fn new(engine: RecognitionEngine, strategies: Arc<StrategyManager>) -> Self {
        Self::with_collaborators(
            engine,
            strategies,
            Arc::new(LoggingEventSink),
            Arc::new(LoggingDoorController),
            Arc::new(LoggingAlertSink),
        )
    }

    pub fn with_collaborators(
        engine: RecognitionEngine,
        strategies: Arc<StrategyManager>,
        events: Arc<dyn AccessEventSink>,
        doors: Arc<dyn DoorController>,
        alerts: Arc<dyn SecurityAlertSink>,
    ) -> Self {
        Self {
            engine,
            strategies,
            sessions: DashMap::new(),
            emergency: Mutex::new(None),
            emergency_active: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            counters: DecisionCounters::default(),
            ids: OperationIdGenerator::new("ACC"),
            events,
            doors,
            alerts,
        }
    }

    pub fn engine(&self) -> &RecognitionEngine {
        &self.engine
    }

    pub fn strategies(&self) -> &Arc<StrategyManager> {
        &self.strategies
    }

    fn validate_request(request: &AccessRequest) -> Result<()> {
        if request.user_id == 0 {
            return Err(AccessError::Validation("User id is required".into()));
        }
        if request.device_id.is_empty() {
            return Err(AccessError::Validation("Device id is required".into()));
        }
        if request.door_id.is_empty() {
            return Err(AccessError::Validation("Door id is required".into()));
        }
        Ok(())
    }

    fn finish_session(
        &self,
        session_id: &str,
        status: AccessSessionStatus,
        reason: &str,
    ) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            let session = entry.value_mut();
            session.status = status;
            session.decided_at = Some(chrono::Utc::now());
            session.reason = Some(reason.to_string());
        }
        // sessions leave the active set on any terminal transition
        self.sessions.remove(session_id);
    }

    fn deny(
        &self,
        session_id: String,
        reason: String,
        risk_level: Option<RiskLevel>,
        strategy_id: Option<String>,
        confidence: f64,
        threshold: f64,
        request: &AccessRequest,
        started: Instant,
    ) -> AccessDecision {
        self.counters.denied.fetch_add(1, Ordering::Relaxed);
        self.finish_session(&session_id, AccessSessionStatus::AccessDenied, &reason);
        self.events
            .record(&session_id, request.user_id, &request.door_id, "access_denied", &reason);

        if matches!(risk_level, Some(RiskLevel::High) | Some(RiskLevel::Critical)) {
            self.alerts
                .alert(request.user_id, &request.door_id, risk_level.unwrap_or(RiskLevel::High), &reason);
        }

        warn!(session_id = %session_id, user_id = request.user_id, reason = %reason, "access denied");
        AccessDecision {
            session_id,
            allowed: false,
            status: AccessSessionStatus::AccessDenied,
            reason,
            confidence,
            threshold,
            risk_level,
            strategy_id,
            duration: None,
            processing_time: started.elapsed(),
        }
    }

    /// Decide one access request against the current policy set.
    pub async fn process_access_request(&self, request: AccessRequest) -> Result<AccessDecision> {
        self.process_access_request_at(request, chrono::Local::now())
            .await
    }

    /// Same pipeline with an explicit request time, so time-window and
    /// time-of-day behavior is deterministic under test.
    pub async fn process_access_request_at(
        &self,
        request: AccessRequest,
        requested_at: chrono::DateTime<chrono::Local>,
    ) -> Result<AccessDecision> {
        let started = Instant::now();

        if !self.accepting.load(Ordering::Acquire) {
            return Err(AccessError::ShuttingDown);
        }
        Self::validate_request(&request)?;

        let session_id = self.ids.next();
        self.sessions.insert(
            session_id.clone(),
            AccessSession {
                session_id: session_id.clone(),
                user_id: request.user_id,
                door_id: request.door_id.clone(),
                access_type: request.access_type,
                status: AccessSessionStatus::Active,
                created_at: chrono::Utc::now(),
                decided_at: None,
                reason: None,
            },
        );
        self.events.record(
            &session_id,
            request.user_id,
            &request.door_id,
            "access_started",
            &request.access_type.to_string(),
        );

        // permission check before any biometric work
        if request.user_status == UserStatus::Blacklisted
            || request.user_status == UserStatus::Suspended
        {
            return Ok(self.deny(
                session_id,
                format!("User {} is not permitted", request.user_id),
                None,
                None,
                0.0,
                0.0,
                &request,
                started,
            ));
        }

        if self.emergency_active.load(Ordering::Acquire) {
            return Ok(self.handle_emergency_request(session_id, &request, started));
        }

        let ctx = RequestContext {
            user_id: request.user_id,
            device_id: request.device_id.clone(),
            location: request.location.clone(),
            device_type: request.device_type.clone(),
            network_type: request.network_type,
            required_security_level: request.required_security_level,
            user_status: request.user_status,
            device_status: request.device_status,
            requested_at,
        };

        let evaluation = match self.strategies.evaluate_and_select(&ctx) {
            Ok(evaluation) => evaluation,
            Err(AccessError::NoApplicableStrategy) => {
                return Ok(self.deny(
                    session_id,
                    "No applicable authentication strategy".to_string(),
                    None,
                    None,
                    0.0,
                    0.0,
                    &request,
                    started,
                ));
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.finish_session(&session_id, AccessSessionStatus::Error, &err.to_string());
                return Err(err);
            }
        };

        let strategy = &evaluation.final_strategy;
        let risk_level = evaluation.risk.level;
        let threshold = strategy.requirements.confidence_threshold;

        // keep only samples the strategy asked for
        let samples: Vec<(Modality, Vec<u8>)> = request
            .samples
            .iter()
            .filter(|(modality, _)| strategy.requirements.required_modalities.contains(modality))
            .cloned()
            .collect();

        if samples.len() < strategy.requirements.min_modality_count {
            return Ok(self.deny(
                session_id,
                format!(
                    "Insufficient modality count: strategy {} needs {}, got {}",
                    strategy.id,
                    strategy.requirements.min_modality_count,
                    samples.len()
                ),
                Some(risk_level),
                Some(strategy.id.clone()),
                0.0,
                threshold,
                &request,
                started,
            ));
        }

        // counters attribute to the registered strategy, not the adaptive clone
        let registered_id = strategy
            .adapted_from
            .clone()
            .unwrap_or_else(|| evaluation.selected_id.clone());

        let engine = self.engine.clone();
        let multimodal = MultimodalRequest {
            user_id: request.user_id,
            device_id: request.device_id.clone(),
            security_level: strategy.security_level,
            samples,
            fusion: FusionStrategy::WeightedAverage,
            require_liveness: strategy.requirements.require_liveness,
            confidence_threshold: Some(threshold),
        };

        let outcome = self
            .strategies
            .execute(&registered_id, &ctx, move |_strategy| async move {
                engine.authenticate_multimodal(multimodal).await
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err @ AccessError::PreconditionFailed(_))
            | Err(err @ AccessError::StrategyInactive { .. }) => {
                return Ok(self.deny(
                    session_id,
                    err.to_string(),
                    Some(risk_level),
                    Some(registered_id),
                    0.0,
                    threshold,
                    &request,
                    started,
                ));
            }
            Err(err) => {
                error!(session_id = %session_id, error = %err, "authentication failed");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.finish_session(&session_id, AccessSessionStatus::Failed, &err.to_string());
                self.events.record(
                    &session_id,
                    request.user_id,
                    &request.door_id,
                    "access_error",
                    &err.to_string(),
                );
                return Err(err);
            }
        };

        let allowed = outcome.success && outcome.confidence >= threshold;
        if allowed {
            let duration = access_duration(request.access_type);
            self.counters.granted.fetch_add(1, Ordering::Relaxed);
            self.doors.control(&request.door_id, true, duration);
            self.finish_session(&session_id, AccessSessionStatus::AccessGranted, "granted");
            self.events.record(
                &session_id,
                request.user_id,
                &request.door_id,
                "access_granted",
                &format!("confidence {:.3} >= {:.3}", outcome.confidence, threshold),
            );
            info!(
                session_id = %session_id,
                user_id = request.user_id,
                strategy = %registered_id,
                confidence = outcome.confidence,
                "access granted"
            );

            Ok(AccessDecision {
                session_id,
                allowed: true,
                status: AccessSessionStatus::AccessGranted,
                reason: "granted".to_string(),
                confidence: outcome.confidence,
                threshold,
                risk_level: Some(risk_level),
                strategy_id: Some(registered_id),
                duration: Some(duration),
                processing_time: started.elapsed(),
            })
        } else {
            let reason = format!(
                "Authentication confidence {:.3} below threshold {:.3}: {}",
                outcome.confidence, threshold, outcome.fusion.message
            );
            Ok(self.deny(
                session_id,
                reason,
                Some(risk_level),
                Some(registered_id),
                outcome.confidence,
                threshold,
                &request,
                started,
            ))
        }
    }

    fn handle_emergency_request(
        &self,
        session_id: String,
        request: &AccessRequest,
        started: Instant,
    ) -> AccessDecision {
        let emergency = self
            .emergency
            .lock()
            .ok()
            .and_then(|guard| *guard);

        let exit_allowed = emergency.map(|e| e.allows_exit()).unwrap_or(false);
        if exit_allowed && request.access_type == AccessType::Exit {
            let duration = access_duration(AccessType::Emergency);
            self.counters.granted.fetch_add(1, Ordering::Relaxed);
            self.doors.control(&request.door_id, true, duration);
            self.finish_session(&session_id, AccessSessionStatus::AccessGranted, "emergency exit");
            self.events.record(
                &session_id,
                request.user_id,
                &request.door_id,
                "access_granted",
                "emergency exit",
            );
            info!(session_id = %session_id, ?emergency, "emergency exit granted");

            AccessDecision {
                session_id,
                allowed: true,
                status: AccessSessionStatus::AccessGranted,
                reason: "Emergency exit allowed".to_string(),
                confidence: 1.0,
                threshold: 0.0,
                risk_level: None,
                strategy_id: None,
                duration: Some(duration),
                processing_time: started.elapsed(),
            }
        } else {
            self.deny(
                session_id,
                format!("Emergency mode active ({:?})", emergency),
                None,
                None,
                0.0,
                0.0,
                request,
                started,
            )
        }
    }

    pub fn trigger_emergency(&self, emergency: EmergencyType, reason: &str, actor: &str) {
        if let Ok(mut guard) = self.emergency.lock() {
            *guard = Some(emergency);
        }
        self.emergency_active.store(true, Ordering::Release);
        self.events.record("-", 0, "-", "emergency_triggered", reason);
        warn!(?emergency, reason, actor, "emergency mode activated");
    }

    pub fn release_emergency(&self, reason: &str, actor: &str) {
        if let Ok(mut guard) = self.emergency.lock() {
            *guard = None;
        }
        self.emergency_active.store(false, Ordering::Release);
        self.events.record("-", 0, "-", "emergency_released", reason);
        info!(reason, actor, "emergency mode released");
    }

    pub fn emergency_active(&self) -> bool {
        self.emergency_active.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RealTimeStatus {
        RealTimeStatus {
            accepting: self.accepting.load(Ordering::Acquire),
            active_sessions: self.sessions.len(),
            emergency_active: self.emergency_active(),
            emergency_type: self.emergency.lock().ok().and_then(|guard| *guard),
            granted: self.counters.granted.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Two-phase drain: stop accepting work, mark every in-flight session
    /// Terminated, then propagate cleanup to the engine and liveness set.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);

        let in_flight: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in in_flight {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                self.events.record(
                    &session_id,
                    session.user_id,
                    &session.door_id,
                    "session_terminated",
                    "controller shutdown",
                );
                debug!(session_id = %session_id, "session terminated on shutdown");
            }
        }

        self.engine.shutdown();
        info!("access controller shut down");
    }
}
