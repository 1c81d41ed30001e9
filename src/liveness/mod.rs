//! Challenge-response liveness verification. One session per authentication
//! attempt; sessions leave the active set the instant they reach a terminal
//! state, either on the touch that observes it or via the periodic sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::common::config::LivenessConfig;
use crate::common::types::OperationIdGenerator;
use crate::algorithm::matcher::SampleQuality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Blink,
    HeadMovement,
    Smile,
    TextureAnalysis,
    MultiChallenge,
}

/// A single step in a session's challenge sequence.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub challenge_type: ChallengeType,
    pub timeout: Duration,
    pub min_score: f64,
    /// How many passing frames the challenge needs before it counts as done.
    pub required_passes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug)]
pub struct LivenessSession {
    pub session_id: String,
    pub user_id: u64,
    pub device_id: String,
    pub challenge_type: ChallengeType,
    pub sequence: Vec<Challenge>,
    pub current_index: usize,
    pub completed: Vec<bool>,
    /// Passing frames accumulated against the current challenge.
    pub pass_count: u32,
    pub failed_attempts: u32,
    pub status: SessionStatus,
    pub started_at: Instant,
    pub timeout: Duration,
}

impl LivenessSession {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) >= self.timeout
    }

    pub fn current_challenge(&self) -> Option<&Challenge> {
        self.sequence.get(self.current_index)
    }
}

/// Outcome of a single frame check against a session.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub session_status: SessionStatus,
    pub challenge_passed: bool,
    pub challenge_score: f64,
    pub current_index: usize,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct LivenessStatistics {
    pub sessions_created: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_timed_out: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

pub struct LivenessEngine {
    config: LivenessConfig,
    sessions: DashMap<String, LivenessSession>,
    ids: OperationIdGenerator,
    counters: Counters,
}

impl LivenessEngine {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            ids: OperationIdGenerator::new("LIVE"),
            counters: Counters::default(),
        }
    }

    fn challenge_for(&self, challenge_type: ChallengeType) -> Challenge {
        let timeout_ms = match challenge_type {
            ChallengeType::Blink => self.config.blink_timeout_ms,
            ChallengeType::HeadMovement => self.config.head_movement_timeout_ms,
            ChallengeType::Smile => self.config.expression_timeout_ms,
            ChallengeType::TextureAnalysis => self.config.texture_timeout_ms,
            ChallengeType::MultiChallenge => self.config.session_timeout_ms,
        };
        // a blink challenge needs min_blinks detected blinks; every other
        // challenge completes on a single passing frame
        let required_passes = match challenge_type {
            ChallengeType::Blink => self.config.min_blinks.max(1),
            _ => 1,
        };
        Challenge {
            challenge_type,
            timeout: Duration::from_millis(timeout_ms),
            min_score: self.config.min_challenge_score,
            required_passes,
        }
    }

    fn build_sequence(&self, challenge_type: ChallengeType) -> Vec<Challenge> {
        match challenge_type {
            ChallengeType::MultiChallenge => {
                // Randomized order so a replayed recording cannot anticipate
                // the challenge sequence.
                let mut kinds = [
                    ChallengeType::Blink,
                    ChallengeType::HeadMovement,
                    ChallengeType::Smile,
                ];
                kinds.shuffle(&mut rand::thread_rng());
                kinds.iter().map(|&k| self.challenge_for(k)).collect()
            }
            other => vec![self.challenge_for(other)],
        }
    }

    pub fn create_session(
        &self,
        user_id: u64,
        device_id: &str,
        challenge_type: ChallengeType,
    ) -> String {
        let session_id = self.ids.next();
        let sequence = self.build_sequence(challenge_type);
        let completed = vec![false; sequence.len()];

        let session = LivenessSession {
            session_id: session_id.clone(),
            user_id,
            device_id: device_id.to_string(),
            challenge_type,
            sequence,
            current_index: 0,
            completed,
            pass_count: 0,
            failed_attempts: 0,
            status: SessionStatus::Active,
            started_at: Instant::now(),
            timeout: Duration::from_millis(self.config.session_timeout_ms),
        };

        self.sessions.insert(session_id.clone(), session);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, session_id = %session_id, ?challenge_type, "liveness session created");
        session_id
    }

    /// Score a frame against a challenge from its image statistics. A frame
    /// needs enough contrast (texture), and each challenge type weights the
    /// statistics differently.
    fn score_frame(challenge: &Challenge, frame: &[u8]) -> f64 {
        if frame.is_empty() {
            return 0.0;
        }
        let quality = SampleQuality::measure(frame);
        match challenge.challenge_type {
            ChallengeType::TextureAnalysis => quality.contrast_score,
            ChallengeType::Blink => quality.contrast_score * 0.7 + quality.brightness_score * 0.3,
            ChallengeType::HeadMovement | ChallengeType::Smile | ChallengeType::MultiChallenge => {
                quality.overall_score
            }
        }
    }

    /// Check a presented frame against the session's current challenge.
    ///
    /// `None` means the session does not exist, which callers must treat as a
    /// valid outcome: it was either never created or already evicted on
    /// timeout.
    pub fn process_frame(&self, session_id: &str, frame: &[u8]) -> Option<FrameOutcome> {
        let now = Instant::now();
        let max_failed = self.config.max_failed_attempts;

        let outcome = {
            let mut entry = self.sessions.get_mut(session_id)?;
            let session = entry.value_mut();

            if session.is_expired(now) {
                session.status = SessionStatus::Timeout;
                FrameOutcome {
                    session_status: SessionStatus::Timeout,
                    challenge_passed: false,
                    challenge_score: 0.0,
                    current_index: session.current_index,
                    message: "Liveness session timed out".to_string(),
                }
            } else if let Some(challenge) = session.current_challenge().cloned() {
                let score = Self::score_frame(&challenge, frame);

                if score >= challenge.min_score {
                    session.pass_count += 1;
                    let challenge_done = session.pass_count >= challenge.required_passes;
                    if challenge_done {
                        session.completed[session.current_index] = true;
                        session.current_index += 1;
                        session.pass_count = 0;
                        if session.completed.iter().all(|&done| done) {
                            session.status = SessionStatus::Completed;
                        }
                    }
                    FrameOutcome {
                        session_status: session.status,
                        challenge_passed: true,
                        challenge_score: score,
                        current_index: session.current_index,
                        message: if challenge_done {
                            format!("Challenge {:?} passed", challenge.challenge_type)
                        } else {
                            format!(
                                "Challenge {:?} pass {} of {}",
                                challenge.challenge_type,
                                session.pass_count,
                                challenge.required_passes
                            )
                        },
                    }
                } else {
                    session.failed_attempts += 1;
                    if session.failed_attempts >= max_failed {
                        session.status = SessionStatus::Failed;
                    }
                    FrameOutcome {
                        session_status: session.status,
                        challenge_passed: false,
                        challenge_score: score,
                        current_index: session.current_index,
                        message: format!(
                            "Challenge {:?} score {:.2} below {:.2}",
                            challenge.challenge_type, score, challenge.min_score
                        ),
                    }
                }
            } else {
                // the frame that finishes the sequence also removes the
                // session, so an Active session past its last challenge is
                // corrupt; fail it and let the removal below evict it
                session.status = SessionStatus::Failed;
                FrameOutcome {
                    session_status: SessionStatus::Failed,
                    challenge_passed: false,
                    challenge_score: 0.0,
                    current_index: session.current_index,
                    message: "Challenge sequence exhausted".to_string(),
                }
            }
            // guard must be dropped before the remove below
        };

        if outcome.session_status != SessionStatus::Active {
            if self.sessions.remove(session_id).is_some() {
                match outcome.session_status {
                    SessionStatus::Completed => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        info!(session_id, "liveness check completed");
                    }
                    SessionStatus::Failed => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(session_id, "liveness check failed");
                    }
                    SessionStatus::Timeout => {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!(session_id, "liveness session evicted on timeout");
                    }
                    SessionStatus::Active => {}
                }
            }
        }

        Some(outcome)
    }

    /// Evict every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if self.sessions.remove(&id).is_some() {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept expired liveness sessions");
        }
        removed
    }

    pub fn statistics(&self) -> LivenessStatistics {
        LivenessStatistics {
            sessions_created: self.counters.created.load(Ordering::Relaxed),
            sessions_completed: self.counters.completed.load(Ordering::Relaxed),
            sessions_failed: self.counters.failed.load(Ordering::Relaxed),
            sessions_timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            active_sessions: self.sessions.len(),
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_frame() -> Vec<u8> {
        (0..512).map(|i| (i * 29 % 256) as u8).collect()
    }

    fn flat_frame() -> Vec<u8> {
        vec![128u8; 512]
    }

    fn engine() -> LivenessEngine {
        LivenessEngine::new(LivenessConfig::default())
    }

    #[test]
    fn single_challenge_completes_on_passing_frame() {
        let engine = engine();
        let id = engine.create_session(1, "dev-1", ChallengeType::TextureAnalysis);

        let outcome = engine.process_frame(&id, &live_frame()).unwrap();
        assert!(outcome.challenge_passed);
        assert_eq!(outcome.session_status, SessionStatus::Completed);

        // terminal sessions leave the active set immediately
        assert!(engine.process_frame(&id, &live_frame()).is_none());
        assert_eq!(engine.active_session_count(), 0);
    }

    #[test]
    fn multi_challenge_needs_every_step() {
        let engine = engine();
        let id = engine.create_session(1, "dev-1", ChallengeType::MultiChallenge);

        let first = engine.process_frame(&id, &live_frame()).unwrap();
        assert!(first.challenge_passed);
        assert_eq!(first.session_status, SessionStatus::Active);

        let second = engine.process_frame(&id, &live_frame()).unwrap();
        assert_eq!(second.session_status, SessionStatus::Active);

        let third = engine.process_frame(&id, &live_frame()).unwrap();
        assert_eq!(third.session_status, SessionStatus::Completed);
    }

    #[test]
    fn blink_challenge_requires_configured_blink_count() {
        let mut config = LivenessConfig::default();
        config.min_blinks = 3;
        let engine = LivenessEngine::new(config);
        let id = engine.create_session(1, "dev-1", ChallengeType::Blink);

        for _ in 0..2 {
            let outcome = engine.process_frame(&id, &live_frame()).unwrap();
            assert!(outcome.challenge_passed);
            assert_eq!(outcome.session_status, SessionStatus::Active);
            assert_eq!(outcome.current_index, 0);
        }

        let third = engine.process_frame(&id, &live_frame()).unwrap();
        assert_eq!(third.session_status, SessionStatus::Completed);
        assert_eq!(engine.active_session_count(), 0);
    }

    #[test]
    fn exhausted_sequence_is_failed_and_evicted() {
        let engine = engine();
        let challenge = Challenge {
            challenge_type: ChallengeType::TextureAnalysis,
            timeout: Duration::from_secs(5),
            min_score: 0.5,
            required_passes: 1,
        };
        // an Active session already past its last challenge, which the normal
        // transitions never produce
        let session = LivenessSession {
            session_id: "LIVE-stranded".to_string(),
            user_id: 1,
            device_id: "dev-1".to_string(),
            challenge_type: ChallengeType::TextureAnalysis,
            sequence: vec![challenge],
            current_index: 1,
            completed: vec![true],
            pass_count: 0,
            failed_attempts: 0,
            status: SessionStatus::Active,
            started_at: Instant::now(),
            timeout: Duration::from_secs(60),
        };
        engine.sessions.insert(session.session_id.clone(), session);

        let outcome = engine.process_frame("LIVE-stranded", &live_frame()).unwrap();
        assert_eq!(outcome.session_status, SessionStatus::Failed);
        assert!(!outcome.challenge_passed);
        assert_eq!(engine.active_session_count(), 0);
    }

    #[test]
    fn repeated_failures_fail_the_session() {
        let mut config = LivenessConfig::default();
        config.max_failed_attempts = 2;
        let engine = LivenessEngine::new(config);
        let id = engine.create_session(1, "dev-1", ChallengeType::TextureAnalysis);

        let first = engine.process_frame(&id, &flat_frame()).unwrap();
        assert!(!first.challenge_passed);
        assert_eq!(first.session_status, SessionStatus::Active);

        let second = engine.process_frame(&id, &flat_frame()).unwrap();
        assert_eq!(second.session_status, SessionStatus::Failed);
        assert!(engine.process_frame(&id, &flat_frame()).is_none());
    }

    #[test]
    fn expired_session_is_evicted_even_on_a_passing_frame() {
        let mut config = LivenessConfig::default();
        config.session_timeout_ms = 1;
        let engine = LivenessEngine::new(config);
        let id = engine.create_session(1, "dev-1", ChallengeType::Blink);

        std::thread::sleep(Duration::from_millis(5));

        let outcome = engine.process_frame(&id, &live_frame()).unwrap();
        assert_eq!(outcome.session_status, SessionStatus::Timeout);
        assert!(!outcome.challenge_passed);
        assert_eq!(engine.active_session_count(), 0);
    }

    #[test]
    fn sweep_removes_expired_sessions() {
        let mut config = LivenessConfig::default();
        config.session_timeout_ms = 1;
        let engine = LivenessEngine::new(config);
        engine.create_session(1, "dev-1", ChallengeType::Blink);
        engine.create_session(2, "dev-1", ChallengeType::Smile);

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(engine.sweep_expired(), 2);
        assert_eq!(engine.active_session_count(), 0);
        assert_eq!(engine.statistics().sessions_timed_out, 2);
    }

    #[test]
    fn statistics_count_outcomes() {
        let engine = engine();
        let id = engine.create_session(1, "dev-1", ChallengeType::TextureAnalysis);
        engine.process_frame(&id, &live_frame());

        let stats = engine.statistics();
        assert_eq!(stats.sessions_created, 1);
        assert_eq!(stats.sessions_completed, 1);
        assert_eq!(stats.active_sessions, 0);
    }
}
