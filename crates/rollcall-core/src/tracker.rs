//! Attendance debounce state machine.
//!
//! Turns a stream of classification results and per-frame face counts into
//! attendance decisions: at most one event per identity per cooldown window,
//! and a return to `Waiting` once the subject has left the frame.
//!
//! Time is passed in by the caller so the machine is deterministic.

use crate::types::MatchResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What to do when a different identity clears the acceptance threshold while
/// another one is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySwitch {
    /// Ignore the newcomer until the cooldown since the last event has elapsed.
    #[default]
    HoldUntilCooldown,
    /// Recognize the newcomer right away.
    Immediate,
}

/// When an empty frame returns the tracker to `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbsenceReset {
    /// Only once the cooldown since the last event has elapsed.
    #[default]
    AfterCooldown,
    /// On the first frame without faces.
    Immediate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerPolicy {
    /// A match must be strictly more confident than this to be logged.
    pub acceptance_threshold: f32,
    pub cooldown: Duration,
    pub identity_switch: IdentitySwitch,
    pub absence_reset: AbsenceReset,
}

impl Default for TrackerPolicy {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.6,
            cooldown: Duration::from_secs(3),
            identity_switch: IdentitySwitch::default(),
            absence_reset: AbsenceReset::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceState {
    Waiting,
    Recognized {
        identity: String,
        /// Last classification cycle that saw this identity.
        last_seen: Instant,
    },
}

/// Result of feeding one match into the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Emit an attendance event.
    Log { identity: String, confidence: f32 },
    /// The recognized identity is still in front of the camera.
    StillPresent,
    /// A different identity was ignored to avoid thrashing.
    Held { candidate: String },
    /// The identity was logged less than a cooldown ago.
    CoolingDown,
    /// Unknown, or not confident enough to log.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct AttendanceTracker {
    policy: TrackerPolicy,
    state: PresenceState,
    last_event: Option<Instant>,
    /// Last event per identity, pruned once older than the cooldown.
    recent: HashMap<String, Instant>,
}

impl AttendanceTracker {
    pub fn new(policy: TrackerPolicy) -> Self {
        Self {
            policy,
            state: PresenceState::Waiting,
            last_event: None,
            recent: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &TrackerPolicy {
        &self.policy
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    pub fn last_event(&self) -> Option<Instant> {
        self.last_event
    }

    /// Currently recognized identity, if any.
    pub fn current(&self) -> Option<&str> {
        match &self.state {
            PresenceState::Recognized { identity, .. } => Some(identity),
            PresenceState::Waiting => None,
        }
    }

    /// When the recognized identity was last matched; the "still present"
    /// indicator. `None` while waiting.
    pub fn last_seen(&self) -> Option<Instant> {
        match &self.state {
            PresenceState::Recognized { last_seen, .. } => Some(*last_seen),
            PresenceState::Waiting => None,
        }
    }

    fn elapsed_since(&self, then: Instant, now: Instant) -> bool {
        now.saturating_duration_since(then) > self.policy.cooldown
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_event.map_or(true, |t| self.elapsed_since(t, now))
    }

    fn identity_ready(&self, identity: &str, now: Instant) -> bool {
        self.recent
            .get(identity)
            .map_or(true, |&t| self.elapsed_since(t, now))
    }

    /// Feed one classification result observed at `now`.
    pub fn observe_match(&mut self, result: &MatchResult, now: Instant) -> Decision {
        let Some(identity) = result
            .identity
            .as_deref()
            .filter(|_| result.confidence > self.policy.acceptance_threshold)
        else {
            return Decision::Rejected;
        };

        let switch_allowed = match &self.state {
            PresenceState::Waiting => true,
            PresenceState::Recognized { identity: current, .. } if current == identity => true,
            PresenceState::Recognized { .. } => {
                self.policy.identity_switch == IdentitySwitch::Immediate || self.cooldown_elapsed(now)
            }
        };

        if !switch_allowed {
            return Decision::Held {
                candidate: identity.to_string(),
            };
        }

        if self.identity_ready(identity, now) {
            self.record_event(identity, now);
            return Decision::Log {
                identity: identity.to_string(),
                confidence: result.confidence,
            };
        }

        let continuing = self.current() == Some(identity);
        self.state = PresenceState::Recognized {
            identity: identity.to_string(),
            last_seen: now,
        };
        if continuing {
            Decision::StillPresent
        } else {
            Decision::CoolingDown
        }
    }

    /// Feed the number of faces found in the frame captured at `now`.
    /// Returns `true` when this observation reset the tracker to `Waiting`.
    pub fn observe_faces(&mut self, faces: usize, now: Instant) -> bool {
        if faces > 0 || self.state == PresenceState::Waiting {
            return false;
        }
        let reset = match self.policy.absence_reset {
            AbsenceReset::Immediate => true,
            AbsenceReset::AfterCooldown => self.cooldown_elapsed(now),
        };
        if reset {
            tracing::debug!(identity = ?self.current(), "subject left, back to waiting");
            self.state = PresenceState::Waiting;
        }
        reset
    }

    fn record_event(&mut self, identity: &str, now: Instant) {
        let cooldown = self.policy.cooldown;
        self.recent
            .retain(|_, &mut t| now.saturating_duration_since(t) <= cooldown);
        self.recent.insert(identity.to_string(), now);
        self.last_event = Some(now);
        self.state = PresenceState::Recognized {
            identity: identity.to_string(),
            last_seen: now,
        };
    }
}
