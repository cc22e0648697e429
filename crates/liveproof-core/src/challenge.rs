//! Challenge progression as a pure state-transition function.
//!
//! Sessions move along a fixed path:
//!
//! ```text
//! Idle → Initializing → AwaitingFace → ChallengeSmile → ChallengeBlink → Verifying → Success
//!                  \___________\______________\________________\______________\____→ Failure
//! ```
//!
//! [`transition`] handles everything driven by frame observations. Readiness,
//! the trust authority's verdict and aborts (cancel, timeout) have their own
//! functions. Nothing here owns a session; the caller holds the state and the
//! [`DwellSet`] and feeds them back in on each tick.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dwell::{DwellTimer, BLINK_REQUIRED_MS, SETTLE_REQUIRED_MS, SMILE_REQUIRED_MS};
use crate::landmark::FrameObservation;

/// One behavioural action the subject must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    Smile,
    Blink,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smile => "smile",
            Self::Blink => "blink",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which challenges are presented.
pub const CHALLENGE_ORDER: [ChallengeKind; 2] = [ChallengeKind::Smile, ChallengeKind::Blink];

/// Lifecycle state of a liveness session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Initializing,
    AwaitingFace,
    ChallengeSmile,
    ChallengeBlink,
    Verifying,
    Success,
    Failure,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Initializing => "INITIALIZING",
            Self::AwaitingFace => "AWAITING_FACE",
            Self::ChallengeSmile => "CHALLENGE_SMILE",
            Self::ChallengeBlink => "CHALLENGE_BLINK",
            Self::Verifying => "VERIFYING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// The challenge being performed in this state, if any.
    pub fn active_challenge(&self) -> Option<ChallengeKind> {
        match self {
            Self::ChallengeSmile => Some(ChallengeKind::Smile),
            Self::ChallengeBlink => Some(ChallengeKind::Blink),
            _ => None,
        }
    }

    /// States subject to the stage time budget.
    pub fn is_time_bounded(&self) -> bool {
        matches!(
            self,
            Self::AwaitingFace | Self::ChallengeSmile | Self::ChallengeBlink | Self::Verifying
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown session state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for SessionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "IDLE" => Self::Idle,
            "INITIALIZING" => Self::Initializing,
            "AWAITING_FACE" => Self::AwaitingFace,
            "CHALLENGE_SMILE" => Self::ChallengeSmile,
            "CHALLENGE_BLINK" => Self::ChallengeBlink,
            "VERIFYING" => Self::Verifying,
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            other => return Err(UnknownState(other.to_string())),
        })
    }
}

/// Required dwell durations, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DwellDurations {
    pub settle_ms: f64,
    pub smile_ms: f64,
    pub blink_ms: f64,
}

impl Default for DwellDurations {
    fn default() -> Self {
        Self {
            settle_ms: SETTLE_REQUIRED_MS,
            smile_ms: SMILE_REQUIRED_MS,
            blink_ms: BLINK_REQUIRED_MS,
        }
    }
}

/// Every dwell timer a session owns. Only the one matching the current state
/// is ticked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DwellSet {
    pub settle: DwellTimer,
    pub smile: DwellTimer,
    pub blink: DwellTimer,
}

impl DwellSet {
    pub fn new(durations: &DwellDurations) -> Self {
        Self {
            settle: DwellTimer::settle().with_required_ms(durations.settle_ms),
            smile: DwellTimer::smile().with_required_ms(durations.smile_ms),
            blink: DwellTimer::blink().with_required_ms(durations.blink_ms),
        }
    }

    pub fn challenge(&self, kind: ChallengeKind) -> &DwellTimer {
        match kind {
            ChallengeKind::Smile => &self.smile,
            ChallengeKind::Blink => &self.blink,
        }
    }

    /// Zero every timer. Used when a session is torn down.
    pub fn clear(&mut self) {
        self.settle.reset();
        self.smile.reset();
        self.blink.reset();
    }
}

impl Default for DwellSet {
    fn default() -> Self {
        Self::new(&DwellDurations::default())
    }
}

/// A challenge satisfied on this tick, with the score observed at that moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChallengeCompletion {
    pub kind: ChallengeKind,
    pub score: f32,
}

/// Outcome of one observation tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub state: SessionState,
    pub dwell: DwellSet,
    pub completed: Option<ChallengeCompletion>,
}

/// Apply one observation covering `elapsed_ms` to a session.
///
/// On every stage change the timer that was satisfied and the timer of the
/// stage being entered are both zeroed, so no progress carries over.
pub fn transition(
    state: SessionState,
    mut dwell: DwellSet,
    observation: &FrameObservation,
    elapsed_ms: f64,
) -> Step {
    let mut completed = None;

    let next = match state {
        SessionState::AwaitingFace => {
            if dwell.settle.tick(observation.face_detected, elapsed_ms) {
                dwell.settle.reset();
                dwell.smile.reset();
                SessionState::ChallengeSmile
            } else {
                state
            }
        }
        SessionState::ChallengeSmile => {
            if dwell.smile.tick(observation.smiling(), elapsed_ms) {
                dwell.smile.reset();
                dwell.blink.reset();
                completed = Some(ChallengeCompletion {
                    kind: ChallengeKind::Smile,
                    score: observation.smile_score,
                });
                SessionState::ChallengeBlink
            } else {
                state
            }
        }
        SessionState::ChallengeBlink => {
            if dwell.blink.tick(observation.blinking(), elapsed_ms) {
                dwell.blink.reset();
                completed = Some(ChallengeCompletion {
                    kind: ChallengeKind::Blink,
                    score: observation.blink_score,
                });
                SessionState::Verifying
            } else {
                state
            }
        }
        _ => state,
    };

    Step {
        state: next,
        dwell,
        completed,
    }
}

/// A start request moves an idle session into initialisation.
pub fn on_start(state: SessionState) -> SessionState {
    match state {
        SessionState::Idle => SessionState::Initializing,
        other => other,
    }
}

/// Capture and tracker reported ready.
pub fn on_ready(state: SessionState) -> SessionState {
    match state {
        SessionState::Initializing => SessionState::AwaitingFace,
        other => other,
    }
}

/// Capture or tracker failed to initialise.
pub fn on_setup_failed(state: SessionState) -> SessionState {
    match state {
        SessionState::Initializing => SessionState::Failure,
        other => other,
    }
}

/// The trust authority answered.
pub fn on_verdict(state: SessionState, accepted: bool) -> SessionState {
    match state {
        SessionState::Verifying if accepted => SessionState::Success,
        SessionState::Verifying => SessionState::Failure,
        other => other,
    }
}

/// Force a non-terminal session into Failure (cancel, timeout, lost
/// authority). Returns `None` when the session already ended, so a terminal
/// state is never transitioned twice.
pub fn abort(state: SessionState) -> Option<SessionState> {
    if state.is_terminal() {
        None
    } else {
        Some(SessionState::Failure)
    }
}
