//! Session identity, verification evidence and terminal outcomes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::challenge::{ChallengeCompletion, ChallengeKind, SessionState};

/// Unguessable session token. Bound into the evidence so the trust authority
/// can tie a submission to the session it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// A fresh random (v4) identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Scores observed at the moment each challenge was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofMetrics {
    pub smile_score: f32,
    pub blink_score: f32,
}

/// Challenge-completion evidence accumulated during a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    challenges: Vec<ChallengeKind>,
    proof: ProofMetrics,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, completion: ChallengeCompletion) {
        match completion.kind {
            ChallengeKind::Smile => self.proof.smile_score = completion.score,
            ChallengeKind::Blink => self.proof.blink_score = completion.score,
        }
        self.challenges.push(completion.kind);
    }

    pub fn challenges(&self) -> &[ChallengeKind] {
        &self.challenges
    }

    pub fn proof(&self) -> ProofMetrics {
        self.proof
    }

    /// Package for submission, stamped with the submission time.
    pub fn into_payload(self, session_id: SessionId) -> VerificationPayload {
        VerificationPayload {
            session_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            challenges: self.challenges,
            proof: self.proof,
        }
    }
}

/// Body submitted to the trust authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationPayload {
    pub session_id: SessionId,
    /// Submission time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub challenges: Vec<ChallengeKind>,
    pub proof: ProofMetrics,
}

/// Why a session ended in Failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Capture or tracker could not initialise.
    SetupFailure,
    /// The trust authority rejected the evidence.
    VerificationRejected,
    /// The trust authority could not be reached or answered garbage.
    VerificationUnreachable,
    /// A stage exceeded its time budget.
    Timeout,
    /// The caller cancelled the session.
    Cancelled,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SetupFailure => "setup_failure",
            Self::VerificationRejected => "verification_rejected",
            Self::VerificationUnreachable => "verification_unreachable",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Externally visible snapshot of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Set exactly when `state` is Failure.
    pub reason: Option<FailureReason>,
}

impl SessionStatus {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            state: SessionState::Failure,
            reason: Some(reason),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
