pub mod challenge;
pub mod dwell;
pub mod evidence;
pub mod geometry;
pub mod landmark;

pub use challenge::{
    transition, ChallengeCompletion, ChallengeKind, DwellDurations, DwellSet, SessionState, Step,
    CHALLENGE_ORDER,
};
pub use dwell::{DwellPolicy, DwellTimer};
pub use evidence::{
    Evidence, FailureReason, ProofMetrics, SessionId, SessionStatus, VerificationPayload,
};
pub use geometry::{score, score_with, ScoringPolicy};
pub use landmark::{FrameObservation, Landmark, LandmarkInput, LANDMARK_COUNT};
