//! Active liveness scoring from face-mesh geometry.
//!
//! A subject asked to smile widens the mouth relative to the fixed distance
//! between the eye corners; a subject asked to blink collapses the vertical
//! eyelid gap relative to the eye width. Both ratios are scale-invariant, so
//! distance from the camera does not matter.
//!
//! The scorer is a pure function of a single frame. It keeps no state and
//! produces bit-identical output for identical input.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and static images (no expression change).
//! - **Does not block:** Pre-recorded video that happens to perform the same
//!   challenge sequence. The trust authority is the final gate.

use crate::landmark::{index, FrameObservation, Landmark, LandmarkInput, LANDMARK_COUNT};

/// Thresholds converting raw ratios into scores and trigger flags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringPolicy {
    /// Smile ratio at which the continuous smile score starts rising.
    pub smile_floor: f32,
    /// Slope of the smile score above `smile_floor`.
    pub smile_gain: f32,
    /// Smile ratio above which `is_smile` is set. Deliberately stricter than
    /// `smile_floor`: the score gives feedback early, the flag needs a
    /// pronounced smile.
    pub smile_trigger: f32,
    /// Eye aspect ratio at or above which the blink score is zero.
    pub blink_open: f32,
    /// Slope of the blink score below `blink_open`.
    pub blink_gain: f32,
    /// Eye aspect ratio below which `is_blink` is set.
    pub blink_trigger: f32,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            smile_floor: 0.45,
            smile_gain: 5.0,
            smile_trigger: 0.58,
            blink_open: 0.25,
            blink_gain: 5.0,
            blink_trigger: 0.18,
        }
    }
}

/// Mouth width divided by the distance between the eye reference corners.
///
/// Returns 0.0 for incomplete landmark sets and degenerate geometry.
pub fn smile_ratio(landmarks: &[Landmark]) -> f32 {
    if landmarks.len() < LANDMARK_COUNT {
        return 0.0;
    }

    let mouth_width =
        landmarks[index::MOUTH_LEFT].distance_2d(&landmarks[index::MOUTH_RIGHT]);
    let face_width =
        landmarks[index::LEFT_EYE_INNER].distance_2d(&landmarks[index::RIGHT_EYE_INNER]);

    if face_width == 0.0 {
        return 0.0;
    }

    mouth_width / face_width
}

/// Eye aspect ratio (vertical lid gap over eye width) of the left eye.
///
/// Returns 1.0 ("eyes open") for incomplete landmark sets and degenerate
/// geometry.
pub fn eye_aspect_ratio(landmarks: &[Landmark]) -> f32 {
    if landmarks.len() < LANDMARK_COUNT {
        return 1.0;
    }

    let vertical =
        landmarks[index::LEFT_EYE_TOP].distance_2d(&landmarks[index::LEFT_EYE_BOTTOM]);
    let horizontal =
        landmarks[index::LEFT_EYE_INNER].distance_2d(&landmarks[index::LEFT_EYE_OUTER]);

    if horizontal == 0.0 {
        return 1.0;
    }

    vertical / horizontal
}

/// Continuous smile score for a smile ratio, clamped to `[0, 1]`.
pub fn smile_score(ratio: f32, policy: &ScoringPolicy) -> f32 {
    // Pin the saturation point so ratios at or past it score exactly 1.0
    // regardless of rounding in the multiplication below.
    if ratio >= policy.smile_floor + 1.0 / policy.smile_gain {
        return 1.0;
    }
    ((ratio - policy.smile_floor) * policy.smile_gain).clamp(0.0, 1.0)
}

/// Continuous blink score for an eye aspect ratio, clamped to `[0, 1]`.
pub fn blink_score(ear: f32, policy: &ScoringPolicy) -> f32 {
    ((policy.blink_open - ear) * policy.blink_gain).clamp(0.0, 1.0)
}

/// Score a frame with the default policy.
pub fn score(input: &LandmarkInput) -> FrameObservation {
    score_with(input, &ScoringPolicy::default())
}

/// Score a frame with an explicit policy.
///
/// Incomplete sets and sets containing a non-finite coordinate are scored as
/// "no face".
pub fn score_with(input: &LandmarkInput, policy: &ScoringPolicy) -> FrameObservation {
    let landmarks = match input {
        LandmarkInput::Face(points)
            if points.len() >= LANDMARK_COUNT && points.iter().all(Landmark::is_finite) =>
        {
            points
        }
        _ => return FrameObservation::no_face(),
    };

    let ratio = smile_ratio(landmarks);
    let ear = eye_aspect_ratio(landmarks);

    FrameObservation {
        face_detected: true,
        smile_score: smile_score(ratio, policy),
        blink_score: blink_score(ear, policy),
        is_smile: ratio > policy.smile_trigger,
        is_blink: ear < policy.blink_trigger,
    }
}

/// Synthetic landmark sets with chosen ratios, for tests across the workspace.
#[cfg(any(test, feature = "testing"))]
pub mod synthetic {
    use super::*;

    const EYE_SPAN: f32 = 0.4;
    const EYE_WIDTH: f32 = 0.1;

    /// A full 468-point set whose smile ratio and eye aspect ratio are
    /// (up to float rounding) `smile_ratio` and `ear`.
    pub fn face(smile_ratio: f32, ear: f32) -> Vec<Landmark> {
        let mut points = vec![Landmark::new(0.5, 0.5, 0.0); LANDMARK_COUNT];

        points[index::LEFT_EYE_INNER] = Landmark::new(0.3, 0.4, 0.0);
        points[index::RIGHT_EYE_INNER] = Landmark::new(0.3 + EYE_SPAN, 0.4, 0.0);
        points[index::LEFT_EYE_OUTER] = Landmark::new(0.3 + EYE_WIDTH, 0.4, 0.0);

        let gap = ear * EYE_WIDTH;
        points[index::LEFT_EYE_TOP] = Landmark::new(0.35, 0.4 - gap / 2.0, 0.0);
        points[index::LEFT_EYE_BOTTOM] = Landmark::new(0.35, 0.4 + gap / 2.0, 0.0);

        let mouth = smile_ratio * EYE_SPAN;
        points[index::MOUTH_LEFT] = Landmark::new(0.5 - mouth / 2.0, 0.7, 0.0);
        points[index::MOUTH_RIGHT] = Landmark::new(0.5 + mouth / 2.0, 0.7, 0.0);

        points
    }

    /// Neutral face: mouth relaxed, eyes open.
    pub fn neutral() -> Vec<Landmark> {
        face(0.40, 0.30)
    }

    /// Wide smile, eyes open.
    pub fn smiling() -> Vec<Landmark> {
        face(0.70, 0.30)
    }

    /// Relaxed mouth, eyes closed.
    pub fn blinking() -> Vec<Landmark> {
        face(0.40, 0.10)
    }
}
