//! Facial landmark input and the per-frame observation derived from it.
//!
//! Landmarks come from an external face-mesh tracker using the 468-point
//! indexing scheme. Coordinates are normalised to the frame: `x` and `y` lie in
//! `[0, 1]`, `z` is relative depth and is ignored by the scorer.

use serde::{Deserialize, Serialize};

/// Number of points in a complete face-mesh landmark set.
pub const LANDMARK_COUNT: usize = 468;

/// Mesh indices used by the geometry scorer.
pub mod index {
    /// Left mouth corner.
    pub const MOUTH_LEFT: usize = 61;
    /// Right mouth corner.
    pub const MOUTH_RIGHT: usize = 291;
    /// Left eye inner corner (also the smile reference and EAR horizontal start).
    pub const LEFT_EYE_INNER: usize = 33;
    /// Right eye inner corner (smile reference end).
    pub const RIGHT_EYE_INNER: usize = 263;
    /// Left eye outer corner.
    pub const LEFT_EYE_OUTER: usize = 133;
    /// Left eye upper lid.
    pub const LEFT_EYE_TOP: usize = 159;
    /// Left eye lower lid.
    pub const LEFT_EYE_BOTTOM: usize = 145;
}

/// One tracked facial keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// True when no coordinate is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Planar Euclidean distance to `other`.
    pub fn distance_2d(&self, other: &Landmark) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl From<(f32, f32, f32)> for Landmark {
    fn from((x, y, z): (f32, f32, f32)) -> Self {
        Self { x, y, z }
    }
}

/// What the tracker reported for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum LandmarkInput {
    /// A landmark set for the (single) tracked face.
    Face(Vec<Landmark>),
    /// The tracker found no face in this frame.
    NoFace,
}

/// Scores derived from a single frame.
///
/// The continuous scores drive visual feedback and are recorded as proof
/// metrics; the binary flags are what the dwell accumulators integrate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameObservation {
    pub face_detected: bool,
    /// Normalised smile score in `[0, 1]`.
    pub smile_score: f32,
    /// Normalised blink score in `[0, 1]`.
    pub blink_score: f32,
    /// Pronounced smile, strict enough to count as challenge evidence.
    pub is_smile: bool,
    /// Eyes closed.
    pub is_blink: bool,
}

impl FrameObservation {
    /// The observation for a frame without a usable face.
    pub const fn no_face() -> Self {
        Self {
            face_detected: false,
            smile_score: 0.0,
            blink_score: 0.0,
            is_smile: false,
            is_blink: false,
        }
    }

    /// Both scores are finite and within `[0, 1]`.
    ///
    /// Always true for scorer output; observations arriving from outside the
    /// process must be checked before they reach a session.
    pub fn is_well_formed(&self) -> bool {
        let unit = 0.0..=1.0;
        unit.contains(&self.smile_score) && unit.contains(&self.blink_score)
    }

    /// Face present and smiling.
    pub fn smiling(&self) -> bool {
        self.face_detected && self.is_smile
    }

    /// Face present and eyes closed.
    pub fn blinking(&self) -> bool {
        self.face_detected && self.is_blink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_ignores_depth() {
        let a = Landmark::new(0.0, 0.0, 5.0);
        let b = Landmark::new(3.0, 4.0, -5.0);
        assert!((a.distance_2d(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_face_observation_is_inert() {
        let obs = FrameObservation::no_face();
        assert!(!obs.face_detected);
        assert_eq!(obs.smile_score, 0.0);
        assert_eq!(obs.blink_score, 0.0);
        assert!(!obs.smiling());
        assert!(!obs.blinking());
    }

    #[test]
    fn test_non_finite_landmark() {
        assert!(Landmark::new(0.1, 0.2, 0.0).is_finite());
        assert!(!Landmark::new(f32::NAN, 0.2, 0.0).is_finite());
        assert!(!Landmark::new(0.1, 0.2, f32::INFINITY).is_finite());
    }

    #[test]
    fn test_well_formed_scores() {
        assert!(FrameObservation::no_face().is_well_formed());
        let edge = FrameObservation {
            face_detected: true,
            smile_score: 1.0,
            blink_score: 0.0,
            is_smile: true,
            is_blink: false,
        };
        assert!(edge.is_well_formed());

        for (smile_score, blink_score) in [
            (f32::NAN, 0.0),
            (0.5, 42.0),
            (-0.1, 0.5),
            (f32::INFINITY, 0.0),
        ] {
            let obs = FrameObservation {
                smile_score,
                blink_score,
                ..edge
            };
            assert!(!obs.is_well_formed(), "{smile_score} / {blink_score}");
        }
    }

    #[test]
    fn test_flags_require_face() {
        let obs = FrameObservation {
            face_detected: false,
            smile_score: 1.0,
            blink_score: 1.0,
            is_smile: true,
            is_blink: true,
        };
        assert!(!obs.smiling());
        assert!(!obs.blinking());
    }
}
