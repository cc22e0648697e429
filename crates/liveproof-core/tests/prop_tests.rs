use proptest::prelude::*;

use liveproof_core::geometry::{self, synthetic, ScoringPolicy};
use liveproof_core::{
    score, transition, DwellSet, DwellTimer, FrameObservation, Landmark, LandmarkInput,
    SessionState, LANDMARK_COUNT,
};

fn smiling() -> FrameObservation {
    FrameObservation {
        face_detected: true,
        smile_score: 1.0,
        is_smile: true,
        ..FrameObservation::no_face()
    }
}

proptest! {
    /// Incomplete landmark sets never count as a detected face.
    #[test]
    fn short_landmark_sets_score_nothing(
        len in 0usize..LANDMARK_COUNT,
        x in 0.0f32..1.0,
        y in 0.0f32..1.0,
    ) {
        let points = vec![Landmark::new(x, y, 0.0); len];
        let obs = score(&LandmarkInput::Face(points));
        prop_assert!(!obs.face_detected);
        prop_assert_eq!(obs.smile_score, 0.0);
        prop_assert_eq!(obs.blink_score, 0.0);
    }

    /// Smile score never decreases as the ratio grows.
    #[test]
    fn smile_score_monotonic(a in 0.0f32..1.0, b in 0.0f32..1.0) {
        let policy = ScoringPolicy::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(geometry::smile_score(lo, &policy) <= geometry::smile_score(hi, &policy));
    }

    /// Ratios at or beyond 0.65 saturate at exactly 1.0.
    #[test]
    fn smile_score_saturates(ratio in 0.65f32..5.0) {
        prop_assert_eq!(geometry::smile_score(ratio, &ScoringPolicy::default()), 1.0);
    }

    /// Between the score floor and the trigger the subject gets feedback but no credit.
    #[test]
    fn smile_feedback_band(ratio in 0.46f32..0.575) {
        let obs = score(&LandmarkInput::Face(synthetic::face(ratio, 0.3)));
        prop_assert!(obs.smile_score > 0.0);
        prop_assert!(!obs.is_smile);
    }

    /// Scores always stay inside [0, 1].
    #[test]
    fn scores_bounded(ratio in 0.0f32..3.0, ear in 0.0f32..3.0) {
        let obs = score(&LandmarkInput::Face(synthetic::face(ratio, ear)));
        prop_assert!((0.0..=1.0).contains(&obs.smile_score));
        prop_assert!((0.0..=1.0).contains(&obs.blink_score));
    }

    /// When total decay outweighs total accumulation the smile is never satisfied,
    /// and accumulated time never drops below zero.
    #[test]
    fn smile_decay_dominates(ticks in prop::collection::vec((1.0f64..200.0, 1.0f64..200.0), 1..50)) {
        let mut timer = DwellTimer::smile();
        for (on, off) in ticks {
            // Each off period drains 2×off; requiring on <= 2×off keeps the net non-positive
            let on = on.min(2.0 * off);
            prop_assert!(!timer.tick(true, on));
            prop_assert!(!timer.tick(false, off));
            prop_assert!(timer.accumulated_ms() >= 0.0);
            prop_assert_eq!(timer.accumulated_ms(), 0.0);
        }
    }

    /// A single interrupted tick wipes all blink progress.
    #[test]
    fn blink_interruption_resets(holds in prop::collection::vec(0.0f64..100.0, 0..3), gap in 0.0f64..1000.0) {
        let mut timer = DwellTimer::blink();
        for hold in holds {
            timer.tick(true, hold);
        }
        timer.tick(false, gap);
        prop_assert_eq!(timer.accumulated_ms(), 0.0);
    }

    /// From ChallengeSmile nothing but a satisfied smile dwell moves the session.
    #[test]
    fn smile_stage_holds_without_smile(
        face in any::<bool>(),
        blink in any::<bool>(),
        elapsed in 0.0f64..10_000.0,
    ) {
        let obs = FrameObservation {
            face_detected: face,
            is_smile: false,
            is_blink: blink,
            smile_score: 0.3,
            blink_score: if blink { 1.0 } else { 0.0 },
        };
        let step = transition(SessionState::ChallengeSmile, DwellSet::default(), &obs, elapsed);
        prop_assert_eq!(step.state, SessionState::ChallengeSmile);
    }

    /// Accumulated smile time never exceeds the requirement once the stage moves on.
    #[test]
    fn smile_timer_cleared_on_transition(steps in prop::collection::vec(1.0f64..400.0, 1..40)) {
        let mut state = SessionState::ChallengeSmile;
        let mut dwell = DwellSet::default();
        for elapsed in steps {
            let step = transition(state, dwell, &smiling(), elapsed);
            if step.state != state {
                prop_assert_eq!(step.dwell.smile.accumulated_ms(), 0.0);
            }
            state = step.state;
            dwell = step.dwell;
        }
    }
}
