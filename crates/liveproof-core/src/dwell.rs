//! Dwell-time accumulation: turns per-frame flags into sustained compliance.

/// Required smile hold time.
pub const SMILE_REQUIRED_MS: f64 = 1000.0;
/// Required continuous eye closure.
pub const BLINK_REQUIRED_MS: f64 = 300.0;
/// Continuous face presence before the first challenge starts.
pub const SETTLE_REQUIRED_MS: f64 = 500.0;
/// Rate at which smile progress drains while the smile is not held.
pub const SMILE_DECAY_FACTOR: f64 = 2.0;

/// What happens to accumulated time on a tick where the condition is absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DwellPolicy {
    /// Drain `factor × elapsed`, floored at zero. Tolerates brief tracking noise.
    Decay { factor: f64 },
    /// Drop straight to zero. The condition must hold without interruption.
    Reset,
}

/// Integrates a per-frame condition over elapsed time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DwellTimer {
    accumulated_ms: f64,
    required_ms: f64,
    policy: DwellPolicy,
}

impl DwellTimer {
    pub const fn new(required_ms: f64, policy: DwellPolicy) -> Self {
        Self {
            accumulated_ms: 0.0,
            required_ms,
            policy,
        }
    }

    pub const fn smile() -> Self {
        Self::new(
            SMILE_REQUIRED_MS,
            DwellPolicy::Decay {
                factor: SMILE_DECAY_FACTOR,
            },
        )
    }

    pub const fn blink() -> Self {
        Self::new(BLINK_REQUIRED_MS, DwellPolicy::Reset)
    }

    pub const fn settle() -> Self {
        Self::new(SETTLE_REQUIRED_MS, DwellPolicy::Reset)
    }

    /// Advance by `elapsed_ms`. Returns true once accumulated time strictly
    /// exceeds the requirement.
    ///
    /// Negative or non-finite elapsed values are treated as zero; the caller
    /// supplies monotonically increasing time.
    pub fn tick(&mut self, active: bool, elapsed_ms: f64) -> bool {
        let elapsed = if elapsed_ms.is_finite() {
            elapsed_ms.max(0.0)
        } else {
            0.0
        };

        if active {
            self.accumulated_ms += elapsed;
        } else {
            match self.policy {
                DwellPolicy::Decay { factor } => {
                    self.accumulated_ms = (self.accumulated_ms - factor * elapsed).max(0.0);
                }
                DwellPolicy::Reset => self.accumulated_ms = 0.0,
            }
        }

        self.is_satisfied()
    }

    pub fn is_satisfied(&self) -> bool {
        self.accumulated_ms > self.required_ms
    }

    pub fn reset(&mut self) {
        self.accumulated_ms = 0.0;
    }

    pub fn accumulated_ms(&self) -> f64 {
        self.accumulated_ms
    }

    pub fn required_ms(&self) -> f64 {
        self.required_ms
    }

    /// Progress towards the requirement in `[0, 1]`, for feedback rendering.
    pub fn progress(&self) -> f64 {
        if self.required_ms <= 0.0 {
            return 1.0;
        }
        (self.accumulated_ms / self.required_ms).clamp(0.0, 1.0)
    }

    /// Same policy, different requirement.
    pub fn with_required_ms(mut self, required_ms: f64) -> Self {
        self.required_ms = required_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smile_requires_strictly_more_than_one_second() {
        let mut timer = DwellTimer::smile();
        for _ in 0..10 {
            assert!(!timer.tick(true, 100.0));
        }
        // Exactly 1000 ms is not enough
        assert_eq!(timer.accumulated_ms(), 1000.0);
        assert!(!timer.is_satisfied());
        assert!(timer.tick(true, 100.0));
    }

    #[test]
    fn test_smile_decays_at_double_rate() {
        let mut timer = DwellTimer::smile();
        timer.tick(true, 600.0);
        timer.tick(false, 100.0);
        assert_eq!(timer.accumulated_ms(), 400.0);
        timer.tick(false, 500.0);
        assert_eq!(timer.accumulated_ms(), 0.0);
    }

    #[test]
    fn test_smile_survives_brief_tracking_loss() {
        let mut timer = DwellTimer::smile();
        timer.tick(true, 900.0);
        timer.tick(false, 50.0);
        assert_eq!(timer.accumulated_ms(), 800.0);
        assert!(timer.tick(true, 250.0));
    }

    #[test]
    fn test_blink_resets_on_interruption() {
        let mut timer = DwellTimer::blink();
        timer.tick(true, 100.0);
        timer.tick(true, 100.0);
        timer.tick(false, 1.0);
        assert_eq!(timer.accumulated_ms(), 0.0);
    }

    #[test]
    fn test_blink_satisfied_after_300ms() {
        let mut timer = DwellTimer::blink();
        assert!(!timer.tick(true, 100.0));
        assert!(!timer.tick(true, 100.0));
        assert!(!timer.tick(true, 100.0));
        assert!(timer.tick(true, 100.0));
    }

    #[test]
    fn test_negative_elapsed_ignored() {
        let mut timer = DwellTimer::smile();
        timer.tick(true, 300.0);
        timer.tick(true, -500.0);
        timer.tick(true, f64::NAN);
        assert_eq!(timer.accumulated_ms(), 300.0);
    }

    #[test]
    fn test_reset_and_progress() {
        let mut timer = DwellTimer::blink();
        timer.tick(true, 150.0);
        assert!((timer.progress() - 0.5).abs() < 1e-9);
        timer.reset();
        assert_eq!(timer.accumulated_ms(), 0.0);
        assert_eq!(timer.progress(), 0.0);
    }

    #[test]
    fn test_with_required_ms_keeps_policy() {
        let timer = DwellTimer::smile().with_required_ms(2000.0);
        assert_eq!(timer.required_ms(), 2000.0);
        let mut t = timer;
        t.tick(true, 1000.0);
        t.tick(false, 100.0);
        assert_eq!(t.accumulated_ms(), 800.0);
    }
}
