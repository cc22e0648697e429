use std::time::Duration;

use liveproof_core::{DwellDurations, ScoringPolicy};

use crate::rate_limiter::RateLimitPolicy;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint of the trust authority that accepts or rejects evidence.
    pub authority_url: String,
    /// Timeout in seconds for the trust authority call.
    pub verify_timeout_secs: u64,
    /// Time allowed for capture and tracker to report ready.
    pub init_timeout_secs: u64,
    /// Longest a session may stay in any one of AwaitingFace, a challenge
    /// stage, or Verifying before it is failed.
    pub stage_timeout_secs: u64,
    /// How long a finished session stays queryable before it is forgotten.
    pub terminal_retention_secs: u64,
    /// Upper bound on concurrently running (non-terminal) sessions.
    pub max_sessions: usize,
    /// Ratio thresholds for smile and blink scoring.
    pub scoring: ScoringPolicy,
    /// Required hold times for face settle, smile and blink.
    pub dwell: DwellDurations,
    /// Per-caller lockout after repeated failed sessions.
    pub rate_limit: RateLimitPolicy,
    /// Whether the daemon is running on the session bus (development mode).
    /// Caller UID lookup is skipped on the session bus; rate limiting keys on
    /// the sender's bus name instead.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            authority_url: "http://127.0.0.1:8080/v1/liveness/verify".to_string(),
            verify_timeout_secs: 10,
            init_timeout_secs: 10,
            stage_timeout_secs: 30,
            terminal_retention_secs: 60,
            max_sessions: 64,
            scoring: ScoringPolicy::default(),
            dwell: DwellDurations::default(),
            rate_limit: RateLimitPolicy::default(),
            session_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from `LIVEPROOF_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let scoring = ScoringPolicy {
            smile_floor: env_f32("LIVEPROOF_SMILE_FLOOR", defaults.scoring.smile_floor),
            smile_gain: env_f32("LIVEPROOF_SMILE_GAIN", defaults.scoring.smile_gain),
            smile_trigger: env_f32("LIVEPROOF_SMILE_TRIGGER", defaults.scoring.smile_trigger),
            blink_open: env_f32("LIVEPROOF_BLINK_OPEN", defaults.scoring.blink_open),
            blink_gain: env_f32("LIVEPROOF_BLINK_GAIN", defaults.scoring.blink_gain),
            blink_trigger: env_f32("LIVEPROOF_BLINK_TRIGGER", defaults.scoring.blink_trigger),
        };
        let dwell = DwellDurations {
            settle_ms: env_f64("LIVEPROOF_SETTLE_MS", defaults.dwell.settle_ms),
            smile_ms: env_f64("LIVEPROOF_SMILE_DWELL_MS", defaults.dwell.smile_ms),
            blink_ms: env_f64("LIVEPROOF_BLINK_DWELL_MS", defaults.dwell.blink_ms),
        };
        let rate_limit = RateLimitPolicy {
            max_failures: env_u32("LIVEPROOF_MAX_FAILURES", defaults.rate_limit.max_failures),
            window: Duration::from_secs(env_u64(
                "LIVEPROOF_FAILURE_WINDOW_SECS",
                defaults.rate_limit.window.as_secs(),
            )),
            lockout: Duration::from_secs(env_u64(
                "LIVEPROOF_LOCKOUT_SECS",
                defaults.rate_limit.lockout.as_secs(),
            )),
        };

        Self {
            authority_url: std::env::var("LIVEPROOF_AUTHORITY_URL")
                .unwrap_or(defaults.authority_url),
            verify_timeout_secs: env_u64("LIVEPROOF_VERIFY_TIMEOUT_SECS", defaults.verify_timeout_secs),
            init_timeout_secs: env_u64("LIVEPROOF_INIT_TIMEOUT_SECS", defaults.init_timeout_secs),
            stage_timeout_secs: env_u64("LIVEPROOF_STAGE_TIMEOUT_SECS", defaults.stage_timeout_secs),
            terminal_retention_secs: env_u64(
                "LIVEPROOF_TERMINAL_RETENTION_SECS",
                defaults.terminal_retention_secs,
            ),
            max_sessions: env_usize("LIVEPROOF_MAX_SESSIONS", defaults.max_sessions),
            scoring,
            dwell,
            rate_limit,
            session_bus: std::env::var("LIVEPROOF_SESSION_BUS").is_ok(),
        }
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
