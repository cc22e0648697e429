use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use zbus::interface;
use zbus::object_server::SignalEmitter;

use liveproof_core::{
    FailureReason, FrameObservation, Landmark, LandmarkInput, SessionId, SessionStatus,
};

use crate::config::Config;
use crate::controller::SessionController;
use crate::rate_limiter::RateLimiter;
use crate::session::SessionError;

pub const BUS_NAME: &str = "org.freedesktop.LiveProof1";
pub const OBJECT_PATH: &str = "/org/freedesktop/LiveProof1";

/// State shared by D-Bus method handlers that is not per-session.
pub struct AppState {
    pub config: Config,
    pub rate_limiter: RateLimiter,
}

/// D-Bus interface for the LiveProof liveness daemon.
///
/// Bus name: org.freedesktop.LiveProof1
/// Object path: /org/freedesktop/LiveProof1
pub struct LiveProofService {
    pub state: Arc<Mutex<AppState>>,
    /// Synchronised internally; never held under the `state` lock.
    pub controller: Arc<SessionController>,
}

impl LiveProofService {
    pub fn new(config: Config, controller: Arc<SessionController>) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit);
        Self {
            state: Arc::new(Mutex::new(AppState {
                config,
                rate_limiter,
            })),
            controller,
        }
    }

    /// Identify the caller and refuse it while it is locked out.
    ///
    /// On the system bus the caller is identified by UID; on the session bus
    /// (development mode) by its unique bus name.
    async fn admit(
        &self,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let session_bus = self.state.lock().await.config.session_bus;

        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        let caller = if session_bus {
            sender.to_string()
        } else {
            format!("uid:{}", get_caller_uid(sender.as_str(), conn).await?)
        };

        let mut state = self.state.lock().await;
        state.rate_limiter.check(&caller).map_err(|msg| {
            tracing::warn!(caller = %caller, "start_session: rate limited");
            zbus::fdo::Error::LimitsExceeded(msg)
        })?;
        Ok(caller)
    }

    /// Broadcast every status change of `id` as `StateChanged` and charge the
    /// final outcome to `caller`, including a timeout after the caller has
    /// gone quiet.
    async fn follow(
        &self,
        id: SessionId,
        caller: String,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        let status = self.controller.subscribe(id).await.map_err(session_error)?;
        let emitter = SignalEmitter::new(conn, OBJECT_PATH)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let state = Arc::clone(&self.state);
        tokio::spawn(follow_session(id, caller, status, emitter, state));
        Ok(())
    }
}

async fn follow_session(
    id: SessionId,
    caller: String,
    mut status: watch::Receiver<SessionStatus>,
    emitter: SignalEmitter<'static>,
    state: Arc<Mutex<AppState>>,
) {
    let mut current = *status.borrow_and_update();
    loop {
        if let Err(e) = LiveProofService::state_changed(
            &emitter,
            &id.to_string(),
            current.state.as_str(),
            &reason_code(current.reason),
        )
        .await
        {
            tracing::debug!(session_id = %id, error = %e, "failed to emit StateChanged");
        }

        if current.is_terminal() {
            state
                .lock()
                .await
                .rate_limiter
                .record_outcome(&caller, current.reason);
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
        current = *status.borrow_and_update();
    }
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn parse_session_id(session_id: &str) -> zbus::fdo::Result<SessionId> {
    session_id
        .parse()
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("malformed session id '{session_id}'")))
}

fn session_error(e: SessionError) -> zbus::fdo::Error {
    match e {
        SessionError::InvalidSession(_) | SessionError::InvalidObservation => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        SessionError::DuplicateSession(_) | SessionError::CapacityExceeded(_) => {
            zbus::fdo::Error::LimitsExceeded(e.to_string())
        }
    }
}

fn reason_code(reason: Option<FailureReason>) -> String {
    reason.map(|r| r.code().to_string()).unwrap_or_default()
}

fn readiness(ok: bool, reason: &str) -> Result<(), String> {
    match (ok, reason.trim()) {
        (true, _) => Ok(()),
        (false, "") => Err("capture setup failed".to_string()),
        (false, reason) => Err(reason.to_string()),
    }
}

#[interface(name = "org.freedesktop.LiveProof1")]
impl LiveProofService {
    /// Start a liveness session whose frames are already flowing. Returns the
    /// session id.
    async fn start_session(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller = self.admit(&header, conn).await?;
        let id = self.controller.start_session().await.map_err(|e| {
            tracing::error!(error = %e, "start_session failed");
            session_error(e)
        })?;
        self.follow(id, caller, conn).await?;

        tracing::info!(session_id = %id, "start_session: session created");
        Ok(id.to_string())
    }

    /// Start a session that stays INITIALIZING until `ReportReady` is called
    /// for it. Returns the session id.
    async fn start_deferred_session(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller = self.admit(&header, conn).await?;
        let id = self.controller.start_deferred_session().await.map_err(|e| {
            tracing::error!(error = %e, "start_deferred_session failed");
            session_error(e)
        })?;
        self.follow(id, caller, conn).await?;

        tracing::info!(session_id = %id, "start_deferred_session: awaiting readiness");
        Ok(id.to_string())
    }

    /// Report whether capture and tracking came up for a deferred session.
    /// `reason` describes a failure and is ignored when `ok` is true.
    async fn report_ready(&self, session_id: &str, ok: bool, reason: &str) -> zbus::fdo::Result<()> {
        let id = parse_session_id(session_id)?;
        self.controller
            .report_ready(id, readiness(ok, reason))
            .await
            .map_err(session_error)
    }

    /// Feed an already-scored observation. Scores must lie in `[0, 1]`.
    /// Returns the resulting state name and the current stage's dwell progress.
    async fn feed_observation(
        &self,
        session_id: &str,
        face_detected: bool,
        smile_score: f64,
        blink_score: f64,
        is_smile: bool,
        is_blink: bool,
        elapsed_ms: u64,
    ) -> zbus::fdo::Result<(String, f64)> {
        let id = parse_session_id(session_id)?;
        let observation = FrameObservation {
            face_detected,
            smile_score: smile_score as f32,
            blink_score: blink_score as f32,
            is_smile,
            is_blink,
        };
        let reply = self
            .controller
            .feed_observation(id, observation, elapsed_ms as f64)
            .await
            .map_err(session_error)?;
        Ok((reply.state.to_string(), reply.progress))
    }

    /// Feed a raw tracker frame; an empty array means no face. Returns the
    /// resulting state name, the frame's smile and blink scores, and the
    /// current stage's dwell progress.
    async fn feed_landmarks(
        &self,
        session_id: &str,
        landmarks: Vec<(f64, f64, f64)>,
        elapsed_ms: u64,
    ) -> zbus::fdo::Result<(String, f64, f64, f64)> {
        let id = parse_session_id(session_id)?;
        let input = if landmarks.is_empty() {
            LandmarkInput::NoFace
        } else {
            LandmarkInput::Face(
                landmarks
                    .into_iter()
                    .map(|(x, y, z)| Landmark::new(x as f32, y as f32, z as f32))
                    .collect(),
            )
        };
        let (reply, observation) = self
            .controller
            .feed_landmarks(id, &input, elapsed_ms as f64)
            .await
            .map_err(session_error)?;
        Ok((
            reply.state.to_string(),
            observation.smile_score as f64,
            observation.blink_score as f64,
            reply.progress,
        ))
    }

    /// Cancel a running session. Fails for finished or unknown sessions.
    async fn cancel_session(&self, session_id: &str) -> zbus::fdo::Result<()> {
        let id = parse_session_id(session_id)?;
        tracing::info!(session_id = %id, "cancel_session requested");
        self.controller.cancel_session(id).await.map_err(session_error)
    }

    /// Return `(state, failure_reason)`; the reason is empty unless the state
    /// is FAILURE.
    async fn get_state(&self, session_id: &str) -> zbus::fdo::Result<(String, String)> {
        let id = parse_session_id(session_id)?;
        let status = self.controller.get_state(id).await.map_err(session_error)?;
        Ok((status.state.to_string(), reason_code(status.reason)))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let active = self.controller.active_sessions().await;
        let state = self.state.lock().await;
        let config = &state.config;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "authority": config.authority_url,
            "active_sessions": active,
            "max_sessions": config.max_sessions,
            "stage_timeout_secs": config.stage_timeout_secs,
            "challenges": liveproof_core::CHALLENGE_ORDER,
            "rate_limited_callers": state.rate_limiter.tracked_callers(),
        })
        .to_string())
    }

    /// Emitted on every status change of a session started over the bus.
    /// `reason` is empty unless `state` is FAILURE.
    #[zbus(signal)]
    async fn state_changed(
        emitter: &SignalEmitter<'_>,
        session_id: &str,
        state: &str,
        reason: &str,
    ) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_id() {
        let id = SessionId::generate();
        assert_eq!(parse_session_id(&id.to_string()).unwrap(), id);
        assert!(matches!(
            parse_session_id("../etc/passwd"),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_session_error_mapping() {
        let id = SessionId::generate();
        assert!(matches!(
            session_error(SessionError::InvalidSession(id)),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            session_error(SessionError::InvalidObservation),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            session_error(SessionError::CapacityExceeded(4)),
            zbus::fdo::Error::LimitsExceeded(_)
        ));
    }

    #[test]
    fn test_reason_code() {
        assert_eq!(reason_code(None), "");
        assert_eq!(reason_code(Some(FailureReason::Timeout)), "timeout");
    }

    #[test]
    fn test_readiness_report() {
        assert_eq!(readiness(true, "ignored"), Ok(()));
        assert_eq!(readiness(false, "camera busy"), Err("camera busy".to_string()));
        assert_eq!(
            readiness(false, "  "),
            Err("capture setup failed".to_string())
        );
    }
}
