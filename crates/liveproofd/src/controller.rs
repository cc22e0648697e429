use std::collections::HashMap;
use std::sync::Arc;

use liveproof_core::{geometry, FrameObservation, LandmarkInput, SessionId, SessionStatus};
use tokio::sync::{oneshot, watch, Mutex};

use crate::authority::TrustAuthority;
use crate::config::Config;
use crate::session::{
    spawn_session, FeedReply, Readiness, SessionError, SessionHandle, SessionPolicy,
};

type ReadySender = oneshot::Sender<Result<(), String>>;

/// Owns every live session and routes calls to them.
///
/// The map lock is only held to look up or insert a handle; all per-session
/// work happens on the session's own task, so sessions never wait on each
/// other.
pub struct SessionController {
    policy: SessionPolicy,
    max_sessions: usize,
    authority: Arc<dyn TrustAuthority>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    /// Readiness senders of sessions started with a deferred handshake.
    pending_ready: Mutex<HashMap<SessionId, ReadySender>>,
}

impl SessionController {
    pub fn new(config: &Config, authority: Arc<dyn TrustAuthority>) -> Self {
        let policy = SessionPolicy {
            scoring: config.scoring,
            dwell: config.dwell,
            init_timeout: config.init_timeout(),
            stage_timeout: config.stage_timeout(),
            verify_timeout: config.verify_timeout(),
            terminal_retention: config.terminal_retention(),
        };
        Self::with_policy(policy, config.max_sessions, authority)
    }

    pub fn with_policy(
        policy: SessionPolicy,
        max_sessions: usize,
        authority: Arc<dyn TrustAuthority>,
    ) -> Self {
        Self {
            policy,
            max_sessions,
            authority,
            sessions: Mutex::new(HashMap::new()),
            pending_ready: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session whose capture pipeline is already delivering frames.
    pub async fn start_session(&self) -> Result<SessionId, SessionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let _ = ready_tx.send(Ok(()));
        self.start_session_with(None, ready_rx).await
    }

    /// Start a session that stays in Initializing until [`report_ready`] is
    /// called for it, or the readiness timeout fails it.
    ///
    /// [`report_ready`]: Self::report_ready
    pub async fn start_deferred_session(&self) -> Result<SessionId, SessionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let id = self.start_session_with(None, ready_rx).await?;
        self.pending_ready.lock().await.insert(id, ready_tx);
        Ok(id)
    }

    /// Deliver the capture pipeline's readiness outcome to a deferred session.
    ///
    /// Fails with `InvalidSession` for unknown sessions, sessions not started
    /// deferred, and sessions whose outcome was already reported.
    pub async fn report_ready(
        &self,
        id: SessionId,
        outcome: Result<(), String>,
    ) -> Result<(), SessionError> {
        let sender = self
            .pending_ready
            .lock()
            .await
            .remove(&id)
            .ok_or(SessionError::InvalidSession(id))?;
        tracing::info!(session_id = %id, ready = outcome.is_ok(), "readiness reported");
        // The receiver is gone once the session has left Initializing
        sender
            .send(outcome)
            .map_err(|_| SessionError::InvalidSession(id))
    }

    /// Start a session that waits for `readiness` before accepting challenges.
    ///
    /// `id` adopts an identifier issued elsewhere (typically by the trust
    /// authority); `None` generates a random one.
    pub async fn start_session_with(
        &self,
        id: Option<SessionId>,
        readiness: Readiness,
    ) -> Result<SessionId, SessionError> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, handle| !handle.is_closed());

        let id = id.unwrap_or_else(SessionId::generate);
        if sessions.contains_key(&id) {
            return Err(SessionError::DuplicateSession(id));
        }

        let active = sessions
            .values()
            .filter(|handle| !handle.status().is_terminal())
            .count();
        if active >= self.max_sessions {
            tracing::warn!(active, max = self.max_sessions, "session capacity reached");
            return Err(SessionError::CapacityExceeded(self.max_sessions));
        }

        let handle = spawn_session(id, self.policy, Arc::clone(&self.authority), readiness);
        sessions.insert(id, handle);
        Ok(id)
    }

    /// Apply one scored frame covering `elapsed_ms` since the previous one.
    pub async fn feed_observation(
        &self,
        id: SessionId,
        observation: FrameObservation,
        elapsed_ms: f64,
    ) -> Result<FeedReply, SessionError> {
        let handle = self.handle(id).await?;
        handle.feed(observation, elapsed_ms).await
    }

    /// Score a tracker frame with the configured policy, then feed it.
    pub async fn feed_landmarks(
        &self,
        id: SessionId,
        input: &LandmarkInput,
        elapsed_ms: f64,
    ) -> Result<(FeedReply, FrameObservation), SessionError> {
        let handle = self.handle(id).await?;
        let observation = geometry::score_with(input, &self.policy.scoring);
        let reply = handle.feed(observation, elapsed_ms).await?;
        Ok((reply, observation))
    }

    pub async fn cancel_session(&self, id: SessionId) -> Result<(), SessionError> {
        let handle = self.handle(id).await?;
        handle.cancel().await?;
        tracing::info!(session_id = %id, "session cancelled");
        Ok(())
    }

    /// Current status. Finished sessions stay visible until they are reaped.
    pub async fn get_state(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&id)
            .map(SessionHandle::status)
            .ok_or(SessionError::InvalidSession(id))
    }

    /// Observe status changes, e.g. to drive a progress display.
    pub async fn subscribe(
        &self,
        id: SessionId,
    ) -> Result<watch::Receiver<SessionStatus>, SessionError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&id)
            .map(SessionHandle::subscribe)
            .ok_or(SessionError::InvalidSession(id))
    }

    /// Number of sessions that have not reached a terminal state.
    pub async fn active_sessions(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|handle| !handle.status().is_terminal())
            .count()
    }

    /// Forget sessions whose task has exited after its retention period, and
    /// readiness senders nobody is waiting on any more.
    pub async fn reap(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.is_closed());
        let reaped = before - sessions.len();
        self.pending_ready
            .lock()
            .await
            .retain(|_, sender| !sender.is_closed());
        if reaped > 0 {
            tracing::debug!(reaped, remaining = sessions.len(), "reaped finished sessions");
        }
        reaped
    }

    /// Handle for a session that can still accept work.
    async fn handle(&self, id: SessionId) -> Result<SessionHandle, SessionError> {
        let sessions = self.sessions.lock().await;
        match sessions.get(&id) {
            Some(handle) if !handle.status().is_terminal() => Ok(handle.clone()),
            _ => Err(SessionError::InvalidSession(id)),
        }
    }
}
