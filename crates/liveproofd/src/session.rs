use std::sync::Arc;
use std::time::Duration;

use liveproof_core::challenge::{self, DwellDurations, DwellSet};
use liveproof_core::{
    Evidence, FailureReason, FrameObservation, ScoringPolicy, SessionId, SessionState,
    SessionStatus,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::authority::{AuthorityError, TrustAuthority};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session {0} is unknown or has already ended")]
    InvalidSession(SessionId),
    #[error("session {0} already exists")]
    DuplicateSession(SessionId),
    #[error("too many active sessions (limit {0})")]
    CapacityExceeded(usize),
    #[error("observation scores must be finite and within [0, 1]")]
    InvalidObservation,
}

/// Result of one applied observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedReply {
    pub state: SessionState,
    /// Fill level of the dwell timer driving the current stage, in `[0, 1]`.
    /// Zero outside AwaitingFace and the challenge stages.
    pub progress: f64,
}

/// Capture/tracker readiness handshake. The sender reports `Ok(())` once frames
/// are flowing, or `Err(reason)` if setup failed. Dropping the sender counts as
/// a setup failure.
pub type Readiness = oneshot::Receiver<Result<(), String>>;

/// Per-session tuning, copied into every session at start.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub scoring: ScoringPolicy,
    pub dwell: DwellDurations,
    pub init_timeout: Duration,
    pub stage_timeout: Duration,
    pub verify_timeout: Duration,
    pub terminal_retention: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            scoring: ScoringPolicy::default(),
            dwell: DwellDurations::default(),
            init_timeout: Duration::from_secs(10),
            stage_timeout: Duration::from_secs(30),
            verify_timeout: Duration::from_secs(10),
            terminal_retention: Duration::from_secs(60),
        }
    }
}

/// Messages sent from the controller to a session task.
enum SessionRequest {
    Feed {
        observation: FrameObservation,
        elapsed_ms: f64,
        reply: oneshot::Sender<Result<FeedReply, SessionError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
}

type VerdictResult = Result<bool, AuthorityError>;

/// Clone-safe handle to one session task.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<SessionRequest>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// A receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// True once the session task has exited and the handle can be dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Apply one observation. Requests are queued and applied strictly in
    /// order by the session task.
    pub async fn feed(
        &self,
        observation: FrameObservation,
        elapsed_ms: f64,
    ) -> Result<FeedReply, SessionError> {
        if !observation.is_well_formed() {
            return Err(SessionError::InvalidObservation);
        }
        if self.status().is_terminal() {
            return Err(SessionError::InvalidSession(self.id));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Feed {
                observation,
                elapsed_ms,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::InvalidSession(self.id))?;
        reply_rx
            .await
            .map_err(|_| SessionError::InvalidSession(self.id))?
    }

    /// Force the session into Failure. Fails if it had already ended.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Cancel { reply: reply_tx })
            .await
            .map_err(|_| SessionError::InvalidSession(self.id))?;
        match reply_rx.await {
            Ok(true) => Ok(()),
            _ => Err(SessionError::InvalidSession(self.id)),
        }
    }
}

/// Spawn a session task on the current runtime.
///
/// The session starts in Initializing and moves to AwaitingFace once
/// `readiness` reports success within `policy.init_timeout`.
pub fn spawn_session(
    id: SessionId,
    policy: SessionPolicy,
    authority: Arc<dyn TrustAuthority>,
    readiness: Readiness,
) -> SessionHandle {
    let idle = SessionState::Idle;
    let state = challenge::on_start(idle);
    tracing::info!(session_id = %id, from = %idle, to = %state, "session started");

    let (status_tx, status_rx) = watch::channel(SessionStatus::new(state));
    let (tx, rx) = mpsc::channel::<SessionRequest>(16);

    let session = Session {
        id,
        policy,
        authority,
        state,
        dwell: DwellSet::new(&policy.dwell),
        evidence: Evidence::new(),
        verification_issued: false,
        verdict: None,
        stage_deadline: Instant::now() + policy.stage_timeout,
        status_tx,
    };
    tokio::spawn(session.run(rx, readiness));

    SessionHandle {
        id,
        tx,
        status: status_rx,
    }
}

/// State owned by a single session task. Nothing here is shared with other
/// sessions.
struct Session {
    id: SessionId,
    policy: SessionPolicy,
    authority: Arc<dyn TrustAuthority>,
    state: SessionState,
    dwell: DwellSet,
    evidence: Evidence,
    verification_issued: bool,
    verdict: Option<oneshot::Receiver<VerdictResult>>,
    stage_deadline: Instant,
    status_tx: watch::Sender<SessionStatus>,
}

impl Session {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>, readiness: Readiness) {
        if self.initialize(&mut rx, readiness).await {
            self.drive(&mut rx).await;
        }
        self.linger(&mut rx).await;
        tracing::debug!(session_id = %self.id, "session task exiting");
    }

    /// Wait for the readiness handshake while still answering requests.
    /// Returns false if the session ended (or was abandoned) before it was ready.
    async fn initialize(
        &mut self,
        rx: &mut mpsc::Receiver<SessionRequest>,
        readiness: Readiness,
    ) -> bool {
        let init_timeout = self.policy.init_timeout;
        let ready = tokio::time::timeout(init_timeout, readiness);
        tokio::pin!(ready);

        loop {
            tokio::select! {
                biased;
                outcome = &mut ready => {
                    match outcome {
                        Ok(Ok(Ok(()))) => {
                            let next = challenge::on_ready(self.state);
                            self.set_state(next, None);
                            return true;
                        }
                        Ok(Ok(Err(reason))) => {
                            tracing::error!(session_id = %self.id, reason = %reason, "capture setup failed");
                        }
                        Ok(Err(_)) => {
                            tracing::error!(session_id = %self.id, "readiness signal dropped");
                        }
                        Err(_) => {
                            tracing::error!(
                                session_id = %self.id,
                                timeout_secs = init_timeout.as_secs(),
                                "capture not ready in time"
                            );
                        }
                    }
                    let next = challenge::on_setup_failed(self.state);
                    self.set_state(next, Some(FailureReason::SetupFailure));
                    return false;
                }
                request = rx.recv() => {
                    match request {
                        Some(request) => self.handle(request),
                        None => {
                            self.abandon();
                            return false;
                        }
                    }
                    if self.state.is_terminal() {
                        return false;
                    }
                }
            }
        }
    }

    /// Main loop: observations, the authority verdict and the stage budget.
    async fn drive(&mut self, rx: &mut mpsc::Receiver<SessionRequest>) {
        while !self.state.is_terminal() {
            let deadline = self.stage_deadline;

            tokio::select! {
                biased;
                verdict = recv_verdict(&mut self.verdict) => {
                    self.verdict = None;
                    self.apply_verdict(verdict);
                }
                request = rx.recv() => {
                    match request {
                        Some(request) => self.handle(request),
                        None => self.abandon(),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        session_id = %self.id,
                        state = %self.state,
                        budget_secs = self.policy.stage_timeout.as_secs(),
                        "stage time budget exhausted"
                    );
                    if let Some(next) = challenge::abort(self.state) {
                        self.set_state(next, Some(FailureReason::Timeout));
                    }
                }
            }
        }
    }

    /// Keep the terminal status queryable for the retention period, refusing
    /// any further work, then let the task end.
    async fn linger(&mut self, rx: &mut mpsc::Receiver<SessionRequest>) {
        let retention = tokio::time::sleep(self.policy.terminal_retention);
        tokio::pin!(retention);

        loop {
            tokio::select! {
                _ = &mut retention => break,
                request = rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }
        }
    }

    fn handle(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Feed {
                observation,
                elapsed_ms,
                reply,
            } => {
                let _ = reply.send(self.feed(observation, elapsed_ms));
            }
            SessionRequest::Cancel { reply } => {
                let cancelled = match challenge::abort(self.state) {
                    Some(next) => {
                        self.set_state(next, Some(FailureReason::Cancelled));
                        true
                    }
                    None => false,
                };
                let _ = reply.send(cancelled);
            }
        }
    }

    fn feed(
        &mut self,
        observation: FrameObservation,
        elapsed_ms: f64,
    ) -> Result<FeedReply, SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::InvalidSession(self.id));
        }

        let step = challenge::transition(self.state, self.dwell, &observation, elapsed_ms);
        self.dwell = step.dwell;

        if let Some(completion) = step.completed {
            tracing::info!(
                session_id = %self.id,
                challenge = %completion.kind,
                score = completion.score,
                "challenge satisfied"
            );
            self.evidence.record(completion);
        }

        if step.state != self.state {
            self.set_state(step.state, None);
        }

        if self.state == SessionState::Verifying && !self.verification_issued {
            self.dispatch_verification();
        }

        Ok(FeedReply {
            state: self.state,
            progress: self.progress(),
        })
    }

    fn progress(&self) -> f64 {
        match self.state {
            SessionState::AwaitingFace => self.dwell.settle.progress(),
            state => state
                .active_challenge()
                .map_or(0.0, |kind| self.dwell.challenge(kind).progress()),
        }
    }

    /// Issue the one authority call this session is allowed.
    fn dispatch_verification(&mut self) {
        self.verification_issued = true;

        let payload = std::mem::take(&mut self.evidence).into_payload(self.id);
        let authority = Arc::clone(&self.authority);
        let timeout = self.policy.verify_timeout;
        let id = self.id;
        let (tx, rx) = oneshot::channel();

        tracing::info!(
            session_id = %id,
            challenges = ?payload.challenges,
            "handing evidence to trust authority"
        );

        tokio::spawn(async move {
            let call = tokio::task::spawn_blocking(move || authority.verify(&payload));
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(AuthorityError::Aborted(e.to_string())),
                Err(_) => Err(AuthorityError::Timeout(timeout)),
            };
            if tx.send(result).is_err() {
                tracing::debug!(session_id = %id, "verdict arrived after session ended, discarded");
            }
        });

        self.verdict = Some(rx);
    }

    fn apply_verdict(&mut self, verdict: Result<VerdictResult, oneshot::error::RecvError>) {
        let (accepted, reason) = match verdict {
            Ok(Ok(true)) => (true, None),
            Ok(Ok(false)) => {
                tracing::warn!(session_id = %self.id, "trust authority rejected evidence");
                (false, Some(FailureReason::VerificationRejected))
            }
            Ok(Err(e)) => {
                tracing::error!(session_id = %self.id, error = %e, "trust authority unreachable");
                (false, Some(FailureReason::VerificationUnreachable))
            }
            Err(_) => {
                tracing::error!(session_id = %self.id, "verification task vanished");
                (false, Some(FailureReason::VerificationUnreachable))
            }
        };
        let next = challenge::on_verdict(self.state, accepted);
        if next != self.state {
            self.set_state(next, reason);
        }
    }

    /// Every handle was dropped without cancelling.
    fn abandon(&mut self) {
        if let Some(next) = challenge::abort(self.state) {
            tracing::debug!(session_id = %self.id, "session abandoned");
            self.set_state(next, Some(FailureReason::Cancelled));
        }
    }

    fn set_state(&mut self, next: SessionState, reason: Option<FailureReason>) {
        let prev = self.state;
        self.state = next;

        if next.is_time_bounded() {
            self.stage_deadline = Instant::now() + self.policy.stage_timeout;
        }
        if next.is_terminal() {
            self.dwell.clear();
            // A verdict still in flight is dropped with its receiver
            self.verdict = None;
        }

        let status = SessionStatus {
            state: next,
            reason: if next == SessionState::Failure { reason } else { None },
        };

        match status.reason {
            Some(reason) => tracing::info!(
                session_id = %self.id,
                from = %prev,
                to = %next,
                reason = %reason,
                "session state changed"
            ),
            None => tracing::info!(
                session_id = %self.id,
                from = %prev,
                to = %next,
                "session state changed"
            ),
        }

        self.status_tx.send_replace(status);
    }
}

async fn recv_verdict(
    verdict: &mut Option<oneshot::Receiver<VerdictResult>>,
) -> Result<VerdictResult, oneshot::error::RecvError> {
    match verdict {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::testing::ScriptedAuthority;
    use liveproof_core::ChallengeKind;

    fn face() -> FrameObservation {
        FrameObservation {
            face_detected: true,
            ..FrameObservation::no_face()
        }
    }

    fn smile() -> FrameObservation {
        FrameObservation {
            face_detected: true,
            smile_score: 1.0,
            is_smile: true,
            ..FrameObservation::no_face()
        }
    }

    fn blink() -> FrameObservation {
        FrameObservation {
            face_detected: true,
            blink_score: 0.9,
            is_blink: true,
            ..FrameObservation::no_face()
        }
    }

    fn ready() -> Readiness {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        rx
    }

    async fn feed_n(handle: &SessionHandle, obs: FrameObservation, n: usize) -> SessionState {
        let mut state = handle.status().state;
        for _ in 0..n {
            state = handle.feed(obs, 100.0).await.unwrap().state;
        }
        state
    }

    async fn wait_terminal(handle: &SessionHandle) -> SessionStatus {
        let mut rx = handle.subscribe();
        let status = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        status
    }

    #[tokio::test]
    async fn test_full_run_accepted() {
        let authority = Arc::new(ScriptedAuthority::new(Some(true)));
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            authority.clone(),
            ready(),
        );

        assert_eq!(feed_n(&handle, face(), 6).await, SessionState::ChallengeSmile);
        assert_eq!(feed_n(&handle, smile(), 11).await, SessionState::ChallengeBlink);
        assert_eq!(feed_n(&handle, blink(), 4).await, SessionState::Verifying);

        let status = wait_terminal(&handle).await;
        assert_eq!(status, SessionStatus::new(SessionState::Success));
        assert_eq!(authority.calls(), 1);

        let payload = &authority.payloads()[0];
        assert_eq!(payload.session_id, handle.id());
        assert_eq!(payload.challenges, vec![ChallengeKind::Smile, ChallengeKind::Blink]);
        assert_eq!(payload.proof.smile_score, 1.0);
        assert_eq!(payload.proof.blink_score, 0.9);
    }

    #[tokio::test]
    async fn test_feed_reports_stage_progress() {
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            Arc::new(ScriptedAuthority::new(Some(true))),
            ready(),
        );

        // Settle: 200 of 500 ms
        handle.feed(face(), 100.0).await.unwrap();
        let reply = handle.feed(face(), 100.0).await.unwrap();
        assert_eq!(reply.state, SessionState::AwaitingFace);
        assert!((reply.progress - 0.4).abs() < 1e-9);

        // Entering the smile stage starts from an empty timer
        feed_n(&handle, face(), 4).await;
        let reply = handle.feed(smile(), 250.0).await.unwrap();
        assert_eq!(reply.state, SessionState::ChallengeSmile);
        assert!((reply.progress - 0.25).abs() < 1e-9);

        // Decay drains it at twice the rate
        let reply = handle.feed(face(), 100.0).await.unwrap();
        assert!((reply.progress - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_scores_rejected() {
        let authority = Arc::new(ScriptedAuthority::new(Some(true)));
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            authority.clone(),
            ready(),
        );
        feed_n(&handle, face(), 6).await;

        let nan_smile = FrameObservation {
            smile_score: f32::NAN,
            ..smile()
        };
        let huge_blink = FrameObservation {
            blink_score: 42.0,
            ..blink()
        };
        assert_eq!(
            handle.feed(nan_smile, 100.0).await,
            Err(SessionError::InvalidObservation)
        );
        assert_eq!(
            handle.feed(huge_blink, 100.0).await,
            Err(SessionError::InvalidObservation)
        );

        // Nothing was applied
        let reply = handle.feed(face(), 100.0).await.unwrap();
        assert_eq!(reply.state, SessionState::ChallengeSmile);
        assert_eq!(reply.progress, 0.0);
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_setup_failure() {
        let (tx, rx) = oneshot::channel();
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            Arc::new(ScriptedAuthority::new(Some(true))),
            rx,
        );
        assert_eq!(handle.status().state, SessionState::Initializing);
        tx.send(Err("camera busy".to_string())).unwrap();

        let status = wait_terminal(&handle).await;
        assert_eq!(status, SessionStatus::failed(FailureReason::SetupFailure));
    }

    #[tokio::test]
    async fn test_observations_ignored_while_initializing() {
        let (_tx, rx) = oneshot::channel();
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            Arc::new(ScriptedAuthority::new(Some(true))),
            rx,
        );
        assert_eq!(feed_n(&handle, face(), 20).await, SessionState::Initializing);
        handle.cancel().await.unwrap();
        assert_eq!(
            handle.status(),
            SessionStatus::failed(FailureReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout() {
        let (_tx, rx) = oneshot::channel();
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            Arc::new(ScriptedAuthority::new(Some(true))),
            rx,
        );
        let status = wait_terminal(&handle).await;
        assert_eq!(status, SessionStatus::failed(FailureReason::SetupFailure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout() {
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            Arc::new(ScriptedAuthority::new(Some(true))),
            ready(),
        );
        assert_eq!(feed_n(&handle, face(), 6).await, SessionState::ChallengeSmile);

        // No smile ever arrives
        let status = wait_terminal(&handle).await;
        assert_eq!(status, SessionStatus::failed(FailureReason::Timeout));
        assert_eq!(
            handle.feed(smile(), 100.0).await,
            Err(SessionError::InvalidSession(handle.id()))
        );
    }

    #[tokio::test]
    async fn test_rejection_and_unreachable() {
        for (decision, reason) in [
            (Some(false), FailureReason::VerificationRejected),
            (None, FailureReason::VerificationUnreachable),
        ] {
            let handle = spawn_session(
                SessionId::generate(),
                SessionPolicy::default(),
                Arc::new(ScriptedAuthority::new(decision)),
                ready(),
            );
            feed_n(&handle, face(), 6).await;
            feed_n(&handle, smile(), 11).await;
            feed_n(&handle, blink(), 4).await;
            assert_eq!(wait_terminal(&handle).await, SessionStatus::failed(reason));
        }
    }

    #[tokio::test]
    async fn test_single_verification_call_while_verifying() {
        let (authority, release) = ScriptedAuthority::gated(Some(true));
        let authority = Arc::new(authority);
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            authority.clone(),
            ready(),
        );
        feed_n(&handle, face(), 6).await;
        feed_n(&handle, smile(), 11).await;
        assert_eq!(feed_n(&handle, blink(), 4).await, SessionState::Verifying);
        assert_eq!(feed_n(&handle, blink(), 10).await, SessionState::Verifying);

        release.send(()).unwrap();
        assert_eq!(wait_terminal(&handle).await.state, SessionState::Success);
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_verify_timeout_maps_to_unreachable() {
        let (authority, release) = ScriptedAuthority::gated(Some(true));
        let policy = SessionPolicy {
            verify_timeout: Duration::from_millis(50),
            ..SessionPolicy::default()
        };
        let handle = spawn_session(SessionId::generate(), policy, Arc::new(authority), ready());
        feed_n(&handle, face(), 6).await;
        feed_n(&handle, smile(), 11).await;
        feed_n(&handle, blink(), 4).await;

        assert_eq!(
            wait_terminal(&handle).await,
            SessionStatus::failed(FailureReason::VerificationUnreachable)
        );
        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_discards_late_verdict() {
        let (authority, release) = ScriptedAuthority::gated(Some(true));
        let authority = Arc::new(authority);
        let handle = spawn_session(
            SessionId::generate(),
            SessionPolicy::default(),
            authority.clone(),
            ready(),
        );
        feed_n(&handle, face(), 6).await;
        feed_n(&handle, smile(), 11).await;
        feed_n(&handle, blink(), 4).await;

        handle.cancel().await.unwrap();
        assert_eq!(handle.status(), SessionStatus::failed(FailureReason::Cancelled));

        release.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status(), SessionStatus::failed(FailureReason::Cancelled));
        assert_eq!(
            handle.cancel().await,
            Err(SessionError::InvalidSession(handle.id()))
        );
        assert_eq!(authority.calls(), 1);
    }
}
