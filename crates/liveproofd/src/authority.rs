use std::time::Duration;

use liveproof_core::VerificationPayload;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("transport error: {0}")]
    Transport(#[from] ureq::Error),
    #[error("malformed authority response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("authority did not answer within {0:?}")]
    Timeout(Duration),
    #[error("authority call aborted: {0}")]
    Aborted(String),
}

/// The system that makes the final accept/reject decision on submitted evidence.
///
/// Calls are blocking; the session runs them on the blocking pool under a
/// timeout so a slow authority only stalls its own session.
pub trait TrustAuthority: Send + Sync + 'static {
    /// Returns `Ok(true)` to accept, `Ok(false)` to reject.
    fn verify(&self, payload: &VerificationPayload) -> Result<bool, AuthorityError>;
}

#[derive(Deserialize)]
struct Verdict {
    accepted: bool,
}

/// Trust authority reached over HTTP: POSTs the payload as JSON and expects
/// `{"accepted": <bool>}` back. Non-2xx statuses are transport errors.
pub struct HttpAuthority {
    agent: ureq::Agent,
    url: String,
}

impl HttpAuthority {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            url: url.to_string(),
        }
    }
}

impl TrustAuthority for HttpAuthority {
    fn verify(&self, payload: &VerificationPayload) -> Result<bool, AuthorityError> {
        let body = serde_json::to_string(payload)?;

        tracing::debug!(
            url = %self.url,
            session_id = %payload.session_id,
            "submitting liveness evidence"
        );

        let mut response = self
            .agent
            .post(&self.url)
            .header("Content-Type", "application/json")
            .send(body.as_bytes())?;
        let text = response.body_mut().read_to_string()?;
        let verdict: Verdict = serde_json::from_str(&text)?;

        Ok(verdict.accepted)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};

    /// Scripted authority that counts calls and can be held open until released.
    pub struct ScriptedAuthority {
        accept: Option<bool>,
        calls: AtomicUsize,
        payloads: Mutex<Vec<VerificationPayload>>,
        gate: Option<Mutex<mpsc::Receiver<()>>>,
    }

    impl ScriptedAuthority {
        /// `Some(decision)` answers with that decision; `None` fails the call.
        pub fn new(accept: Option<bool>) -> Self {
            Self {
                accept,
                calls: AtomicUsize::new(0),
                payloads: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        /// Block every call until a unit is sent on the returned channel.
        pub fn gated(accept: Option<bool>) -> (Self, mpsc::Sender<()>) {
            let (tx, rx) = mpsc::channel();
            let mut authority = Self::new(accept);
            authority.gate = Some(Mutex::new(rx));
            (authority, tx)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn payloads(&self) -> Vec<VerificationPayload> {
            self.payloads.lock().unwrap().clone()
        }
    }

    impl TrustAuthority for ScriptedAuthority {
        fn verify(&self, payload: &VerificationPayload) -> Result<bool, AuthorityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payloads.lock().unwrap().push(payload.clone());
            if let Some(gate) = &self.gate {
                let _ = gate.lock().unwrap().recv();
            }
            self.accept
                .ok_or_else(|| AuthorityError::Aborted("scripted failure".to_string()))
        }
    }
}
