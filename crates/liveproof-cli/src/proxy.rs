//! Client side of the `org.freedesktop.LiveProof1` interface.

#[zbus::proxy(
    interface = "org.freedesktop.LiveProof1",
    default_service = "org.freedesktop.LiveProof1",
    default_path = "/org/freedesktop/LiveProof1"
)]
pub trait LiveProof {
    fn start_session(&self) -> zbus::Result<String>;

    /// Returns `(state, smile_score, blink_score, progress)`.
    fn feed_landmarks(
        &self,
        session_id: &str,
        landmarks: Vec<(f64, f64, f64)>,
        elapsed_ms: u64,
    ) -> zbus::Result<(String, f64, f64, f64)>;

    fn cancel_session(&self, session_id: &str) -> zbus::Result<()>;

    fn get_state(&self, session_id: &str) -> zbus::Result<(String, String)>;

    fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn state_changed(&self, session_id: String, state: String, reason: String)
        -> zbus::Result<()>;
}

/// Connect to the daemon on the system bus, or the session bus when
/// `LIVEPROOF_SESSION_BUS` is set (development mode).
pub async fn connect() -> zbus::Result<LiveProofProxy<'static>> {
    let conn = if std::env::var("LIVEPROOF_SESSION_BUS").is_ok() {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    LiveProofProxy::new(&conn).await
}
