//! `liveproof replay`: drive a daemon session from a recorded landmark stream.
//!
//! The recording is JSON lines, one frame per line:
//!
//! ```text
//! {"elapsed_ms": 33, "landmarks": [[0.41, 0.38, -0.02], ...]}
//! {"elapsed_ms": 33, "landmarks": null}
//! ```
//!
//! `elapsed_ms` is the time since the previous frame; `null` landmarks mean the
//! tracker saw no face.

use anyhow::{bail, Context, Result};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proxy::{LiveProofProxy, StateChanged};

/// How long to wait for the trust authority after the last frame.
const VERDICT_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize, PartialEq)]
pub struct RecordedFrame {
    pub elapsed_ms: u64,
    pub landmarks: Option<Vec<[f64; 3]>>,
}

impl RecordedFrame {
    fn points(&self) -> Vec<(f64, f64, f64)> {
        self.landmarks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|[x, y, z]| (*x, *y, *z))
            .collect()
    }
}

/// Parse a JSON-lines recording, skipping blank lines.
pub fn load_recording(path: &Path) -> Result<Vec<RecordedFrame>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_recording(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_recording(reader: impl BufRead) -> Result<Vec<RecordedFrame>> {
    let mut frames = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: RecordedFrame = serde_json::from_str(&line)
            .with_context(|| format!("line {}", line_no + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

fn is_terminal(state: &str) -> bool {
    matches!(state, "SUCCESS" | "FAILURE")
}

/// `(state, reason)` if this change ends session `session_id`.
fn verdict_for(session_id: &str, changed: (&str, &str, &str)) -> Option<(String, String)> {
    let (id, state, reason) = changed;
    (id == session_id && is_terminal(state)).then(|| (state.to_string(), reason.to_string()))
}

/// Wait for the `StateChanged` signal that ends `session_id`.
async fn await_verdict(
    changes: &mut (impl Stream<Item = StateChanged> + Unpin),
    session_id: &str,
) -> Result<Option<(String, String)>> {
    while let Some(signal) = changes.next().await {
        let args = signal.args()?;
        let changed = (
            args.session_id().as_str(),
            args.state().as_str(),
            args.reason().as_str(),
        );
        if let Some(verdict) = verdict_for(session_id, changed) {
            return Ok(Some(verdict));
        }
    }
    Ok(None)
}

/// Run the replay command.
pub async fn run(proxy: &LiveProofProxy<'_>, path: PathBuf, realtime: bool) -> Result<()> {
    let frames = load_recording(&path)?;
    if frames.is_empty() {
        bail!("{} contains no frames", path.display());
    }
    println!("Replaying {} frame(s) from {}", frames.len(), path.display());

    // Subscribe first so no change of the new session is missed
    let mut changes = proxy
        .receive_state_changed()
        .await
        .context("failed to subscribe to StateChanged")?;
    let session_id = proxy.start_session().await.context("start_session failed")?;
    println!("Session: {session_id}");

    let mut last_state = String::new();
    for (i, frame) in frames.iter().enumerate() {
        if realtime {
            tokio::time::sleep(Duration::from_millis(frame.elapsed_ms)).await;
        }

        let (state, smile, blink, progress) = proxy
            .feed_landmarks(&session_id, frame.points(), frame.elapsed_ms)
            .await
            .with_context(|| format!("feed_landmarks failed at frame {i}"))?;

        tracing::debug!(frame = i, state = %state, smile, blink, progress, "frame fed");
        if state != last_state {
            println!("  frame {i:>5}: {state} (smile {smile:.2}, blink {blink:.2})");
            last_state = state;
        }
        if is_terminal(&last_state) {
            break;
        }
    }

    // Wait out the trust authority call, if one is in flight
    let (mut state, mut reason) = proxy.get_state(&session_id).await?;
    if state == "VERIFYING" {
        match tokio::time::timeout(VERDICT_WAIT, await_verdict(&mut changes, &session_id)).await {
            Ok(Ok(Some(verdict))) => (state, reason) = verdict,
            Ok(Ok(None)) => tracing::warn!("StateChanged stream ended before the verdict"),
            Ok(Err(e)) => tracing::warn!(error = %e, "malformed StateChanged signal"),
            Err(_) => tracing::warn!(
                wait_secs = VERDICT_WAIT.as_secs(),
                "no verdict from the trust authority"
            ),
        }
    }

    println!();
    if reason.is_empty() {
        println!("Result: {state}");
    } else {
        println!("Result: {state} ({reason})");
    }

    if !is_terminal(&state) {
        // Recording ended mid-challenge; don't leave the session holding resources
        proxy.cancel_session(&session_id).await.ok();
    }

    Ok(())
}
