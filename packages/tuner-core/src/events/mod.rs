//! Domain events for observability.
//!
//! These are not part of the IPC wire protocol (see [`crate::ipc`]) — they
//! are an internal seam so the detection loop, capture thread, and
//! supervisor can report what they are doing without hard-wiring a logging
//! call at every call site. The default [`emitter::LoggingEventEmitter`]
//! just logs them; tests use a counting double.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events emitted by the coordination fabric.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum AppEvent {
    /// Detection scheduler state transitions and outcomes.
    Detection(DetectionEvent),
    /// Audio capture thread lifecycle.
    Capture(CaptureEvent),
    /// Supervisor child-process lifecycle.
    Supervisor(SupervisorEvent),
}

/// Events from the detection scheduler (§4.D).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DetectionEvent {
    /// Transitioned from WAITING to SCANNING (RMS crossed the silence threshold).
    EnteredScanning { rms: f32, timestamp: u64 },
    /// Transitioned from SCANNING back to WAITING.
    EnteredWaiting { timestamp: u64 },
    /// A fingerprint match was found.
    Matched {
        track_guid: String,
        subsequent_detects: u32,
        timestamp: u64,
    },
    /// The fingerprint provider returned no match.
    NoMatch { timestamp: u64 },
    /// The fingerprint or metadata call failed or exceeded its deadline.
    Failed { reason: String, timestamp: u64 },
}

/// Events from the audio capture thread.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CaptureEvent {
    /// The input stream was opened successfully.
    StreamStarted {
        sample_rate: u32,
        channels: u16,
        timestamp: u64,
    },
    /// The input stream reported an error and capture stopped.
    StreamError { message: String, timestamp: u64 },
}

/// Events from the supervisor (§4.E).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisorEvent {
    /// The capture child process was spawned.
    ChildSpawned { pid: u32, timestamp: u64 },
    /// The capture child exited; `restart` is true if it used the restart
    /// exit code and will be respawned immediately rather than after backoff.
    ChildExited {
        code: Option<i32>,
        restart: bool,
        timestamp: u64,
    },
}

impl From<DetectionEvent> for AppEvent {
    fn from(event: DetectionEvent) -> Self {
        AppEvent::Detection(event)
    }
}

impl From<CaptureEvent> for AppEvent {
    fn from(event: CaptureEvent) -> Self {
        AppEvent::Capture(event)
    }
}

impl From<SupervisorEvent> for AppEvent {
    fn from(event: SupervisorEvent) -> Self {
        AppEvent::Supervisor(event)
    }
}
