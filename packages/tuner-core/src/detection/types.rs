//! Data model for the detection scheduler (§3, §4.D).

use serde::Serialize;

use crate::metadata::TrackMetadata;

/// Detection loop state (§4.D tick table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    Waiting,
    Scanning,
}

/// The matched track as carried in a serialized [`DetectionResult`] (§3's
/// `track?` field), distinct from [`crate::fingerprint::FingerprintMatch`]
/// which is the raw provider answer before a history `track_guid` exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionTrack {
    pub track_id: String,
    pub track_guid: String,
    pub offset: f64,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
}

/// Detection outcome persisted to the `now_playing`/`message`/`recorded_at`
/// state keys (§3, §4.D); mirrors the original's `IdentifyResult`/
/// `MusicIdResult` models.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub success: bool,
    pub message: String,
    pub recorded_at: u64,
    pub started_at: Option<u64>,
    pub rms: f32,
    pub duration_seconds: Option<f64>,
    pub track: Option<DetectionTrack>,
    pub metadata: Option<TrackMetadata>,
}
