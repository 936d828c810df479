//! History storage boundary (§2.A, §3).
//!
//! Relational storage itself is out of scope (§1); this trait and the
//! in-memory double capture the two behaviours the rest of the crate depends
//! on: consecutive detections of the same track collapse into a single,
//! increasingly-early-starting row instead of duplicating it, and a saved
//! row can be looked back up by its `entry_id` (the `save` command, §4.D
//! item 4, mirroring the original's `get_history_entry(entry_id)`).

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::TunerResult;

/// A persisted history row (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub entry_id: String,
    pub track_guid: String,
    pub detected_at: u64,
    pub started_at: u64,
    pub duration_seconds: Option<f64>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Resolves (inserting if necessary) a stable `track_guid` for a raw
    /// provider track id plus whatever metadata was fetched for it.
    async fn upsert_track(&self, raw_track_id: &str, title: &str, artist: &str) -> TunerResult<String>;

    /// Records a detection, applying the same-track dedupe rule: if the most
    /// recent row has the same `track_guid`, only `started_at` is refined
    /// (monotonically earlier) and no new row is inserted. Returns the
    /// affected row's `entry_id`.
    async fn record_detection(
        &self,
        track_guid: &str,
        detected_at: u64,
        started_at: u64,
        duration_seconds: Option<f64>,
    ) -> TunerResult<String>;

    /// Looks up a previously recorded row by `entry_id` (the `save` command's
    /// bare-scalar argument, §4.D item 4).
    async fn get(&self, entry_id: &str) -> TunerResult<Option<HistoryRow>>;
}

/// In-memory test double (§2.A).
#[derive(Default)]
pub struct InMemoryHistoryStore {
    tracks: Mutex<std::collections::HashMap<String, String>>,
    rows: Mutex<Vec<HistoryRow>>,
    next_entry_id: Mutex<u64>,
}

impl InMemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rows(&self) -> Vec<HistoryRow> {
        self.rows.lock().clone()
    }

    fn next_id(&self) -> String {
        let mut next = self.next_entry_id.lock();
        let id = format!("entry-{next}");
        *next += 1;
        id
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn upsert_track(&self, raw_track_id: &str, title: &str, artist: &str) -> TunerResult<String> {
        let mut tracks = self.tracks.lock();
        let key = format!("{raw_track_id}:{title}:{artist}");
        if let Some(guid) = tracks.get(&key) {
            return Ok(guid.clone());
        }
        let guid = format!("guid-{}", tracks.len());
        tracks.insert(key, guid.clone());
        Ok(guid)
    }

    async fn record_detection(
        &self,
        track_guid: &str,
        detected_at: u64,
        started_at: u64,
        duration_seconds: Option<f64>,
    ) -> TunerResult<String> {
        let mut rows = self.rows.lock();
        if let Some(last) = rows.last_mut() {
            if last.track_guid == track_guid {
                last.started_at = last.started_at.min(started_at);
                last.detected_at = detected_at;
                last.duration_seconds = duration_seconds.or(last.duration_seconds);
                return Ok(last.entry_id.clone());
            }
        }
        drop(rows);
        let entry_id = self.next_id();
        self.rows.lock().push(HistoryRow {
            entry_id: entry_id.clone(),
            track_guid: track_guid.to_string(),
            detected_at,
            started_at,
            duration_seconds,
        });
        Ok(entry_id)
    }

    async fn get(&self, entry_id: &str) -> TunerResult<Option<HistoryRow>> {
        Ok(self.rows.lock().iter().find(|r| r.entry_id == entry_id).cloned())
    }
}
