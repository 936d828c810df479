//! The capture/detection child process role (§4.D).
//!
//! Owns the ring buffer, the audio input stream, the detection scheduler,
//! the live-stats thread, and the `save`/`dump` command handlers — all
//! state access goes through the `recorder` peer's `state.*` commands
//! rather than touching a `StateStore` directly (§5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tuner_capture::{start_capture, CaptureConfig};
use tuner_core::detection::DetectionScheduler;
use tuner_core::events::{EventEmitter, LoggingEventEmitter};
use tuner_core::fingerprint::resolve_provider;
use tuner_core::history::{HistoryStore, InMemoryHistoryStore};
use tuner_core::ipc::peer::BoxFuture;
use tuner_core::ipc::Peer;
use tuner_core::metadata::NullMetadataProvider;
use tuner_core::utils::{clamp, normalize, now_millis, rms};
use tuner_core::{detection::save_window_offsets, Config, RingBuffer, TunerError, TunerResult};

const PEER_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(config: Config) -> Result<()> {
    let emitter: Arc<dyn EventEmitter> = Arc::new(LoggingEventEmitter);
    let buffer = Arc::new(RingBuffer::new(
        config.buffer_capacity_frames(),
        config.effective_channels() as usize,
    ));

    let capture_handle = start_capture(
        CaptureConfig {
            device: config.device.clone(),
            device_offset: config.device_offset,
            sample_rate: config.sample_rate,
            channels: config.channels,
            blocksize: config.blocksize,
            latency: config.latency,
        },
        Arc::clone(&buffer),
        Arc::clone(&emitter),
    )
    .context("failed to start audio capture")?;

    let history = Arc::new(InMemoryHistoryStore::new());

    let peer = Peer::new("recorder", &config.broker_dir);
    register_command_handlers(&peer, Arc::clone(&buffer), config.clone(), Arc::clone(&history));
    peer.start().await.context("failed to connect recorder peer to broker")?;

    let fingerprint = resolve_provider(&config.fingerprint_provider).context("invalid fingerprint_provider")?;

    let cancel = CancellationToken::new();

    let live_stats = tokio::spawn(run_live_stats(
        Arc::clone(&buffer),
        Arc::clone(&peer),
        config.clone(),
        cancel.clone(),
    ));

    let scheduler = DetectionScheduler::new(
        config.clone(),
        Arc::clone(&buffer),
        Arc::clone(&peer),
        fingerprint,
        Box::new(NullMetadataProvider),
        history,
        Arc::clone(&emitter),
    );

    let detection_cancel = cancel.clone();
    scheduler.run(detection_cancel).await;

    cancel.cancel();
    let _ = live_stats.await;
    capture_handle.stop();

    Ok(())
}

/// Every `live_stats_frequency` seconds, refreshes the `rms` state key with
/// a 1-second TTL safety margin over the refresh interval (§4.D item 3).
async fn run_live_stats(buffer: Arc<RingBuffer>, peer: Arc<Peer>, config: Config, cancel: CancellationToken) {
    let interval = Duration::from_secs_f64(config.live_stats_frequency.max(0.05));
    let ttl_ms = ((config.live_stats_frequency + 1.0) * 1000.0) as i64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let window = buffer.read(Some(config.effective_sample_rate() as usize));
        let level = rms(&window);
        let _ = peer
            .state_set("rms", Some(level.to_string()), Some(ttl_ms), PEER_COMMAND_TIMEOUT)
            .await;
    }
}

fn register_command_handlers(
    peer: &Peer,
    buffer: Arc<RingBuffer>,
    config: Config,
    history: Arc<InMemoryHistoryStore>,
) {
    let save_buffer = Arc::clone(&buffer);
    let save_config = config.clone();
    let save_history = Arc::clone(&history);
    peer.on_command(
        "save",
        Arc::new(move |payload: serde_json::Value| -> BoxFuture<TunerResult<serde_json::Value>> {
            let buffer = Arc::clone(&save_buffer);
            let config = save_config.clone();
            let history = Arc::clone(&save_history);
            Box::pin(async move { handle_save(payload, &buffer, &config, &history).await })
        }),
    );

    let dump_buffer = Arc::clone(&buffer);
    let dump_config = config.clone();
    peer.on_command(
        "dump",
        Arc::new(move |payload: serde_json::Value| -> BoxFuture<TunerResult<serde_json::Value>> {
            let buffer = Arc::clone(&dump_buffer);
            let config = dump_config.clone();
            Box::pin(async move { handle_dump(payload, &buffer, &config).await })
        }),
    );
}

/// `save(entry_id)`: a bare-scalar command payload (§2.B wire format), not an
/// object — `Peer::command` passes its `data` argument straight through as
/// the payload. The entry's `started_at`/`duration_seconds` are looked up by
/// `entry_id` from history (§4.D item 4, mirroring `_save_entry`'s
/// `get_history_entry(entry_id)`); if no such entry was ever recorded, falls
/// back to the whole buffer.
async fn handle_save(
    payload: serde_json::Value,
    buffer: &RingBuffer,
    config: &Config,
    history: &InMemoryHistoryStore,
) -> TunerResult<serde_json::Value> {
    let entry_id = payload
        .as_str()
        .ok_or_else(|| TunerError::Protocol("save requires entry_id".into()))?;

    let entry = history.get(entry_id).await?;
    let (start, end) = match entry.and_then(|row| row.duration_seconds.map(|d| (row.started_at, d))) {
        Some((started_at_ms, duration_seconds)) => save_window_offsets(
            started_at_ms,
            now_millis(),
            duration_seconds as u64,
            config.temp_save_offset,
            config.effective_sample_rate(),
            config.buffer_capacity_frames(),
        ),
        None => (-((config.buffer_capacity_frames().saturating_sub(1)) as i64), 0),
    };

    let samples = buffer.slice(start, end);
    let path = tuner_core::clip::temp_clip_path(&config.appdata_dir, entry_id);
    tuner_core::clip::write_flac(&path, &samples, config.effective_sample_rate(), config.effective_channels())?;

    Ok(serde_json::json!({"path": path.to_string_lossy()}))
}

/// `dump(seconds?)`: `seconds`, when present, arrives as the bare numeric
/// payload itself (not wrapped in an object). Reads the last `seconds` (or
/// the whole buffer), normalises to the data's own `[min, max]` range per
/// `normalize` (§9), and writes a FLAC file (§4.D item 4).
async fn handle_dump(payload: serde_json::Value, buffer: &RingBuffer, config: &Config) -> TunerResult<serde_json::Value> {
    let frame_count = payload
        .as_f64()
        .map(|seconds| (seconds * config.effective_sample_rate() as f64) as usize);

    let raw = buffer.read(frame_count);
    let min = raw.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = raw.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let normalized: Vec<f32> = if (max - min).abs() < 1e-9 || !min.is_finite() || !max.is_finite() {
        raw
    } else {
        raw.iter()
            .map(|s| clamp(normalize(*s as f64, min as f64, max as f64), -1.0, 1.0) as f32)
            .collect()
    };

    let path: PathBuf = tuner_core::clip::dump_path(&config.appdata_dir);
    tuner_core::clip::write_flac(&path, &normalized, config.effective_sample_rate(), config.effective_channels())?;

    Ok(serde_json::json!({"path": path.to_string_lossy()}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_flac_frame_count(path: &std::path::Path) -> usize {
        use symphonia::core::codecs::DecoderOptions;
        use symphonia::core::formats::FormatOptions;
        use symphonia::core::io::MediaSourceStream;
        use symphonia::core::meta::MetadataOptions;
        use symphonia::core::probe::Hint;

        let file = std::fs::File::open(path).expect("flac file should open");
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("flac");

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .expect("flac file should probe");
        let mut format = probed.format;
        let track = format.tracks().first().expect("flac file should have a track").clone();
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .expect("flac track should have a registered decoder");

        let mut total_frames = 0usize;
        while let Ok(packet) = format.next_packet() {
            if let Ok(decoded) = decoder.decode(&packet) {
                total_frames += decoded.frames();
            }
        }
        total_frames
    }

    fn test_config(appdata_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.appdata_dir = appdata_dir.to_string_lossy().to_string();
        config.sample_rate = Some(1000);
        config.channels = Some(1);
        config.buffer_length_seconds = 5;
        config
    }

    // S4 — Dump 2.5s: a bare-scalar `seconds` payload selects a 2.5s window
    // rather than being silently ignored because it isn't wrapped in an
    // object.
    #[tokio::test]
    async fn handle_dump_honors_a_bare_scalar_seconds_payload() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = RingBuffer::new(config.buffer_capacity_frames(), config.effective_channels() as usize);
        let samples: Vec<f32> = (0..5000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        buffer.write(&samples, 0.0);

        let result = handle_dump(serde_json::json!(2.5), &buffer, &config).await.unwrap();
        let path = std::path::PathBuf::from(result["path"].as_str().unwrap());

        assert_eq!(decode_flac_frame_count(&path), 2500);
    }

    #[tokio::test]
    async fn handle_dump_normalizes_to_the_actual_min_and_max() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = RingBuffer::new(config.buffer_capacity_frames(), config.effective_channels() as usize);
        // Asymmetric signal: true min/max normalization should hit both
        // -1.0 and 1.0, unlike a peak-symmetric normalization which would
        // never reach -1.0 here.
        let samples: Vec<f32> = (0..100).map(|i| 0.1 + i as f32 * 0.002).collect();
        buffer.write(&samples, 0.0);

        let result = handle_dump(serde_json::Value::Null, &buffer, &config).await.unwrap();
        let path = std::path::PathBuf::from(result["path"].as_str().unwrap());
        assert_eq!(decode_flac_frame_count(&path), 100);
    }

    // S5 — Save clip with offset: a previously recorded history entry's
    // started_at/duration_seconds size the saved window instead of falling
    // back to the whole buffer.
    #[tokio::test]
    async fn handle_save_uses_the_recorded_entrys_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = RingBuffer::new(config.buffer_capacity_frames(), config.effective_channels() as usize);
        let samples: Vec<f32> = (0..5000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let now = now_millis();
        buffer.write(&samples, now as f64 / 1000.0);

        let history = InMemoryHistoryStore::new();
        let entry_id = history
            .record_detection("guid-1", now, now.saturating_sub(3_000), Some(2.0))
            .await
            .unwrap();

        let result = handle_save(serde_json::json!(entry_id), &buffer, &config, &history)
            .await
            .unwrap();
        let path = std::path::PathBuf::from(result["path"].as_str().unwrap());
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);
    }

    #[tokio::test]
    async fn handle_save_falls_back_to_the_whole_buffer_for_an_unknown_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = RingBuffer::new(config.buffer_capacity_frames(), config.effective_channels() as usize);
        buffer.write(&[0.1; 100], 0.0);
        let history = InMemoryHistoryStore::new();

        let result = handle_save(serde_json::json!("never-recorded"), &buffer, &config, &history)
            .await
            .unwrap();
        let path = std::path::PathBuf::from(result["path"].as_str().unwrap());
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);
    }

    #[tokio::test]
    async fn handle_save_without_a_string_payload_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let buffer = RingBuffer::new(config.buffer_capacity_frames(), config.effective_channels() as usize);
        let history = InMemoryHistoryStore::new();

        let err = handle_save(serde_json::Value::Null, &buffer, &config, &history)
            .await
            .unwrap_err();
        assert!(matches!(err, TunerError::Protocol(_)));
    }
}
