//! Audio input capture for the tuner appliance (§4.D item 1).
//!
//! `cpal` streams are tied to the thread that built them, so capture runs on
//! a dedicated OS thread rather than inside the Tokio runtime the rest of
//! the capture process uses — the device callback must never suspend or
//! perform I/O, which rules out an async task here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, StreamInstant};
use thiserror::Error;
use tuner_core::events::{CaptureEvent, EventEmitter};
use tuner_core::RingBuffer;

/// Failures opening or running the input stream.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device available")]
    NoDevice,
    #[error("requested device {0:?} was not found")]
    DeviceNotFound(String),
    #[error("unsupported input sample format: {0:?}")]
    UnsupportedSampleFormat(SampleFormat),
    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("failed to start input stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// Capture-relevant subset of [`tuner_core::Config`], kept independent of
/// the core crate's full configuration so this crate only depends on the
/// fields it actually reads.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: Option<String>,
    pub device_offset: f64,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub blocksize: u32,
    pub latency: f64,
}

/// A running capture stream. Dropping or calling [`CaptureHandle::stop`]
/// tears down the device stream and joins the capture thread.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Signals the capture thread to tear down its stream and joins it.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Reconstructs wall-clock seconds for a [`StreamInstant`] relative to an
/// anchor pair sampled once at stream start, so per-callback timestamps can
/// be expressed in absolute (epoch) time instead of the driver's own clock.
struct ClockAnchor {
    wall_secs: f64,
    instant: StreamInstant,
}

impl ClockAnchor {
    fn wall_secs_at(&self, instant: StreamInstant) -> f64 {
        match instant.duration_since(&self.instant) {
            Some(elapsed) => self.wall_secs + elapsed.as_secs_f64(),
            // The driver clock can jump backwards across a device glitch;
            // fall back to the anchor itself rather than producing a time
            // before it.
            None => self.wall_secs,
        }
    }
}

fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Opens the configured input device and streams audio into `buffer` until
/// the returned [`CaptureHandle`] is stopped or dropped (§4.D item 1).
pub fn start_capture(
    config: CaptureConfig,
    buffer: Arc<RingBuffer>,
    emitter: Arc<dyn EventEmitter>,
) -> Result<CaptureHandle, CaptureError> {
    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);

    let thread = std::thread::Builder::new()
        .name("tuner-capture".to_string())
        .spawn(move || run_capture_thread(config, buffer, emitter, thread_running))
        .expect("failed to spawn capture thread");

    Ok(CaptureHandle {
        running,
        thread: Some(thread),
    })
}

fn run_capture_thread(
    config: CaptureConfig,
    buffer: Arc<RingBuffer>,
    emitter: Arc<dyn EventEmitter>,
    running: Arc<AtomicBool>,
) {
    match open_stream(&config, buffer, Arc::clone(&emitter)) {
        Ok(stream) => {
            if let Err(e) = stream.play() {
                emitter.emit(
                    CaptureEvent::StreamError {
                        message: e.to_string(),
                        timestamp: tuner_core::utils::now_millis(),
                    }
                    .into(),
                );
                return;
            }
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            // `stream` drops here, stopping the device callback.
        }
        Err(e) => {
            emitter.emit(
                CaptureEvent::StreamError {
                    message: e.to_string(),
                    timestamp: tuner_core::utils::now_millis(),
                }
                .into(),
            );
        }
    }
}

fn resolve_device(host: &cpal::Host, wanted: &Option<String>) -> Result<cpal::Device, CaptureError> {
    match wanted {
        None => host.default_input_device().ok_or(CaptureError::NoDevice),
        Some(name) => host
            .input_devices()
            .map_err(|_| CaptureError::NoDevice)?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceNotFound(name.clone())),
    }
}

fn open_stream(
    config: &CaptureConfig,
    buffer: Arc<RingBuffer>,
    emitter: Arc<dyn EventEmitter>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = resolve_device(&host, &config.device)?;
    let default_config = device
        .default_input_config()
        .map_err(|_| CaptureError::NoDevice)?;

    let sample_rate = config
        .sample_rate
        .unwrap_or_else(|| default_config.sample_rate().0);
    let channels = config.channels.unwrap_or_else(|| default_config.channels());
    let sample_format = default_config.sample_format();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.blocksize),
    };

    let device_offset = config.device_offset;
    let anchor: Arc<parking_lot::Mutex<Option<ClockAnchor>>> = Arc::new(parking_lot::Mutex::new(None));

    emitter.emit(
        CaptureEvent::StreamStarted {
            sample_rate,
            channels,
            timestamp: tuner_core::utils::now_millis(),
        }
        .into(),
    );

    let err_emitter = Arc::clone(&emitter);
    let err_fn = move |err: cpal::StreamError| {
        err_emitter.emit(
            CaptureEvent::StreamError {
                message: err.to_string(),
                timestamp: tuner_core::utils::now_millis(),
            }
            .into(),
        );
    };

    let data_fn = move |data: &[f32], info: &cpal::InputCallbackInfo| {
        write_block(
            &buffer,
            &anchor,
            data,
            channels as usize,
            sample_rate,
            device_offset,
            info,
        );
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(&stream_config, data_fn, err_fn, None)?,
        other => return Err(CaptureError::UnsupportedSampleFormat(other)),
    };

    Ok(stream)
}

/// Computes the absolute capture time of the block's last frame per §4.D
/// item 1 (`callback_time + block_duration + (wall_now - stream_now) +
/// device_offset`) and writes the block into the ring buffer.
fn write_block(
    buffer: &RingBuffer,
    anchor: &parking_lot::Mutex<Option<ClockAnchor>>,
    data: &[f32],
    channels: usize,
    sample_rate: u32,
    device_offset: f64,
    info: &cpal::InputCallbackInfo,
) {
    let timestamp = info.timestamp();
    let mut anchor_guard = anchor.lock();
    let anchor = anchor_guard.get_or_insert_with(|| ClockAnchor {
        wall_secs: now_secs_f64(),
        instant: timestamp.callback,
    });

    let callback_time = anchor.wall_secs_at(timestamp.callback);
    let stream_now = anchor.wall_secs_at(timestamp.capture);
    let wall_now = now_secs_f64();
    let frame_count = data.len() / channels.max(1);
    let block_duration = frame_count as f64 / sample_rate as f64;

    let last_frame_time = callback_time + block_duration + (wall_now - stream_now) + device_offset;

    buffer.write(data, last_frame_time);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_device_reports_missing_named_device() {
        let host = cpal::default_host();
        let err = resolve_device(&host, &Some("definitely-not-a-real-device".to_string()));
        assert!(matches!(err, Err(CaptureError::DeviceNotFound(_)) | Err(CaptureError::NoDevice)));
    }
}
