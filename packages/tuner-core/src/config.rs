//! Core runtime configuration (§6).
//!
//! This is the domain configuration consumed by the ring buffer, capture
//! thread, and detection scheduler. The binary crate layers file/env/CLI
//! overrides on top of [`Config::default`] the way `apps/appliance`'s own
//! config loader does; this struct only knows its own literal defaults.

use serde::{Deserialize, Serialize};

/// Recognised configuration options (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Input device name; `None` selects the host's default device.
    pub device: Option<String>,
    /// Seconds to subtract from the displayed capture timestamp.
    pub device_offset: f64,
    /// Sample rate in Hz; `None` falls back to the device's reported default (44100).
    pub sample_rate: Option<u32>,
    /// Channel count; `None` falls back to the device's reported default (2).
    pub channels: Option<u16>,
    /// Frames per audio callback.
    pub blocksize: u32,
    /// Requested input latency, in seconds.
    pub latency: f64,
    /// Nominal scan window length, in seconds.
    pub duration: u64,
    /// RMS threshold below which the scheduler treats input as silence.
    pub silence_threshold: f32,
    /// Ring buffer length, in seconds.
    pub buffer_length_seconds: u64,
    /// Extra seconds padded before/after a saved clip's nominal window.
    pub temp_save_offset: u64,
    /// How often the live-stats thread refreshes the `rms` state key, in seconds.
    pub live_stats_frequency: f64,
    /// Directory containing the broker's `pub`/`sub`/`cmd` sockets.
    pub broker_dir: String,
    /// Directory for application data (temp clips, dumps).
    pub appdata_dir: String,
    /// Directory backing the external music library (owned by the rip collaborator).
    pub music_library_dir: String,
    /// Name of the registered `FingerprintProvider` to use (§2.A, §9).
    pub fingerprint_provider: String,
    /// Exit code the capture child uses to request immediate respawn (§2.A).
    pub restart_exit_code: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            device_offset: 0.0,
            sample_rate: None,
            channels: None,
            blocksize: 8192,
            latency: 1.0,
            duration: 15,
            silence_threshold: 0.0004,
            buffer_length_seconds: 12 * 60,
            temp_save_offset: 30,
            live_stats_frequency: 0.2,
            broker_dir: "/tmp/tuner/broker".to_string(),
            appdata_dir: "/tmp/tuner/appdata".to_string(),
            music_library_dir: "/tmp/tuner/music".to_string(),
            fingerprint_provider: "null".to_string(),
            restart_exit_code: 75,
        }
    }
}

impl Config {
    /// Resolves the effective sample rate, falling back to the device default (44100 Hz).
    #[must_use]
    pub fn effective_sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(44_100)
    }

    /// Resolves the effective channel count, falling back to the device default (2).
    #[must_use]
    pub fn effective_channels(&self) -> u16 {
        self.channels.unwrap_or(2)
    }

    /// Ring buffer capacity in frames: `R * buffer_length_seconds`.
    #[must_use]
    pub fn buffer_capacity_frames(&self) -> usize {
        self.effective_sample_rate() as usize * self.buffer_length_seconds as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_literals() {
        let cfg = Config::default();
        assert_eq!(cfg.blocksize, 8192);
        assert_eq!(cfg.duration, 15);
        assert_eq!(cfg.silence_threshold, 0.0004);
        assert_eq!(cfg.buffer_length_seconds, 12 * 60);
        assert_eq!(cfg.temp_save_offset, 30);
        assert_eq!(cfg.restart_exit_code, 75);
    }

    #[test]
    fn effective_sample_rate_falls_back_to_device_default() {
        let cfg = Config::default();
        assert_eq!(cfg.effective_sample_rate(), 44_100);
        assert_eq!(cfg.effective_channels(), 2);
    }

    #[test]
    fn buffer_capacity_frames_multiplies_rate_by_length() {
        let mut cfg = Config::default();
        cfg.sample_rate = Some(1000);
        cfg.buffer_length_seconds = 5;
        assert_eq!(cfg.buffer_capacity_frames(), 5000);
    }
}
