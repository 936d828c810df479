//! Appliance configuration: YAML file, then environment, then CLI overrides
//! (applied in `main.rs`), mirroring the core library's own documented
//! precedence order (§1.A).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// On-disk/environment configuration shape; converted to [`tuner_core::Config`]
/// via [`AppConfig::to_core_config`] once all layers are applied.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: Option<String>,
    pub device_offset: f64,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub blocksize: u32,
    pub latency: f64,
    pub duration: u64,
    pub silence_threshold: f32,
    pub buffer_length_seconds: u64,
    pub temp_save_offset: u64,
    pub live_stats_frequency: f64,
    /// Override: `TUNER_BROKER_DIR`
    pub broker_dir: String,
    /// Override: `TUNER_APPDATA_DIR`
    pub appdata_dir: String,
    pub music_library_dir: String,
    pub fingerprint_provider: String,
    pub restart_exit_code: i32,
}

impl Default for AppConfig {
    fn default() -> Self {
        let core = tuner_core::Config::default();
        Self {
            device: core.device,
            device_offset: core.device_offset,
            sample_rate: core.sample_rate,
            channels: core.channels,
            blocksize: core.blocksize,
            latency: core.latency,
            duration: core.duration,
            silence_threshold: core.silence_threshold,
            buffer_length_seconds: core.buffer_length_seconds,
            temp_save_offset: core.temp_save_offset,
            live_stats_frequency: core.live_stats_frequency,
            broker_dir: core.broker_dir,
            appdata_dir: core.appdata_dir,
            music_library_dir: core.music_library_dir,
            fingerprint_provider: core.fingerprint_provider,
            restart_exit_code: core.restart_exit_code,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TUNER_BROKER_DIR") {
            self.broker_dir = val;
        }
        if let Ok(val) = std::env::var("TUNER_APPDATA_DIR") {
            self.appdata_dir = val;
        }
        if let Ok(val) = std::env::var("TUNER_MUSIC_LIBRARY_DIR") {
            self.music_library_dir = val;
        }
        if let Ok(val) = std::env::var("TUNER_FINGERPRINT_PROVIDER") {
            self.fingerprint_provider = val;
        }
        if let Ok(val) = std::env::var("TUNER_DEVICE") {
            self.device = Some(val);
        }
    }

    /// Converts to `tuner-core`'s [`tuner_core::Config`].
    pub fn to_core_config(&self) -> tuner_core::Config {
        tuner_core::Config {
            device: self.device.clone(),
            device_offset: self.device_offset,
            sample_rate: self.sample_rate,
            channels: self.channels,
            blocksize: self.blocksize,
            latency: self.latency,
            duration: self.duration,
            silence_threshold: self.silence_threshold,
            buffer_length_seconds: self.buffer_length_seconds,
            temp_save_offset: self.temp_save_offset,
            live_stats_frequency: self.live_stats_frequency,
            broker_dir: self.broker_dir.clone(),
            appdata_dir: self.appdata_dir.clone(),
            music_library_dir: self.music_library_dir.clone(),
            fingerprint_provider: self.fingerprint_provider.clone(),
            restart_exit_code: self.restart_exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_core_config() {
        let app = AppConfig::default();
        let core = app.to_core_config();
        assert_eq!(core.blocksize, 8192);
        assert_eq!(core.restart_exit_code, 75);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.broker_dir, tuner_core::Config::default().broker_dir);
    }
}
