//! General utilities shared across the core library.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in whole seconds, as a float.
#[must_use]
pub fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Numeric helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Clamps `n` to the closed interval `[min_, max_]`.
#[must_use]
pub fn clamp(n: f64, min_: f64, max_: f64) -> f64 {
    n.max(min_).min(max_)
}

/// Normalises `raw` from `[min_, max_]` to `[-1.0, 1.0]`.
///
/// Used by the `dump` command handler (§4.D) to normalise captured audio
/// before writing a FLAC file.
#[must_use]
pub fn normalize(raw: f64, min_: f64, max_: f64) -> f64 {
    2.0 * (raw - min_) / (max_ - min_) - 1.0
}

/// Root-mean-square amplitude of `samples` (§4.D), the scheduler's silence proxy.
/// Returns 0.0 for an empty slice.
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0.0; 100]), 0.0);
    }

    #[test]
    fn rms_of_constant_amplitude_equals_that_amplitude() {
        let samples = vec![0.5_f32; 1000];
        assert!((rms(&samples) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn clamp_keeps_in_range_values_unchanged() {
        assert_eq!(clamp(0.5, 0.0, 1.0), 0.5);
    }

    #[test]
    fn clamp_clips_to_bounds() {
        assert_eq!(clamp(-5.0, 0.0, 1.0), 0.0);
        assert_eq!(clamp(5.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn normalize_maps_extremes_to_unit_range() {
        assert_eq!(normalize(0.0, 0.0, 100.0), -1.0);
        assert_eq!(normalize(100.0, 0.0, 100.0), 1.0);
        assert_eq!(normalize(50.0, 0.0, 100.0), 0.0);
    }

    #[test]
    fn now_millis_is_nonzero() {
        assert!(now_millis() > 0);
    }
}
