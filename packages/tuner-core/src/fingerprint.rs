//! Pluggable fingerprint providers (§2.A, §9 Design Notes).
//!
//! The source dynamically imports a plugin module selected by a config
//! string. A systems language has no equivalent need: this is a capability
//! set resolved once, by name, at startup — unknown names are a
//! configuration error, not a runtime fallback.

use async_trait::async_trait;

use crate::error::{TunerError, TunerResult};

/// A raw match returned by a fingerprint provider.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintMatch {
    pub track_id: String,
    /// Offset into the track, in seconds, where the sampled clip began.
    pub offset: f64,
    /// Track duration in seconds, if the provider knows it.
    pub duration_seconds: Option<f64>,
    /// The provider's own title guess, used as the metadata fetch hint (§4.D).
    pub title: String,
    /// The provider's own artist guess, used as the metadata fetch hint.
    pub artist: String,
    /// Album name, when the provider's fingerprint database carries one.
    pub album: Option<String>,
}

/// An identification capability set (§9: `{format, subtype, identify}`).
#[async_trait]
pub trait FingerprintProvider: Send + Sync {
    /// Audio container format this provider expects its input encoded as (e.g. `"flac"`).
    fn format(&self) -> &'static str;
    /// Sample subtype expected by the provider (e.g. `"PCM_16"`).
    fn subtype(&self) -> &'static str;
    /// Identifies a clip, returning `None` on no match.
    async fn identify(&self, samples: &[f32], sample_rate: u32, channels: u16) -> TunerResult<Option<FingerprintMatch>>;
}

/// Resolves a [`FingerprintProvider`] by the configured name (§6, §9).
/// Unknown names are a fatal configuration error at startup (§7).
pub fn resolve_provider(name: &str) -> TunerResult<Box<dyn FingerprintProvider>> {
    match name {
        "null" => Ok(Box::new(NullFingerprintProvider)),
        other => Err(TunerError::Configuration(format!(
            "unknown fingerprint_provider: {other}"
        ))),
    }
}

/// A provider that never matches; the default and the one used by tests that
/// don't exercise the fingerprinting path.
pub struct NullFingerprintProvider;

#[async_trait]
impl FingerprintProvider for NullFingerprintProvider {
    fn format(&self) -> &'static str {
        "flac"
    }

    fn subtype(&self) -> &'static str {
        "PCM_16"
    }

    async fn identify(
        &self,
        _samples: &[f32],
        _sample_rate: u32,
        _channels: u16,
    ) -> TunerResult<Option<FingerprintMatch>> {
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) struct StubFingerprintProvider {
    pub result: Option<FingerprintMatch>,
}

#[cfg(test)]
#[async_trait]
impl FingerprintProvider for StubFingerprintProvider {
    fn format(&self) -> &'static str {
        "flac"
    }

    fn subtype(&self) -> &'static str {
        "PCM_16"
    }

    async fn identify(
        &self,
        _samples: &[f32],
        _sample_rate: u32,
        _channels: u16,
    ) -> TunerResult<Option<FingerprintMatch>> {
        Ok(self.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_name_is_a_configuration_error() {
        let err = resolve_provider("shazam-plugin").unwrap_err();
        assert!(matches!(err, TunerError::Configuration(_)));
    }

    #[test]
    fn null_provider_resolves() {
        assert!(resolve_provider("null").is_ok());
    }

    #[tokio::test]
    async fn null_provider_never_matches() {
        let provider = NullFingerprintProvider;
        let result = provider.identify(&[0.0; 10], 44_100, 2).await.unwrap();
        assert!(result.is_none());
    }
}
