//! Centralized error types for the tuner core library.
//!
//! Every variant carries a stable machine-readable code via [`ErrorCode`] so
//! IPC `ERR` payloads and log lines stay greppable independent of the
//! human-readable message.

use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for IPC error payloads.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the tuner core library.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum TunerError {
    /// The addressed peer is not currently connected to the broker.
    #[error("peer not connected: {0}")]
    Routing(String),

    /// A `command()` call exceeded its deadline.
    #[error("command timed out: {0}")]
    Timeout(String),

    /// A command handler returned an error.
    #[error("handler error: {0}")]
    Handler(String),

    /// A transient failure talking to an external collaborator (fingerprint
    /// provider, metadata provider) or a socket hiccup. Non-fatal.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Malformed IPC frame, bad correlation id, or similar protocol misuse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Startup configuration is invalid or incomplete. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable runtime failure (buffer allocation, socket bind).
    /// The process exits; the supervisor decides whether to respawn.
    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

impl ErrorCode for TunerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Routing(_) => "routing_error",
            Self::Timeout(_) => "timeout",
            Self::Handler(_) => "handler_error",
            Self::TransientIo(_) => "transient_io_error",
            Self::Protocol(_) => "protocol_error",
            Self::Configuration(_) => "configuration_error",
            Self::Fatal(_) => "fatal_error",
        }
    }
}

/// Convenient Result alias for core library operations.
pub type TunerResult<T> = Result<T, TunerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_error_has_stable_code() {
        let err = TunerError::Routing("ghost".into());
        assert_eq!(err.code(), "routing_error");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn timeout_error_has_stable_code() {
        let err = TunerError::Timeout("state.get".into());
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn serializes_with_tagged_shape() {
        let err = TunerError::Handler("boom".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "Handler");
        assert_eq!(json["details"], "boom");
    }
}
