//! `tuner-core` — shared library for the music-recognition appliance.
//!
//! This crate provides the multi-process coordination fabric: the rolling
//! audio ring buffer, the TTL state store, the IPC broker and peer, the
//! capture/detection scheduler, and the supporting trait boundaries
//! (fingerprinting, metadata, history) that the capture process drives.
//! It is used by the `apps/appliance` binary, which hosts both the
//! supervisor (parent) and capture/detection (child) process roles, and by
//! `packages/tuner-capture`, which wraps the OS audio input device.
//!
//! # Architecture
//!
//! - [`ringbuffer`]: fixed-capacity multi-channel audio ring, producer-safe for a real-time callback
//! - [`state`]: TTL key/value store with lazy and background expiry
//! - [`ipc`]: broker + peer — local pub/sub and directed request/response over Unix sockets
//! - [`detection`]: the WAITING/SCANNING scheduler state machine
//! - [`supervisor`]: spawns and restarts the capture child process
//! - [`fingerprint`], [`metadata`], [`history`]: trait boundaries to external collaborators
//! - [`config`]: layered runtime configuration
//! - [`error`]: centralized error taxonomy
//! - [`events`]: observability event emission, independent of the IPC wire protocol

#![warn(clippy::all)]

pub mod bootstrap;
pub mod clip;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod history;
pub mod ipc;
pub mod metadata;
pub mod ringbuffer;
pub mod sleep;
pub mod state;
pub mod state_client;
pub mod supervisor;
pub mod utils;

pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use config::Config;
pub use error::{ErrorCode, TunerError, TunerResult};
pub use events::{AppEvent, EventEmitter};
pub use ringbuffer::RingBuffer;
pub use state::{StateStore, TaskSpawner, TokioSpawner};
