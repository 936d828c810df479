//! Tuner Appliance - standalone headless music-recognition appliance.
//!
//! A single binary hosts two process roles (§4.E, §9): the supervisor
//! (parent), which owns the broker, state store, and the webserver peer
//! stub, and the capture/detection child, which the supervisor spawns as a
//! copy of this same binary running under the `capture` subcommand.

mod config;
mod capture_process;
mod supervisor_process;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::AppConfig;

/// Tuner Appliance - headless music-recognition service.
#[derive(Parser, Debug)]
#[command(name = "tuner-appliance")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TUNER_LOG_LEVEL", global = true)]
    log_level: log::LevelFilter,

    /// Directory containing the broker's sockets (overrides config file).
    #[arg(long, env = "TUNER_BROKER_DIR", global = true)]
    broker_dir: Option<String>,

    #[command(subcommand)]
    role: Option<Role>,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Runs the parent process: broker, state store, webserver peer stub,
    /// and the capture child supervisor. The default role.
    Supervise,
    /// Runs the capture/detection child process. Spawned internally by
    /// `supervise`; not normally invoked by an operator directly.
    Capture,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("tuner-appliance v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(ref broker_dir) = args.broker_dir {
        config.broker_dir = broker_dir.clone();
    }
    let core_config = config.to_core_config();

    match args.role.unwrap_or(Role::Supervise) {
        Role::Supervise => {
            // Re-exec this same binary for the child, carrying forward
            // whichever config file / broker-dir override the parent used
            // (§4.E: the child is a copy of this binary under a distinct role).
            let mut child_args = vec!["capture".to_string()];
            if let Some(path) = &args.config {
                child_args.push("--config".to_string());
                child_args.push(path.to_string_lossy().into_owned());
            }
            child_args.push("--broker-dir".to_string());
            child_args.push(core_config.broker_dir.clone());

            supervisor_process::run(core_config, child_args).await
        }
        Role::Capture => capture_process::run(core_config).await,
    }
}
