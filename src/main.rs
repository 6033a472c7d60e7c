//! # RMACS - Resilient Mesh Automatic Channel Selection
//!
//! Daemon that keeps a wireless mesh network on the least interfered radio
//! frequency. Every node monitors its own traffic and PHY-error counters,
//! scans candidate frequencies off-channel and reports the scores over an
//! IPv6 multicast control channel. The single configured orchestrator node
//! aggregates those reports into a quality ledger, probes the best-ranked
//! candidates with partial frequency hopping, and coordinates mesh-wide
//! channel switch announcements once a winner is stable.
//!
//! ## Architecture Overview
//!
//! The process is a set of cooperating OS threads:
//!
//! 1. **Supervisor (main thread)**: loads the configuration, starts the
//!    roles and waits for SIGTERM/SIGINT to run the cooperative shutdown.
//! 2. **Client FSM thread**: the interference detection loop every node
//!    runs (traffic monitor -> error monitor -> scan -> report).
//! 3. **Server FSM thread** (orchestrator node only): ledger updates,
//!    partial frequency hopping, switch and operating-frequency broadcasts.
//! 4. **Receive threads**: one per control-channel socket; they decode and
//!    de-duplicate frames and forward typed events into bounded channels
//!    consumed by the FSM threads.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use env_logger::Builder;
use log::{LevelFilter, error, info};

mod client;
mod comms;
mod config;
mod error;
mod probe;
mod radio;
mod scan;
mod server;
mod supervisor;
mod util;

use config::Config;

fn main() -> ExitCode {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("rmacs"), LevelFilter::Debug)
        .init();

    info!("Starting up");

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config_path = Path::new(config::CONFIG_FILE);
    Config::ensure_default(config_path).context("creating default configuration")?;
    let config = Config::load(config_path).context("loading configuration")?;
    supervisor::run(config)
}
