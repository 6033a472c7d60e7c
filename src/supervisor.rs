//! Process lifecycle: role startup, signal handling and shutdown.
//!
//! Every node runs the client role; the configured orchestrator node runs
//! the server role alongside it. Shutdown is cooperative: SIGTERM/SIGINT
//! raise a shared flag, every loop observes it, and threads get a bounded
//! grace period to come home before the process exits anyway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::client;
use crate::config::Config;
use crate::probe::{SysfsTrafficProbe, TrafficProbe};
use crate::radio::{IwRadio, RadioControl};
use crate::scan::{QualityScorer, SpectralScanScorer};
use crate::server;
use crate::util;

/// Grace period for thread joins at shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the daemon until a termination signal arrives.
pub fn run(config: Config) -> anyhow::Result<()> {
    check_radio_interfaces(&config);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .context("registering SIGTERM handler")?;
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))
        .context("registering SIGINT handler")?;

    let primary = config.rmacs.primary_radio.clone();
    let mac_address = match util::interface_mac(&primary) {
        Ok(mac) => mac,
        Err(e) => {
            log::error!("Could not read MAC address of {primary}: {e}");
            "00:00:00:00:00:00".to_string()
        }
    };
    let radio: Arc<dyn RadioControl> = Arc::new(IwRadio::new(&primary));
    let probe: Arc<dyn TrafficProbe> = Arc::new(SysfsTrafficProbe::new(&primary));
    let scorer: Arc<dyn QualityScorer> = Arc::new(
        SpectralScanScorer::new(
            &primary,
            &config.rmacs.driver,
            &config.rmacs.bin_file,
            config.rmacs.channel_bandwidth,
            Arc::clone(&radio),
        )
        .context("initializing spectral scan")?,
    );

    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    if config.rmacs.orchestra_node {
        log::info!("This node is the orchestrator, starting the server FSM");
        let handle = server::start(
            &config,
            mac_address.clone(),
            Arc::clone(&radio),
            Arc::clone(&shutdown),
        );
        threads.extend(handle.threads);
    }
    let handle = client::start(
        &config,
        mac_address,
        radio,
        probe,
        scorer,
        Arc::clone(&shutdown),
    );
    threads.extend(handle.threads);

    log::info!("RMACS daemon is running");
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(500));
    }

    log::info!("Received termination signal, stopping RMACS");
    join_with_timeout(threads, JOIN_TIMEOUT);
    log::info!("RMACS stopped");
    Ok(())
}

/// Preflight: log the operational state of every control-channel interface.
///
/// A down non-primary interface is tolerated; a down primary radio is a hard
/// problem worth an error, but startup continues on the remaining interfaces.
fn check_radio_interfaces(config: &Config) {
    for interface in &config.rmacs.radio_interfaces {
        if util::interface_operstate(interface) {
            log::info!("Radio interface [{interface}] is up");
        } else if *interface == config.rmacs.primary_radio {
            log::error!("Primary radio [{interface}] is not up");
        } else {
            log::warn!("Radio interface [{interface}] is not up");
        }
    }
}

/// Join all threads, giving the whole group one shared grace period.
fn join_with_timeout(threads: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for handle in threads {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        if handle.is_finished() {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            let _ = handle.join();
            log::info!("Thread {name} stopped");
        } else {
            log::warn!(
                "Thread {} did not stop within {timeout:?}, exiting anyway",
                handle.thread().name().unwrap_or("<unnamed>")
            );
        }
    }
}
