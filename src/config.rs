//! Configuration loading for the RMACS daemon.
//!
//! The configuration lives in a YAML file with two top-level keys:
//! `RMACS_Config` (process-wide tuning) and `MULTICAST_CONFIG` (per control
//! channel interface multicast group/port). It is loaded once at supervisor
//! start and treated as immutable afterwards. A missing file is replaced by a
//! generated default so a freshly imaged node comes up in a sane state.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv6Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed location of the daemon configuration.
pub const CONFIG_DIR: &str = "/etc/rmacs";
pub const CONFIG_FILE: &str = "/etc/rmacs/rmacs_config.yaml";

/// Multicast endpoint used by one control-channel interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastEndpoint {
    /// IPv6 multicast group joined on this interface.
    pub group: Ipv6Addr,
    /// UDP port bound and sent to on this interface.
    pub port: u16,
}

/// Process-wide tuning knobs, all under the `RMACS_Config` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmacsConfig {
    /// Mesh radio whose frequency is managed.
    pub primary_radio: String,
    /// Interfaces carrying the multicast control channel.
    pub radio_interfaces: Vec<String>,
    /// Candidate frequencies in MHz, scanned round-robin by clients.
    pub freq_list: Vec<u32>,
    /// Frequency assumed at startup before the radio is queried.
    pub starting_frequency: u32,
    /// Channel bandwidth in MHz, used for the HT<bw> switch argument.
    pub channel_bandwidth: u16,
    /// CSA beacon count used by the orchestrator's local switches.
    pub beacon_count: u32,
    /// CSA beacon count used by client switches.
    pub client_beacon_count: u32,
    /// Extra settle time in seconds after a CSA before verification.
    pub buffer_period: u64,
    /// Scores above this mark the operating channel as bad.
    pub channel_quality_index_threshold: u32,
    /// PHY error delta above which a sample counts as an error.
    pub phy_error_limit: u64,
    /// TX timeout delta above which a sample counts as an error.
    pub tx_timeout_limit: u64,
    /// Channel busy-time percentage above which a sample counts as an error.
    pub air_time_limit: f64,
    /// TX bitrate in kbps above which the mesh is considered busy.
    pub traffic_threshold: u64,
    /// Ledger entries older than this (relative to the freshest report for
    /// the same frequency) are excluded from the average, in seconds.
    pub report_expiry_threshold: u64,
    /// Minimum spacing between accepted BCQI alerts, in seconds.
    pub bcqi_threshold_time: u64,
    /// Interval of the operating-frequency broadcast, in seconds.
    pub periodic_operating_freq_broadcast: u64,
    /// Pause between partial-frequency-hopping iterations, in seconds.
    pub hop_interval: u64,
    /// Consecutive re-evaluations the best frequency must survive.
    pub stability_threshold: u32,
    /// Number of top-ranked frequencies probed during hopping.
    pub seq_limit: usize,
    /// Consecutive bad samples before the error monitor reports ERROR.
    pub max_error_check: u32,
    /// Client channel-switch verification retries.
    pub max_switch_retries: u32,
    /// Whether this node additionally runs the orchestrator FSM.
    pub orchestra_node: bool,
    /// Wireless driver, selects the spectral-scan control files.
    pub driver: String,
    /// Destination of the raw spectral scan dump fed to the analyser.
    pub bin_file: String,
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "RMACS_Config")]
    pub rmacs: RmacsConfig,
    #[serde(rename = "MULTICAST_CONFIG")]
    pub multicast: HashMap<String, MulticastEndpoint>,
}

impl Default for Config {
    fn default() -> Self {
        let rmacs = RmacsConfig {
            primary_radio: "wlp1s0".to_string(),
            radio_interfaces: vec!["wlp1s0".to_string()],
            freq_list: vec![5180, 5200, 5220, 5240],
            starting_frequency: 5180,
            channel_bandwidth: 20,
            beacon_count: 10,
            client_beacon_count: 10,
            buffer_period: 2,
            channel_quality_index_threshold: 5,
            phy_error_limit: 200,
            tx_timeout_limit: 5,
            air_time_limit: 70.0,
            traffic_threshold: 100,
            report_expiry_threshold: 30,
            bcqi_threshold_time: 10,
            periodic_operating_freq_broadcast: 60,
            hop_interval: 5,
            stability_threshold: 2,
            seq_limit: 3,
            max_error_check: 3,
            max_switch_retries: 3,
            orchestra_node: false,
            driver: "ath10k".to_string(),
            bin_file: "/tmp/rmacs_scan.bin".to_string(),
        };
        let mut multicast = HashMap::new();
        multicast.insert(
            "wlp1s0".to_string(),
            MulticastEndpoint {
                group: "ff02::6d73".parse().expect("valid default group"),
                port: 49400,
            },
        );
        Config { rmacs, multicast }
    }
}

impl Config {
    /// Load and validate the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Create the config directory and a default config file when missing.
    pub fn ensure_default(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| Error::Config(format!("failed to create {}: {e}", dir.display())))?;
            log::info!("Created configuration directory: {}", dir.display());
        }
        let default = Config::default();
        let rendered = serde_yaml::to_string(&default)
            .map_err(|e| Error::Config(format!("failed to render default config: {e}")))?;
        fs::write(path, rendered)
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))?;
        log::info!("Created default configuration file: {}", path.display());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let r = &self.rmacs;
        if r.radio_interfaces.is_empty() {
            return Err(Error::Config("radio_interfaces must not be empty".into()));
        }
        if r.freq_list.is_empty() {
            return Err(Error::Config("freq_list must not be empty".into()));
        }
        if r.stability_threshold == 0 {
            return Err(Error::Config("stability_threshold must be at least 1".into()));
        }
        if r.seq_limit == 0 {
            return Err(Error::Config("seq_limit must be at least 1".into()));
        }
        if r.max_error_check == 0 {
            return Err(Error::Config("max_error_check must be at least 1".into()));
        }
        for interface in &r.radio_interfaces {
            if !self.multicast.contains_key(interface) {
                return Err(Error::Config(format!(
                    "no MULTICAST_CONFIG entry for interface {interface}"
                )));
            }
        }
        Ok(())
    }

    /// Multicast endpoint for a control-channel interface.
    pub fn endpoint(&self, interface: &str) -> Result<&MulticastEndpoint> {
        self.multicast
            .get(interface)
            .ok_or_else(|| Error::Config(format!("unknown interface: {interface}")))
    }

    pub fn report_expiry_window(&self) -> Duration {
        Duration::from_secs(self.rmacs.report_expiry_threshold)
    }

    pub fn bcqi_debounce_window(&self) -> Duration {
        Duration::from_secs(self.rmacs.bcqi_threshold_time)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.rmacs.periodic_operating_freq_broadcast)
    }

    pub fn hop_interval(&self) -> Duration {
        Duration::from_secs(self.rmacs.hop_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let rendered = serde_yaml::to_string(&Config::default()).unwrap();
        let parsed: Config = serde_yaml::from_str(&rendered).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.rmacs.freq_list, vec![5180, 5200, 5220, 5240]);
        assert_eq!(parsed.endpoint("wlp1s0").unwrap().port, 49400);
    }

    #[test]
    fn load_rejects_interface_without_multicast_entry() {
        let mut config = Config::default();
        config.rmacs.radio_interfaces.push("wlp2s0".to_string());
        let rendered = serde_yaml::to_string(&config).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(rendered.as_bytes()).unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn ensure_default_creates_a_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("rmacs_config.yaml");
        Config::ensure_default(&path).unwrap();
        let config = Config::load(&path).unwrap();
        assert!(!config.rmacs.orchestra_node);
        // A second call is a no-op on an existing file.
        Config::ensure_default(&path).unwrap();
    }
}
