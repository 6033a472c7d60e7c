//! Traffic and PHY-error probing for the mesh radio.
//!
//! Readings come from three collaborators: sysfs byte counters for the TX
//! bitrate, `ethtool -S` driver counters for PHY errors and TX timeouts, and
//! `iw survey dump` for channel air time. Each delta-style reading takes two
//! samples separated by a short wait.

use std::process::Command;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util;

/// Spacing between the two samples of a delta reading.
const SAMPLE_WAIT: Duration = Duration::from_secs(2);

/// Capability interface over the interface statistics collaborators.
pub trait TrafficProbe: Send + Sync {
    /// Current TX bitrate over the sample window, in kbps.
    fn tx_rate_kbps(&self) -> Result<u64>;

    /// PHY error counter delta over the sample window.
    fn phy_error_delta(&self) -> Result<u64>;

    /// TX timeout counter delta over the sample window.
    fn tx_timeout_delta(&self) -> Result<u64>;

    /// Channel busy time as a percentage of active time.
    fn air_time_percent(&self) -> Result<f64>;
}

/// Probe reading real counters for one interface.
pub struct SysfsTrafficProbe {
    interface: String,
    sample_wait: Duration,
}

impl SysfsTrafficProbe {
    pub fn new(interface: &str) -> Self {
        SysfsTrafficProbe {
            interface: interface.to_string(),
            sample_wait: SAMPLE_WAIT,
        }
    }

    fn tx_bytes(&self) -> Result<u64> {
        let path = format!("/sys/class/net/{}/statistics/tx_bytes", self.interface);
        util::read_sysfs_u64(&path)
    }

    fn ethtool_counter(&self, key: &str) -> Result<u64> {
        let source = format!("ethtool -S {}", self.interface);
        let output = Command::new("ethtool")
            .arg("-S")
            .arg(&self.interface)
            .output()
            .map_err(|e| Error::sysfs(&source, e))?;
        if !output.status.success() {
            return Err(Error::sysfs(&source, format!("exited with {}", output.status)));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_ethtool_counter(&text, key)
            .ok_or_else(|| Error::sysfs(&source, format!("counter {key} not reported")))
    }

    fn survey_counters(&self) -> Result<(u64, u64)> {
        let source = format!("iw dev {} survey dump", self.interface);
        let output = Command::new("iw")
            .args(["dev", self.interface.as_str(), "survey", "dump"])
            .output()
            .map_err(|e| Error::sysfs(&source, e))?;
        if !output.status.success() {
            return Err(Error::sysfs(&source, format!("exited with {}", output.status)));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_survey_in_use(&text)
            .ok_or_else(|| Error::sysfs(&source, "no in-use channel in survey dump"))
    }

    fn counter_delta(&self, key: &str) -> Result<u64> {
        let before = self.ethtool_counter(key)?;
        thread::sleep(self.sample_wait);
        let after = self.ethtool_counter(key)?;
        Ok(after.saturating_sub(before))
    }
}

impl TrafficProbe for SysfsTrafficProbe {
    fn tx_rate_kbps(&self) -> Result<u64> {
        let before = self.tx_bytes()?;
        thread::sleep(self.sample_wait);
        let after = self.tx_bytes()?;
        let window_ms = self.sample_wait.as_millis().max(1) as u64;
        Ok(after.saturating_sub(before) * 8 / window_ms)
    }

    fn phy_error_delta(&self) -> Result<u64> {
        self.counter_delta("d_rx_phy_err")
    }

    fn tx_timeout_delta(&self) -> Result<u64> {
        self.counter_delta("d_tx_timeout")
    }

    fn air_time_percent(&self) -> Result<f64> {
        let (active_before, busy_before) = self.survey_counters()?;
        thread::sleep(self.sample_wait);
        let (active_after, busy_after) = self.survey_counters()?;

        let active_delta = active_after.saturating_sub(active_before);
        let busy_delta = busy_after.saturating_sub(busy_before);
        if active_delta == 0 {
            return Err(Error::sysfs(
                &format!("iw dev {} survey dump", self.interface),
                "active time delta is zero",
            ));
        }
        Ok(busy_delta as f64 / active_delta as f64 * 100.0)
    }
}

/// Find a named counter in `ethtool -S` output.
///
/// Lines look like `     d_rx_phy_err: 345`.
pub(crate) fn parse_ethtool_counter(output: &str, key: &str) -> Option<u64> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix(key).and_then(|rest| rest.strip_prefix(':')) {
            return value.trim().parse::<u64>().ok();
        }
    }
    None
}

/// Extract (channel active time, channel busy time) in milliseconds for the
/// in-use frequency from `iw survey dump` output.
pub(crate) fn parse_survey_in_use(output: &str) -> Option<(u64, u64)> {
    let mut in_use = false;
    let mut active: Option<u64> = None;
    let mut busy: Option<u64> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("frequency:") {
            if in_use {
                break;
            }
            in_use = trimmed.contains("[in use]");
            continue;
        }
        if !in_use {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("channel active time:") {
            active = parse_leading_number(rest);
        } else if let Some(rest) = trimmed.strip_prefix("channel busy time:") {
            busy = parse_leading_number(rest);
        }
        if let (Some(a), Some(b)) = (active, busy) {
            return Some((a, b));
        }
    }
    None
}

fn parse_leading_number(text: &str) -> Option<u64> {
    let digits: String = text
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETHTOOL_OUTPUT: &str = "\
NIC statistics:
     tx_pkts_nic: 1018
     rx_pkts_nic: 8617
     d_rx_phy_err: 345
     d_tx_timeout: 2
";

    const SURVEY_OUTPUT: &str = "\
Survey data from wlp1s0
\tfrequency:\t5180 MHz
\tnoise:\t\t-95 dBm
\tchannel active time:\t100 ms
\tchannel busy time:\t40 ms
Survey data from wlp1s0
\tfrequency:\t5200 MHz [in use]
\tnoise:\t\t-93 dBm
\tchannel active time:\t2000 ms
\tchannel busy time:\t500 ms
";

    #[test]
    fn ethtool_counters_are_extracted_by_name() {
        assert_eq!(parse_ethtool_counter(ETHTOOL_OUTPUT, "d_rx_phy_err"), Some(345));
        assert_eq!(parse_ethtool_counter(ETHTOOL_OUTPUT, "d_tx_timeout"), Some(2));
        assert_eq!(parse_ethtool_counter(ETHTOOL_OUTPUT, "d_missing"), None);
    }

    #[test]
    fn survey_parse_picks_the_in_use_channel() {
        assert_eq!(parse_survey_in_use(SURVEY_OUTPUT), Some((2000, 500)));
    }

    #[test]
    fn survey_without_in_use_channel_yields_none() {
        let output = "Survey data from wlp1s0\n\tfrequency:\t5180 MHz\n";
        assert_eq!(parse_survey_in_use(output), None);
    }
}
