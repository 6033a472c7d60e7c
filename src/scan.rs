//! Off-channel spectral scanning and channel quality scoring.
//!
//! A scan is driven through the driver's debugfs spectral-scan control file,
//! sampled with an off-channel `iw scan`, dumped to a binary file and handed
//! to the external `ss-analyser` binary, whose stdout carries the scalar
//! channel quality index (lower is better). The analyser emits JSON with
//! unquoted keys, so the report is normalized before parsing.

use std::fs;
use std::process::Command;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::radio::RadioControl;
use crate::util;

/// Capability interface over the scan/analyse pipeline.
pub trait QualityScorer: Send + Sync {
    /// Score one frequency; returns the channel quality index.
    fn score(&self, freq: u32) -> Result<u32>;
}

/// Drivers with a debugfs spectral scan interface.
const SUPPORTED_DRIVERS: [&str; 2] = ["ath9k", "ath10k"];

/// Scorer backed by the ath spectral scan and the `ss-analyser` binary.
pub struct SpectralScanScorer {
    interface: String,
    driver: String,
    bin_file: String,
    channel_bandwidth: u16,
    radio: Arc<dyn RadioControl>,
}

impl SpectralScanScorer {
    pub fn new(
        interface: &str,
        driver: &str,
        bin_file: &str,
        channel_bandwidth: u16,
        radio: Arc<dyn RadioControl>,
    ) -> Result<Self> {
        if !SUPPORTED_DRIVERS.contains(&driver) {
            return Err(Error::Scan(format!("invalid driver: {driver}")));
        }
        Ok(SpectralScanScorer {
            interface: interface.to_string(),
            driver: driver.to_string(),
            bin_file: bin_file.to_string(),
            channel_bandwidth,
            radio,
        })
    }

    fn phy_name(&self) -> Result<String> {
        let path = format!("/sys/class/net/{}/phy80211/name", self.interface);
        util::read_sysfs_string(&path).map_err(|e| Error::Scan(e.to_string()))
    }

    fn ctl_path(&self, phy: &str) -> String {
        format!("/sys/kernel/debug/ieee80211/{phy}/{}/spectral_scan_ctl", self.driver)
    }

    fn samples_path(&self, phy: &str) -> String {
        format!("/sys/kernel/debug/ieee80211/{phy}/{}/spectral_scan0", self.driver)
    }

    fn write_ctl(&self, phy: &str, mode: &str) -> Result<()> {
        let path = self.ctl_path(phy);
        fs::write(&path, mode)
            .map_err(|e| Error::Scan(format!("failed to write {mode} to {path}: {e}")))
    }

    /// Run the off-channel `iw scan` that makes the hardware sample `freq`.
    ///
    /// At 40 MHz bandwidth the current frequency is scanned alongside the
    /// candidate so the secondary channel stays covered.
    fn drive_scan(&self, freq: u32) -> Result<()> {
        let mut cmd = Command::new("iw");
        cmd.args(["dev", self.interface.as_str(), "scan", "freq"])
            .arg(freq.to_string());
        if self.channel_bandwidth == 40 {
            if let Ok(cur_freq) = self.radio.current_freq() {
                if cur_freq != freq {
                    cmd.arg(cur_freq.to_string());
                }
            }
        }
        cmd.arg("flush");
        let output = cmd
            .output()
            .map_err(|e| Error::Scan(format!("failed to run iw scan: {e}")))?;
        if !output.status.success() {
            return Err(Error::Scan(format!("iw scan exited with {}", output.status)));
        }
        Ok(())
    }

    fn dump_samples(&self, phy: &str) -> Result<()> {
        let samples = self.samples_path(phy);
        fs::copy(&samples, &self.bin_file)
            .map_err(|e| Error::Scan(format!("failed to dump {samples}: {e}")))?;
        Ok(())
    }

    fn analyse(&self, freq: u32) -> Result<String> {
        let output = Command::new("ss-analyser")
            .arg(&self.bin_file)
            .arg(freq.to_string())
            .output()
            .map_err(|e| Error::Scan(format!("failed to run ss-analyser: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Scan(format!(
                "ss-analyser exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl QualityScorer for SpectralScanScorer {
    fn score(&self, freq: u32) -> Result<u32> {
        let phy = self.phy_name()?;
        self.write_ctl(&phy, "background")?;
        self.write_ctl(&phy, "trigger")?;
        self.drive_scan(freq)?;
        self.write_ctl(&phy, "disable")?;
        self.dump_samples(&phy)?;
        let report = self.analyse(freq)?;
        parse_scan_report(&report)
    }
}

/// Parse the analyser stdout into a channel quality index.
///
/// The report is a JSON array; the first element carrying an `index` wins,
/// an `error` element is surfaced as a scan failure.
pub(crate) fn parse_scan_report(raw: &str) -> Result<u32> {
    let normalized = normalize_report_keys(raw);
    let items: Vec<serde_json::Value> = serde_json::from_str(normalized.trim())
        .map_err(|e| Error::Scan(format!("unparseable analyser report: {e}")))?;
    for item in items {
        if let Some(index) = item.get("index").and_then(serde_json::Value::as_u64) {
            return u32::try_from(index)
                .map_err(|_| Error::Scan(format!("quality index {index} out of range")));
        }
        if let Some(message) = item.get("error").and_then(serde_json::Value::as_str) {
            return Err(Error::Scan(message.to_string()));
        }
    }
    Err(Error::Scan("analyser report contained no index".to_string()))
}

/// Quote bare object keys (`{index: 3}` -> `{"index": 3}`).
///
/// Already-quoted keys pass through untouched.
fn normalize_report_keys(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 16);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if c != '{' && c != ',' {
            continue;
        }
        let mut j = i;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        let mut k = j;
        while k < chars.len() && (chars[k].is_alphanumeric() || chars[k] == '_') {
            k += 1;
        }
        if k == j {
            continue;
        }
        let mut m = k;
        while m < chars.len() && chars[m].is_whitespace() {
            m += 1;
        }
        if m < chars.len() && chars[m] == ':' {
            out.push('"');
            out.extend(&chars[j..k]);
            out.push('"');
            out.push(':');
            i = m + 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_keys_are_quoted() {
        assert_eq!(normalize_report_keys("[{index: 3}]"), r#"[{"index": 3}]"#);
        assert_eq!(
            normalize_report_keys("[{freq: 5180, index: 2}]"),
            r#"[{"freq": 5180,"index": 2}]"#
        );
    }

    #[test]
    fn quoted_keys_pass_through() {
        let quoted = r#"[{"index": 4}]"#;
        assert_eq!(normalize_report_keys(quoted), quoted);
    }

    #[test]
    fn report_with_index_yields_quality() {
        assert_eq!(parse_scan_report("[{index: 3}]").unwrap(), 3);
        assert_eq!(parse_scan_report(r#"[{"freq": 5180}, {"index": 8}]"#).unwrap(), 8);
    }

    #[test]
    fn report_with_error_is_a_scan_error() {
        let err = parse_scan_report(r#"[{"error": "no samples captured"}]"#).unwrap_err();
        assert!(matches!(err, Error::Scan(_)));
    }

    #[test]
    fn garbage_report_is_a_scan_error() {
        assert!(parse_scan_report("whatever").is_err());
        assert!(parse_scan_report("[]").is_err());
    }
}
