//! Radio control: mesh frequency queries and channel-switch announcements.
//!
//! Everything the kernel/driver side does is reached through the `iw`
//! utility. The capability trait keeps the FSMs testable with fakes; the
//! real implementation shells out and parses `iw dev` output.

use std::process::Command;

use crate::error::{Error, Result};

/// Capability interface over the mesh radio.
pub trait RadioControl: Send + Sync {
    /// Current mesh operating frequency in MHz, read back from the driver.
    fn current_freq(&self) -> Result<u32>;

    /// Issue a channel-switch announcement.
    ///
    /// Success means the command was accepted; whether the switch actually
    /// happened is verified by re-reading [`RadioControl::current_freq`]
    /// after the beacons have gone out.
    fn switch_freq(&self, freq: u32, bandwidth: u16, beacons: u32) -> Result<()>;
}

/// `iw`-backed radio control for one interface.
pub struct IwRadio {
    interface: String,
}

impl IwRadio {
    pub fn new(interface: &str) -> Self {
        IwRadio {
            interface: interface.to_string(),
        }
    }
}

impl RadioControl for IwRadio {
    fn current_freq(&self) -> Result<u32> {
        let output = Command::new("iw")
            .arg("dev")
            .output()
            .map_err(|e| Error::RadioCommand(format!("failed to run iw dev: {e}")))?;
        if !output.status.success() {
            return Err(Error::RadioCommand(format!(
                "iw dev exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_mesh_freq(&text, &self.interface).ok_or_else(|| {
            Error::RadioCommand(format!(
                "no mesh channel found for interface {}",
                self.interface
            ))
        })
    }

    fn switch_freq(&self, freq: u32, bandwidth: u16, beacons: u32) -> Result<()> {
        let ht = format!("HT{bandwidth}");
        let run_cmd = format!(
            "iw dev {} switch freq {freq} {ht} beacons {beacons}",
            self.interface
        );
        log::info!("+run_cmd: {run_cmd}");
        let output = Command::new("iw")
            .args(["dev", self.interface.as_str(), "switch", "freq"])
            .arg(freq.to_string())
            .arg(&ht)
            .arg("beacons")
            .arg(beacons.to_string())
            .output()
            .map_err(|e| Error::RadioCommand(format!("failed to run iw: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::RadioCommand(format!(
                "switch freq command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Extract the mesh frequency of `interface` from `iw dev` output.
///
/// The interface must be in mesh mode and have a `channel` line; all other
/// sections of the output are skipped.
pub(crate) fn parse_mesh_freq(output: &str, interface: &str) -> Option<u32> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Interface ") {
            sections.push(vec![trimmed]);
        } else if let Some(current) = sections.last_mut() {
            current.push(trimmed);
        }
    }

    for section in sections {
        let name = section[0].strip_prefix("Interface ").unwrap_or("").trim();
        if name != interface {
            continue;
        }
        let is_mesh = section
            .iter()
            .any(|line| line.starts_with("type ") && line.contains("mesh"));
        if !is_mesh {
            continue;
        }
        for line in &section {
            // "channel 36 (5180 MHz), width: 20 MHz, center1: 5180 MHz"
            if let Some(rest) = line.strip_prefix("channel ") {
                let freq = rest.split('(').nth(1).and_then(|tail| {
                    let digits: String =
                        tail.chars().take_while(char::is_ascii_digit).collect();
                    digits.parse::<u32>().ok()
                });
                if freq.is_some() {
                    return freq;
                }
            }
        }
    }
    None
}
