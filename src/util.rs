//! Sysfs helpers shared between the probe, radio and supervisor code.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Read a sysfs attribute and return its trimmed contents.
pub fn read_sysfs_string(path: &str) -> Result<String> {
    if !Path::new(path).exists() {
        return Err(Error::sysfs(path, "does not exist"));
    }
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::sysfs(path, e))
}

/// Read a sysfs attribute holding a single unsigned counter.
pub fn read_sysfs_u64(path: &str) -> Result<u64> {
    let raw = read_sysfs_string(path)?;
    raw.parse::<u64>()
        .map_err(|e| Error::sysfs(path, format!("not a counter ({raw:?}): {e}")))
}

/// Check whether a network interface is up via
/// `/sys/class/net/<interface>/operstate`.
pub fn interface_operstate(interface: &str) -> bool {
    let path = format!("/sys/class/net/{interface}/operstate");
    match read_sysfs_string(&path) {
        Ok(state) => state.eq_ignore_ascii_case("up"),
        Err(e) => {
            log::warn!("Could not read operstate of {interface}: {e}");
            false
        }
    }
}

/// Read the colon-separated MAC address of a network interface.
pub fn interface_mac(interface: &str) -> Result<String> {
    let path = format!("/sys/class/net/{interface}/address");
    let mac = read_sysfs_string(&path)?;
    if mac.is_empty() {
        return Err(Error::sysfs(&path, "empty MAC address"));
    }
    Ok(mac)
}

/// Kernel interface index, used to pin multicast traffic to one interface.
pub fn interface_index(interface: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{interface}/ifindex");
    let idx = read_sysfs_u64(&path)?;
    u32::try_from(idx).map_err(|_| Error::sysfs(&path, format!("ifindex {idx} out of range")))
}
