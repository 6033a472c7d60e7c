//! Error kinds shared across the daemon.
//!
//! Only configuration errors are fatal; everything else is logged at the
//! point of failure and the surrounding loop keeps running.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket create/bind/send/recv failures on a control-channel interface.
    #[error("transport error on {interface}: {source}")]
    Transport {
        interface: String,
        #[source]
        source: io::Error,
    },

    /// Malformed frame on the wire (non-UTF-8 or non-JSON payload).
    #[error("decode error: {0}")]
    Decode(String),

    /// The channel-switch subprocess failed or reported a non-zero exit.
    #[error("radio command failed: {0}")]
    RadioCommand(String),

    /// The spectral scan or the external analyser failed.
    #[error("channel scan failed: {0}")]
    Scan(String),

    /// A sysfs statistics or state file could not be read.
    #[error("sysfs read failed for {path}: {reason}")]
    SysfsRead { path: String, reason: String },

    /// Configuration could not be loaded or is invalid. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn transport(interface: &str, source: io::Error) -> Self {
        Error::Transport {
            interface: interface.to_string(),
            source,
        }
    }

    pub fn sysfs(path: &str, reason: impl ToString) -> Self {
        Error::SysfsRead {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
