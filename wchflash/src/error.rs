//! Error types for wchflash.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for wchflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A long-running engine operation that can fail on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation {
    /// Programming the firmware payload.
    Flash,
    /// Erasing the code flash.
    Erase,
    /// Comparing flash contents against the payload.
    Verify,
    /// Leaving ISP mode and restarting the chip.
    Reset,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash => write!(f, "flash"),
            Self::Erase => write!(f, "erase"),
            Self::Verify => write!(f, "verify"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// Reasons a firmware source is rejected during intake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The extension is not one of `bin`, `hex` or `elf`.
    #[error("Unsupported firmware format: '{0}' (expected .bin, .hex or .elf)")]
    UnsupportedFormat(String),

    /// The source exceeds the hard size limit.
    #[error("Firmware too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Observed size (a lower bound when reading stopped early).
        size: u64,
        /// Hard limit in bytes.
        limit: u64,
    },

    /// The source is shorter than the smallest plausible image.
    #[error("Firmware is empty or truncated: {size} bytes (minimum {min})")]
    Empty {
        /// Observed size.
        size: u64,
        /// Minimum accepted size.
        min: u64,
    },

    /// The content does not decode as the format its extension claims.
    #[error("Malformed {format} image: {reason}")]
    Malformed {
        /// Format name.
        format: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// The source could not be read.
    #[error("Cannot read firmware source '{name}': {reason}")]
    Unreadable {
        /// Display name of the source.
        name: String,
        /// Underlying I/O failure.
        reason: String,
    },
}

/// Error type for wchflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port enumeration error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The user or the host refused access to the device.
    #[error("Permission denied for device {0}")]
    PermissionDenied(String),

    /// The VID/PID pair is not on the allow-list.
    #[error("Unsupported device: VID={vid:04X} PID={pid:04X}")]
    UnsupportedDevice {
        /// USB vendor id.
        vid: u16,
        /// USB product id.
        pid: u16,
    },

    /// The hardware engine could not be bound.
    #[error("Programming engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Open + identify did not finish in time.
    #[error("Connection timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),

    /// A long operation other than connect did not finish in time.
    #[error("{op} timed out after {}s", .timeout.as_secs())]
    OperationTimeout {
        /// Operation that timed out.
        op: Operation,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// The engine refused to open the device.
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    /// The engine could not identify the attached chip.
    #[error("Failed to identify chip: {0}")]
    IdentifyFailed(String),

    /// Firmware intake rejected the source.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A long-running engine operation reported failure.
    #[error("{op} failed: {reason}")]
    OperationFailed {
        /// Operation that failed.
        op: Operation,
        /// Engine-provided reason.
        reason: String,
    },

    /// The connection handle is not (or no longer) valid.
    #[error("Invalid connection handle: {0}")]
    HandleInvalid(i32),

    /// Another long-running operation is still in flight.
    #[error("Another operation is already in progress")]
    Busy,

    /// A command was issued in a state that does not allow it.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// No supported device is attached.
    #[error("No supported device connected")]
    NoDevice,

    /// Flash was requested without a validated image.
    #[error("No validated firmware image selected")]
    NoFirmware,

    /// Raw failure reported by a native engine.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
