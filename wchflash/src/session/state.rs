//! Session states and failures.

use crate::error::{Error, Operation};
use crate::target::ChipIdentity;
use std::fmt;

/// Category of a session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureKind {
    /// The host refused device access.
    PermissionDenied,
    /// The device is not on the allow-list.
    UnsupportedDevice,
    /// The hardware engine is missing.
    EngineUnavailable,
    /// Open + identify exceeded the connect deadline.
    ConnectTimeout,
    /// The engine could not open the device.
    OpenFailed,
    /// The engine could not identify the chip.
    IdentifyFailed,
    /// An engine operation reported failure.
    OperationFailed(Operation),
    /// An engine operation exceeded its deadline.
    OperationTimeout(Operation),
    /// The connection handle was not valid.
    HandleInvalid,
    /// Anything else (a worker that died, a thread that could not start).
    Internal,
}

/// Why the session is in [`SessionState::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Failure {
    /// Category.
    pub kind: FailureKind,
    /// Human-readable explanation.
    pub detail: String,
}

impl Failure {
    /// Build a failure.
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Classify an error.
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::PermissionDenied(_) => FailureKind::PermissionDenied,
            Error::UnsupportedDevice { .. } => FailureKind::UnsupportedDevice,
            Error::EngineUnavailable(_) => FailureKind::EngineUnavailable,
            Error::ConnectTimeout(_) => FailureKind::ConnectTimeout,
            Error::OpenFailed(_) => FailureKind::OpenFailed,
            Error::IdentifyFailed(_) => FailureKind::IdentifyFailed,
            Error::OperationFailed { op, .. } => FailureKind::OperationFailed(*op),
            Error::OperationTimeout { op, .. } => FailureKind::OperationTimeout(*op),
            Error::HandleInvalid(_) => FailureKind::HandleInvalid,
            _ => FailureKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// State of the flashing session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// No device is connected.
    #[default]
    Disconnected,
    /// Waiting for the host to grant device access.
    RequestingPermission,
    /// Opening and identifying the device.
    Connecting,
    /// Connected and identified; ready for flash or erase.
    Identified(ChipIdentity),
    /// Programming, with percentage done.
    Flashing {
        /// 0 to 100.
        progress: u8,
    },
    /// Erasing the code flash.
    Erasing,
    /// Comparing flash contents.
    Verifying,
    /// Restarting the chip.
    Resetting,
    /// A step failed; a fresh connect is needed.
    Error(Failure),
}

impl SessionState {
    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::RequestingPermission => "requesting-permission",
            Self::Connecting => "connecting",
            Self::Identified(_) => "identified",
            Self::Flashing { .. } => "flashing",
            Self::Erasing => "erasing",
            Self::Verifying => "verifying",
            Self::Resetting => "resetting",
            Self::Error(_) => "error",
        }
    }

    /// Whether flash or erase may be started.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Identified(_))
    }

    /// Whether a long-running engine operation owns the session.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Flashing { .. } | Self::Erasing | Self::Verifying | Self::Resetting
        )
    }

    /// The identified chip, in the `Identified` state.
    pub fn chip(&self) -> Option<&ChipIdentity> {
        match self {
            Self::Identified(chip) => Some(chip),
            _ => None,
        }
    }

    /// The failure, in the `Error` state.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Error(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::RequestingPermission => write!(f, "Requesting permission"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Identified(chip) => write!(f, "Ready: {chip}"),
            Self::Flashing { progress } => write!(f, "Flashing {progress}%"),
            Self::Erasing => write!(f, "Erasing"),
            Self::Verifying => write!(f, "Verifying"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Error(failure) => write!(f, "Error: {failure}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::lookup;
    use std::time::Duration;

    #[test]
    fn test_failure_classification() {
        let f = Failure::from_error(&Error::ConnectTimeout(Duration::from_secs(30)));
        assert_eq!(f.kind, FailureKind::ConnectTimeout);
        assert_eq!(f.detail, "Connection timed out after 30s");

        let f = Failure::from_error(&Error::OperationFailed {
            op: Operation::Verify,
            reason: "mismatch".into(),
        });
        assert_eq!(f.kind, FailureKind::OperationFailed(Operation::Verify));
        assert_eq!(f.to_string(), "verify failed: mismatch");

        assert_eq!(Failure::from_error(&Error::Busy).kind, FailureKind::Internal);
    }

    #[test]
    fn test_state_queries() {
        let ready = SessionState::Identified(lookup(0x70, 0x17));
        assert!(ready.is_ready());
        assert!(!ready.is_working());
        assert_eq!(ready.chip().map(|c| c.chip_id), Some(0x70));
        assert!(SessionState::Flashing { progress: 40 }.is_working());
        assert_eq!(SessionState::Flashing { progress: 40 }.to_string(), "Flashing 40%");
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }
}
