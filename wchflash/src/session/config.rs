//! Session configuration.

use crate::error::Operation;
use std::time::Duration;

/// Deadline for each long-running phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Open + identify.
    pub connect: Duration,
    /// Programming.
    pub flash: Duration,
    /// Full erase.
    pub erase: Duration,
    /// Verification.
    pub verify: Duration,
    /// Reset.
    pub reset: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            flash: Duration::from_secs(300),
            erase: Duration::from_secs(60),
            verify: Duration::from_secs(120),
            reset: Duration::from_secs(10),
        }
    }
}

impl Timeouts {
    /// Deadline for an engine operation.
    pub fn for_operation(&self, op: Operation) -> Duration {
        match op {
            Operation::Flash => self.flash,
            Operation::Erase => self.erase,
            Operation::Verify => self.verify,
            Operation::Reset => self.reset,
        }
    }
}

/// What happens to the selected image after a successful flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareRetention {
    /// Keep it selected for the next device.
    #[default]
    Keep,
    /// Drop it; the next flash needs a new selection.
    DiscardAfterFlash,
}

/// Session behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Per-phase deadlines.
    pub timeouts: Timeouts,
    /// Run verify after a successful flash.
    pub verify_after_flash: bool,
    /// Run reset after flash (and verify).
    pub reset_after_flash: bool,
    /// Image retention after a successful flash.
    pub retention: FirmwareRetention,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            verify_after_flash: true,
            reset_after_flash: true,
            retention: FirmwareRetention::Keep,
        }
    }
}
