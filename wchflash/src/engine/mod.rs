//! The programming engine boundary.
//!
//! Every call site in the session talks to an [`EngineGateway`]. There are
//! two implementations:
//!
//! - [`HardwareGateway`](native::HardwareGateway) delegates to a
//!   [`NativeEngine`](native::NativeEngine), the component that speaks the
//!   bootloader protocol.
//! - [`SimulatedGateway`](simulated::SimulatedGateway) returns deterministic
//!   canned results and never touches hardware.
//!
//! Which one is used is decided once by [`bind_engine`] and recorded as an
//! [`EngineMode`]. Gateway methods never panic and never return
//! [`Error`](crate::Error): failures come back as `false`, [`Handle::INVALID`]
//! or `None`, with the reason available from
//! [`last_error`](EngineGateway::last_error).

pub mod native;
pub mod simulated;

use crate::device::{DeviceDescriptor, TransportMode};
use crate::error::{Error, Result};
use crate::target::ChipIdentity;
use log::{debug, info, warn};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use native::{HardwareGateway, NativeEngine, NativeEngineLoader};
pub use simulated::SimulatedGateway;

/// Opaque connection token issued by a gateway.
///
/// Valid handles are positive. [`Handle::INVALID`] stands for "no device open".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i32);

impl Handle {
    /// The "no connection" sentinel.
    pub const INVALID: Handle = Handle(-1);

    /// Wrap a raw value. Non-positive values are all treated as invalid.
    pub fn from_raw(raw: i32) -> Self {
        if raw > 0 { Self(raw) } else { Self::INVALID }
    }

    /// Raw value.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Whether this is a real connection token.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// Which implementation is behind the gateway.
///
/// Only affects log messages; both modes honour the same contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EngineMode {
    /// A native engine is driving real hardware.
    HardwareBacked,
    /// Deterministic stand-in, no hardware involved.
    Simulated,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareBacked => write!(f, "hardware"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// What [`bind_engine`] should try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EnginePreference {
    /// Use the hardware engine when it binds, otherwise fall back.
    #[default]
    Auto,
    /// Always use the simulated engine.
    Simulated,
    /// Require the hardware engine.
    Hardware,
}

impl FromStr for EnginePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "simulated" | "simulate" | "sim" => Ok(Self::Simulated),
            "hardware" | "native" => Ok(Self::Hardware),
            other => Err(Error::Config(format!(
                "unknown engine '{other}' (expected auto, simulated or hardware)"
            ))),
        }
    }
}

/// Gateway operation a simulated fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedFault {
    /// `open_device` returns the invalid sentinel.
    Open,
    /// `identify_chip` returns `None`.
    Identify,
    /// `flash_firmware` fails half way.
    Flash,
    /// `erase_chip` fails.
    Erase,
    /// `verify_firmware` reports a mismatch.
    Verify,
    /// `reset_chip` fails.
    Reset,
}

impl FromStr for SimulatedFault {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "identify" => Ok(Self::Identify),
            "flash" => Ok(Self::Flash),
            "erase" => Ok(Self::Erase),
            "verify" => Ok(Self::Verify),
            "reset" => Ok(Self::Reset),
            other => Err(Error::Config(format!("unknown simulated fault '{other}'"))),
        }
    }
}

/// Behaviour of the simulated engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Delay per progress step and per discrete operation.
    pub step_delay: Duration,
    /// Bytes per reported flash step.
    pub chunk_size: usize,
    /// Operation that should fail, if any.
    pub fault: Option<SimulatedFault>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(20),
            chunk_size: 4096,
            fault: None,
        }
    }
}

impl SimulationConfig {
    /// No delays at all, for tests.
    pub fn instant() -> Self {
        Self {
            step_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Engine selection, injected at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Which engine to try.
    pub preference: EnginePreference,
    /// Simulated engine behaviour.
    pub simulation: SimulationConfig,
}

/// Open/close bookkeeping of a gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Handles successfully issued.
    pub opens: u32,
    /// Handles closed, explicitly or implicitly.
    pub closes: u32,
    /// Closes forced by an `open_device` while a handle was still held.
    pub implicit_closes: u32,
}

/// The nine engine operations.
///
/// Implementations catch every underlying failure. A failed call leaves the
/// gateway usable for the next one.
pub trait EngineGateway: Send {
    /// Which implementation this is.
    fn mode(&self) -> EngineMode;

    /// Prepare the engine. Idempotent.
    fn initialize(&mut self) -> bool;

    /// Open a device. Any handle still held is closed first.
    ///
    /// Returns [`Handle::INVALID`] on failure.
    fn open_device(
        &mut self,
        device: &DeviceDescriptor,
        vendor_id: u16,
        product_id: u16,
        transport: TransportMode,
    ) -> Handle;

    /// Close a handle. Safe with invalid or already-closed handles, which
    /// return `false`.
    fn close_device(&mut self, handle: Handle) -> bool;

    /// Read the chip identity.
    fn identify_chip(&mut self, handle: Handle) -> Option<ChipIdentity>;

    /// Program `data`, reporting percentages through `progress`.
    fn flash_firmware(&mut self, handle: Handle, data: &[u8], progress: &mut dyn FnMut(u8)) -> bool;

    /// Erase the code flash.
    fn erase_chip(&mut self, handle: Handle) -> bool;

    /// Compare flash contents against `data`.
    fn verify_firmware(&mut self, handle: Handle, data: &[u8]) -> bool;

    /// Leave the bootloader and restart the chip.
    fn reset_chip(&mut self, handle: Handle) -> bool;

    /// Reason for the most recent failure. Never empty.
    fn last_error(&self) -> String;

    /// Open/close counters.
    fn stats(&self) -> GatewayStats;
}

/// Tracks the single live handle of a gateway.
#[derive(Debug, Default)]
pub(crate) struct HandleSlot {
    held: Option<Handle>,
    stats: GatewayStats,
}

impl HandleSlot {
    /// Take the handle that must be closed before a new open.
    pub(crate) fn take_stale(&mut self) -> Option<Handle> {
        let stale = self.held.take();
        if let Some(h) = stale {
            warn!("Handle {h} still open, closing it before opening a new one");
            self.stats.implicit_closes += 1;
        }
        stale
    }

    pub(crate) fn adopt(&mut self, handle: Handle) {
        debug_assert!(self.held.is_none());
        self.held = Some(handle);
        self.stats.opens += 1;
    }

    /// Release `handle` if it is the one held.
    pub(crate) fn release(&mut self, handle: Handle) -> bool {
        if handle.is_valid() && self.held == Some(handle) {
            self.held = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn count_close(&mut self) {
        self.stats.closes += 1;
    }

    pub(crate) fn is_held(&self, handle: Handle) -> bool {
        handle.is_valid() && self.held == Some(handle)
    }

    pub(crate) fn stats(&self) -> GatewayStats {
        self.stats
    }
}

/// Pick and initialize the gateway. Runs once at startup.
///
/// With [`EnginePreference::Auto`], any failure to bind the hardware engine
/// is logged and the simulated gateway is returned instead. With
/// [`EnginePreference::Hardware`] the failure is returned as
/// [`Error::EngineUnavailable`].
pub fn bind_engine(
    config: &EngineConfig,
    loader: Option<&dyn NativeEngineLoader>,
) -> Result<(Box<dyn EngineGateway>, EngineMode)> {
    let simulated = || -> (Box<dyn EngineGateway>, EngineMode) {
        let mut gw = SimulatedGateway::new(config.simulation.clone());
        gw.initialize();
        (Box::new(gw), EngineMode::Simulated)
    };

    if config.preference == EnginePreference::Simulated {
        info!("Using simulated programming engine");
        return Ok(simulated());
    }

    let bound = match loader {
        None => Err(Error::EngineUnavailable("no native engine available".into())),
        Some(loader) => loader
            .load()
            .map_err(|e| Error::EngineUnavailable(format!("{}: {e}", loader.name())))
            .and_then(|engine| {
                let mut gw = HardwareGateway::new(engine);
                if gw.initialize() {
                    Ok(gw)
                } else {
                    Err(Error::EngineUnavailable(gw.last_error()))
                }
            }),
    };

    match bound {
        Ok(gw) => {
            info!("Using hardware programming engine");
            Ok((Box::new(gw), EngineMode::HardwareBacked))
        },
        Err(e) if config.preference == EnginePreference::Hardware => Err(e),
        Err(e) => {
            warn!("{e}; falling back to simulated mode");
            debug!("Simulated engine settings: {:?}", config.simulation);
            Ok(simulated())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_validity() {
        assert!(!Handle::INVALID.is_valid());
        assert!(!Handle::from_raw(0).is_valid());
        assert_eq!(Handle::from_raw(-7), Handle::INVALID);
        assert!(Handle::from_raw(3).is_valid());
        assert_eq!(Handle::default(), Handle::INVALID);
        assert_eq!(Handle::from_raw(3).to_string(), "#3");
    }

    #[test]
    fn test_preference_from_str() {
        assert_eq!("AUTO".parse::<EnginePreference>().unwrap(), EnginePreference::Auto);
        assert_eq!("sim".parse::<EnginePreference>().unwrap(), EnginePreference::Simulated);
        assert_eq!("native".parse::<EnginePreference>().unwrap(), EnginePreference::Hardware);
        assert!("usb".parse::<EnginePreference>().is_err());
    }

    #[test]
    fn test_handle_slot() {
        let mut slot = HandleSlot::default();
        assert!(slot.take_stale().is_none());
        slot.adopt(Handle::from_raw(1));
        assert!(slot.is_held(Handle::from_raw(1)));
        assert_eq!(slot.take_stale(), Some(Handle::from_raw(1)));
        assert_eq!(slot.stats().implicit_closes, 1);
        slot.adopt(Handle::from_raw(2));
        assert!(!slot.release(Handle::from_raw(1)));
        assert!(slot.release(Handle::from_raw(2)));
        assert!(!slot.release(Handle::from_raw(2)));
        assert!(!slot.release(Handle::INVALID));
    }

    #[test]
    fn test_bind_without_loader_falls_back() {
        let (gw, mode) = bind_engine(&EngineConfig::default(), None).unwrap();
        assert_eq!(mode, EngineMode::Simulated);
        assert_eq!(gw.mode(), EngineMode::Simulated);
    }

    #[test]
    fn test_bind_hardware_required_fails() {
        let config = EngineConfig {
            preference: EnginePreference::Hardware,
            ..EngineConfig::default()
        };
        let err = bind_engine(&config, None).err().unwrap();
        assert!(matches!(err, Error::EngineUnavailable(_)));
    }
}
