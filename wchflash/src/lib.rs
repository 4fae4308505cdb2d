//! # wchflash
//!
//! Connection and flashing orchestration for WCH microcontrollers.
//!
//! This crate drives a WCH chip through connect, identify, erase, flash,
//! verify and reset over USB. It owns:
//!
//! - the supported-device allow-list and the device registry
//! - the engine gateway, backed either by a native programming engine or by a
//!   deterministic simulator
//! - the session state machine and its observers
//! - firmware intake for `.bin`, `.hex` and `.elf` images
//! - the scheduler that runs long engine calls with deadlines
//!
//! The bootloader wire protocol itself lives behind the
//! [`NativeEngine`](engine::NativeEngine) trait.
//!
//! ## Features
//!
//! - `native` (default): host device discovery via `nusb` and `serialport`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use wchflash::{DeviceDescriptor, DeviceEvent, EngineConfig, FileSource, FlashSession, SessionState};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (gateway, _mode) = wchflash::bind_engine(&EngineConfig::default(), None)?;
//!     let session = FlashSession::with_defaults(gateway);
//!
//!     session.select_firmware(&FileSource::new("blinky.hex"))?;
//!     session.handle_event(&DeviceEvent::Attached(DeviceDescriptor::new(
//!         0x4348, 0x55E0, "", "usb:1-4",
//!     )));
//!
//!     session.wait_for(Duration::from_secs(30), SessionState::is_ready);
//!     session.flash()?;
//!     session.wait_for(Duration::from_secs(300), |s| !s.is_working());
//!     println!("{}", session.state());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod engine;
pub mod error;
pub mod image;
pub mod scheduler;
pub mod session;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use device::watch::{DeviceWatcher, enumerate_devices};
pub use {
    device::{
        AllowEntry, AllowList, DeviceDescriptor, DeviceEvent, DeviceIdentity, TransportMode,
        is_supported,
        registry::{DeviceRegistry, ImplicitPermission, PermissionBroker},
    },
    engine::{
        EngineConfig, EngineGateway, EngineMode, EnginePreference, GatewayStats, Handle,
        HardwareGateway, NativeEngine, NativeEngineLoader, SimulatedFault, SimulatedGateway,
        SimulationConfig, bind_engine,
    },
    error::{Error, Operation, Result, ValidationError},
    image::{
        FileSource, FirmwareFormat, FirmwareImage, FirmwareSource, MemorySource, Validated,
        ValidationWarning, select,
    },
    scheduler::{Outcome, Scheduler},
    session::{
        Failure, FailureKind, FirmwareRetention, FlashSession, LogLevel, LogLine, SessionConfig,
        SessionEvent, SessionObserver, SessionState, Timeouts,
    },
    target::{ChipIdentity, lookup},
};
