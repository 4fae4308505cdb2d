//! Hardware-backed gateway.
//!
//! [`NativeEngine`] is the raw boundary to the bootloader protocol
//! implementation. It is fallible in the ordinary Rust way and may even
//! panic. [`HardwareGateway`] wraps it and turns every outcome into the
//! gateway contract.

use super::{EngineGateway, EngineMode, GatewayStats, Handle, HandleSlot};
use crate::device::{DeviceDescriptor, TransportMode};
use crate::error::{Error, Result};
use crate::target::{ChipIdentity, lookup};
use log::{debug, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Raw programming engine.
pub trait NativeEngine: Send {
    /// One-time setup.
    fn init(&mut self) -> Result<()>;

    /// Open the device at `locator`, returning a positive handle.
    ///
    /// A handle may be handed out again once it has been closed.
    fn open(&mut self, locator: &str, vendor_id: u16, product_id: u16, transport: TransportMode) -> Result<i32>;

    /// Release a handle.
    fn close(&mut self, handle: i32) -> Result<()>;

    /// Read the raw `(chip_id, device_type)` pair.
    fn identify(&mut self, handle: i32) -> Result<(u8, u8)>;

    /// Program `data` from the start of code flash. `progress` receives
    /// `(bytes_written, total)`.
    fn flash(&mut self, handle: i32, data: &[u8], progress: &mut dyn FnMut(usize, usize)) -> Result<()>;

    /// Erase the code flash.
    fn erase(&mut self, handle: i32) -> Result<()>;

    /// Compare flash contents against `data`.
    fn verify(&mut self, handle: i32, data: &[u8]) -> Result<()>;

    /// Leave ISP mode and restart.
    fn reset(&mut self, handle: i32) -> Result<()>;
}

/// Produces a [`NativeEngine`], or explains why none is available.
pub trait NativeEngineLoader {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Bind the engine.
    fn load(&self) -> Result<Box<dyn NativeEngine>>;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Gateway over a [`NativeEngine`].
pub struct HardwareGateway {
    engine: Box<dyn NativeEngine>,
    initialized: bool,
    slot: HandleSlot,
    last_error: String,
}

impl HardwareGateway {
    /// Wrap an engine. Call [`initialize`](EngineGateway::initialize) before use.
    pub fn new(engine: Box<dyn NativeEngine>) -> Self {
        Self {
            engine,
            initialized: false,
            slot: HandleSlot::default(),
            last_error: String::new(),
        }
    }

    fn fail(&mut self, message: String) {
        warn!("{message}");
        self.last_error = message;
    }

    /// Run an engine call with failures and panics contained.
    fn guarded<T>(&mut self, what: &str, f: impl FnOnce(&mut dyn NativeEngine) -> Result<T>) -> Option<T> {
        let engine = &mut *self.engine;
        match panic::catch_unwind(AssertUnwindSafe(|| f(engine))) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.fail(format!("{what}: {e}"));
                None
            },
            Err(payload) => {
                self.fail(format!("{what}: engine panicked: {}", panic_message(payload.as_ref())));
                None
            },
        }
    }

    fn require(&mut self, handle: Handle, what: &str) -> bool {
        if !self.initialized {
            self.fail(format!("{what}: engine not initialized"));
            return false;
        }
        if !self.slot.is_held(handle) {
            self.fail(format!("{what}: {}", Error::HandleInvalid(handle.raw())));
            return false;
        }
        true
    }

    fn close_raw(&mut self, handle: Handle) -> bool {
        self.slot.count_close();
        self.guarded("Close failed", |e| e.close(handle.raw())).is_some()
    }
}

impl EngineGateway for HardwareGateway {
    fn mode(&self) -> EngineMode {
        EngineMode::HardwareBacked
    }

    fn initialize(&mut self) -> bool {
        if self.initialized {
            return true;
        }
        if self.guarded("Engine initialization failed", |e| e.init()).is_some() {
            info!("Native programming engine initialized");
            self.initialized = true;
        }
        self.initialized
    }

    fn open_device(
        &mut self,
        device: &DeviceDescriptor,
        vendor_id: u16,
        product_id: u16,
        transport: TransportMode,
    ) -> Handle {
        if !self.initialize() {
            return Handle::INVALID;
        }
        if let Some(stale) = self.slot.take_stale() {
            self.close_raw(stale);
        }

        debug!("Opening {device} via {transport}");
        let locator = device.locator.as_str();
        let Some(raw) = self.guarded("Open failed", |e| e.open(locator, vendor_id, product_id, transport)) else {
            return Handle::INVALID;
        };
        let handle = Handle::from_raw(raw);
        if !handle.is_valid() {
            self.fail(format!("Open failed: engine returned invalid handle {raw}"));
            return Handle::INVALID;
        }
        self.slot.adopt(handle);
        info!("Opened {device} as handle {handle}");
        handle
    }

    fn close_device(&mut self, handle: Handle) -> bool {
        if !self.slot.release(handle) {
            self.fail(format!("Invalid device handle: {}", handle.raw()));
            return false;
        }
        let ok = self.close_raw(handle);
        if ok {
            debug!("Closed handle {handle}");
        }
        ok
    }

    fn identify_chip(&mut self, handle: Handle) -> Option<ChipIdentity> {
        if !self.require(handle, "Identify failed") {
            return None;
        }
        let (chip_id, device_type) = self.guarded("Identify failed", |e| e.identify(handle.raw()))?;
        let identity = lookup(chip_id, device_type);
        info!("Identified {identity}");
        Some(identity)
    }

    fn flash_firmware(&mut self, handle: Handle, data: &[u8], progress: &mut dyn FnMut(u8)) -> bool {
        if !self.require(handle, "Flash failed") {
            return false;
        }
        let mut last = 0u8;
        progress(0);
        let mut report = |written: usize, total: usize| {
            #[allow(clippy::cast_possible_truncation)] // clamped to 100
            let pct = if total == 0 {
                100
            } else {
                (written.min(total) * 100 / total) as u8
            };
            if pct > last {
                last = pct;
                progress(pct);
            }
        };
        let ok = self
            .guarded("Flash failed", |e| e.flash(handle.raw(), data, &mut report))
            .is_some();
        if ok && last < 100 {
            progress(100);
        }
        ok
    }

    fn erase_chip(&mut self, handle: Handle) -> bool {
        self.require(handle, "Erase failed")
            && self.guarded("Erase failed", |e| e.erase(handle.raw())).is_some()
    }

    fn verify_firmware(&mut self, handle: Handle, data: &[u8]) -> bool {
        self.require(handle, "Verify failed")
            && self.guarded("Verify failed", |e| e.verify(handle.raw(), data)).is_some()
    }

    fn reset_chip(&mut self, handle: Handle) -> bool {
        self.require(handle, "Reset failed")
            && self.guarded("Reset failed", |e| e.reset(handle.raw())).is_some()
    }

    fn last_error(&self) -> String {
        if self.last_error.is_empty() {
            "No error".to_string()
        } else {
            self.last_error.clone()
        }
    }

    fn stats(&self) -> GatewayStats {
        self.slot.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine whose identify panics and whose erase errors.
    struct Flaky {
        next: i32,
    }

    impl NativeEngine for Flaky {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }
        fn open(&mut self, _: &str, _: u16, _: u16, _: TransportMode) -> Result<i32> {
            self.next += 1;
            Ok(self.next)
        }
        fn close(&mut self, _: i32) -> Result<()> {
            Ok(())
        }
        fn identify(&mut self, _: i32) -> Result<(u8, u8)> {
            panic!("bootloader went away");
        }
        fn flash(&mut self, _: i32, data: &[u8], progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
            for n in (0..=data.len()).step_by(7) {
                progress(n, data.len());
            }
            Ok(())
        }
        fn erase(&mut self, _: i32) -> Result<()> {
            Err(Error::Engine("sector 3 locked".into()))
        }
        fn verify(&mut self, _: i32, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn reset(&mut self, _: i32) -> Result<()> {
            Ok(())
        }
    }

    fn gateway() -> HardwareGateway {
        let mut gw = HardwareGateway::new(Box::new(Flaky { next: 0 }));
        assert!(gw.initialize());
        gw
    }

    fn device() -> DeviceDescriptor {
        DeviceDescriptor::new(0x4348, 0x55E0, "", "usb:1")
    }

    #[test]
    fn test_panic_is_contained() {
        let mut gw = gateway();
        let h = gw.open_device(&device(), 0x4348, 0x55E0, TransportMode::UsbIsp);
        assert!(h.is_valid());
        assert!(gw.identify_chip(h).is_none());
        assert!(gw.last_error().contains("bootloader went away"));
        // The gateway stays usable.
        assert!(gw.reset_chip(h));
    }

    #[test]
    fn test_engine_error_is_recorded() {
        let mut gw = gateway();
        let h = gw.open_device(&device(), 0x4348, 0x55E0, TransportMode::UsbIsp);
        assert!(!gw.erase_chip(h));
        assert!(gw.last_error().contains("sector 3 locked"));
        assert!(gw.verify_firmware(h, &[1, 2, 3]));
    }

    #[test]
    fn test_progress_is_monotonic_and_complete() {
        let mut gw = gateway();
        let h = gw.open_device(&device(), 0x4348, 0x55E0, TransportMode::UsbIsp);
        let mut seen = Vec::new();
        assert!(gw.flash_firmware(h, &[0u8; 100], &mut |p| seen.push(p)));
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut gw = gateway();
        let h = gw.open_device(&device(), 0x4348, 0x55E0, TransportMode::UsbIsp);
        assert!(gw.close_device(h));
        assert!(!gw.close_device(h));
        assert!(!gw.close_device(h));
        assert!(!gw.close_device(Handle::INVALID));
        assert!(gw.last_error().contains("Invalid device handle"));
        assert_eq!(gw.stats().closes, 1);
    }

    #[test]
    fn test_operations_on_closed_handle_fail() {
        let mut gw = gateway();
        let h = gw.open_device(&device(), 0x4348, 0x55E0, TransportMode::UsbIsp);
        gw.close_device(h);
        assert!(!gw.reset_chip(h));
        assert!(gw.last_error().contains("Invalid connection handle"));
    }

    #[test]
    fn test_last_error_never_empty() {
        let gw = HardwareGateway::new(Box::new(Flaky { next: 0 }));
        assert!(!gw.last_error().is_empty());
    }
}
