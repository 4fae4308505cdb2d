//! Deterministic stand-in engine.
//!
//! Always identifies a CH32V307, tagged as simulated so it is never taken
//! for a verified read. Verify compares against whatever was last flashed.

use super::{EngineGateway, EngineMode, GatewayStats, Handle, HandleSlot, SimulatedFault, SimulationConfig};
use crate::device::{DeviceDescriptor, TransportMode};
use crate::error::Error;
use crate::target::{ChipIdentity, lookup};
use log::{debug, info, warn};
use std::thread;

/// Chip id and device type reported by the simulator (CH32V307VCT6).
pub const SIMULATED_CHIP: (u8, u8) = (0x70, 0x17);

/// Gateway that never touches hardware.
#[derive(Debug)]
pub struct SimulatedGateway {
    config: SimulationConfig,
    initialized: bool,
    next_handle: i32,
    slot: HandleSlot,
    flashed: Option<Vec<u8>>,
    last_error: String,
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl SimulatedGateway {
    /// Create a simulated gateway.
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            initialized: false,
            next_handle: 1,
            slot: HandleSlot::default(),
            flashed: None,
            last_error: String::new(),
        }
    }

    fn fail(&mut self, message: String) {
        warn!("[sim] {message}");
        self.last_error = message;
    }

    fn faulted(&mut self, fault: SimulatedFault, message: &str) -> bool {
        if self.config.fault == Some(fault) {
            self.fail(format!("{message} (injected fault)"));
            true
        } else {
            false
        }
    }

    fn require(&mut self, handle: Handle, what: &str) -> bool {
        if self.slot.is_held(handle) {
            true
        } else {
            self.fail(format!("{what}: {}", Error::HandleInvalid(handle.raw())));
            false
        }
    }

    fn pause(&self) {
        if !self.config.step_delay.is_zero() {
            thread::sleep(self.config.step_delay);
        }
    }
}

impl EngineGateway for SimulatedGateway {
    fn mode(&self) -> EngineMode {
        EngineMode::Simulated
    }

    fn initialize(&mut self) -> bool {
        if !self.initialized {
            info!("Simulated programming engine ready");
            self.initialized = true;
        }
        true
    }

    fn open_device(
        &mut self,
        device: &DeviceDescriptor,
        _vendor_id: u16,
        _product_id: u16,
        transport: TransportMode,
    ) -> Handle {
        if self.slot.take_stale().is_some() {
            self.slot.count_close();
        }
        if self.faulted(SimulatedFault::Open, "Open failed") {
            return Handle::INVALID;
        }
        self.pause();

        let handle = Handle::from_raw(self.next_handle);
        self.next_handle += 1;
        self.slot.adopt(handle);
        info!("[sim] Opened {device} via {transport} as handle {handle}");
        handle
    }

    fn close_device(&mut self, handle: Handle) -> bool {
        if self.slot.release(handle) {
            self.slot.count_close();
            debug!("[sim] Closed handle {handle}");
            true
        } else {
            self.fail(format!("Invalid device handle: {}", handle.raw()));
            false
        }
    }

    fn identify_chip(&mut self, handle: Handle) -> Option<ChipIdentity> {
        if !self.require(handle, "Identify failed") || self.faulted(SimulatedFault::Identify, "Identify failed") {
            return None;
        }
        self.pause();
        let identity = lookup(SIMULATED_CHIP.0, SIMULATED_CHIP.1).simulated();
        info!("[sim] Identified {identity}");
        Some(identity)
    }

    fn flash_firmware(&mut self, handle: Handle, data: &[u8], progress: &mut dyn FnMut(u8)) -> bool {
        if !self.require(handle, "Flash failed") {
            return false;
        }
        let total = data.len();
        let chunk = self.config.chunk_size.max(1);
        let fail_at = (self.config.fault == Some(SimulatedFault::Flash)).then_some(total / 2);

        progress(0);
        let mut written = 0usize;
        let mut last = 0u8;
        while written < total {
            if fail_at.is_some_and(|at| written >= at) {
                self.fail(format!("Flash failed at offset 0x{written:08X} (injected fault)"));
                return false;
            }
            written = (written + chunk).min(total);
            self.pause();
            #[allow(clippy::cast_possible_truncation)] // at most 100
            let pct = (written * 100 / total) as u8;
            if pct > last {
                last = pct;
                progress(pct);
            }
        }
        if last < 100 {
            progress(100);
        }

        self.flashed = Some(data.to_vec());
        info!("[sim] Flashed {total} bytes");
        true
    }

    fn erase_chip(&mut self, handle: Handle) -> bool {
        if !self.require(handle, "Erase failed") || self.faulted(SimulatedFault::Erase, "Erase failed") {
            return false;
        }
        self.pause();
        self.flashed = None;
        info!("[sim] Chip erased");
        true
    }

    fn verify_firmware(&mut self, handle: Handle, data: &[u8]) -> bool {
        if !self.require(handle, "Verify failed") || self.faulted(SimulatedFault::Verify, "Verify failed") {
            return false;
        }
        self.pause();
        if let Some(flashed) = &self.flashed {
            if let Some(offset) = flashed.iter().zip(data).position(|(a, b)| a != b) {
                self.fail(format!("Verify failed: mismatch at offset 0x{offset:08X}"));
                return false;
            }
            if flashed.len() != data.len() {
                let (a, b) = (flashed.len(), data.len());
                self.fail(format!("Verify failed: flashed {a} bytes, expected {b}"));
                return false;
            }
        }
        info!("[sim] Verified {} bytes", data.len());
        true
    }

    fn reset_chip(&mut self, handle: Handle) -> bool {
        if !self.require(handle, "Reset failed") || self.faulted(SimulatedFault::Reset, "Reset failed") {
            return false;
        }
        self.pause();
        info!("[sim] Chip reset");
        true
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
