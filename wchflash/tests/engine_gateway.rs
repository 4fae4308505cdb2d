//! Gateway contract tests against a scripted native engine and the simulator.

use std::sync::{Arc, Mutex};
use wchflash::{
    DeviceDescriptor, EngineConfig, EngineGateway, EngineMode, EnginePreference, Error, Handle,
    HardwareGateway, NativeEngine, NativeEngineLoader, Result, SimulatedGateway, SimulationConfig,
    TransportMode, bind_engine,
};

/// Engine that records every call in a shared journal.
struct Journaled {
    journal: Arc<Mutex<Vec<String>>>,
    next: i32,
    chip: (u8, u8),
}

impl Journaled {
    fn new(chip: (u8, u8)) -> (Self, Arc<Mutex<Vec<String>>>) {
        let journal = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                journal: Arc::clone(&journal),
                next: 0,
                chip,
            },
            journal,
        )
    }

    fn note(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }
}

impl NativeEngine for Journaled {
    fn init(&mut self) -> Result<()> {
        self.note("init".into());
        Ok(())
    }

    fn open(&mut self, locator: &str, _: u16, _: u16, _: TransportMode) -> Result<i32> {
        self.next += 1;
        self.note(format!("open {locator} -> {}", self.next));
        Ok(self.next)
    }

    fn close(&mut self, handle: i32) -> Result<()> {
        self.note(format!("close {handle}"));
        Ok(())
    }

    fn identify(&mut self, _: i32) -> Result<(u8, u8)> {
        Ok(self.chip)
    }

    fn flash(&mut self, _: i32, data: &[u8], progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
        progress(data.len(), data.len());
        Ok(())
    }

    fn erase(&mut self, _: i32) -> Result<()> {
        Ok(())
    }

    fn verify(&mut self, _: i32, _: &[u8]) -> Result<()> {
        Err(Error::Engine("readback differs at 0x0000".into()))
    }

    fn reset(&mut self, _: i32) -> Result<()> {
        Ok(())
    }
}

fn isp() -> DeviceDescriptor {
    DeviceDescriptor::new(0x4348, 0x55E0, "USB Module", "usb:1-4")
}

fn open(gw: &mut dyn EngineGateway) -> Handle {
    gw.open_device(&isp(), 0x4348, 0x55E0, TransportMode::UsbIsp)
}

#[test]
fn test_second_open_closes_first_handle() {
    let (engine, journal) = Journaled::new((0x70, 0x17));
    let mut gw = HardwareGateway::new(Box::new(engine));
    assert!(gw.initialize());

    let first = open(&mut gw);
    let second = open(&mut gw);
    assert!(first.is_valid());
    assert!(second.is_valid());
    assert_ne!(first, second);

    assert_eq!(
        journal.lock().unwrap().as_slice(),
        ["init", "open usb:1-4 -> 1", "close 1", "open usb:1-4 -> 2"]
    );
    let stats = gw.stats();
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.implicit_closes, 1);
}

#[test]
fn test_simulated_second_open_closes_first_handle() {
    let mut gw = SimulatedGateway::new(SimulationConfig::instant());
    gw.initialize();
    let first = open(&mut gw);
    let _second = open(&mut gw);
    assert_eq!(gw.stats().closes, 1);
    assert!(!gw.close_device(first));
}

#[test]
fn test_close_device_is_idempotent() {
    let (engine, journal) = Journaled::new((0x70, 0x17));
    let mut gw = HardwareGateway::new(Box::new(engine));
    gw.initialize();
    let h = open(&mut gw);

    assert!(gw.close_device(h));
    assert!(!gw.close_device(h));
    assert!(!gw.close_device(h));
    let closes = journal
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with("close"))
        .count();
    assert_eq!(closes, 1);
    assert!(!gw.last_error().is_empty());
}

#[test]
fn test_identify_round_trip_through_chip_table() {
    for def in wchflash::target::chips() {
        let (engine, _) = Journaled::new((def.chip_id, def.device_type));
        let mut gw = HardwareGateway::new(Box::new(engine));
        gw.initialize();
        let h = open(&mut gw);
        let id = gw.identify_chip(h).unwrap();
        assert_eq!(id, wchflash::ChipIdentity::from_def(def));
    }
}

#[test]
fn test_identify_unknown_pair() {
    let (engine, _) = Journaled::new((0x12, 0x34));
    let mut gw = HardwareGateway::new(Box::new(engine));
    gw.initialize();
    let h = open(&mut gw);
    let id = gw.identify_chip(h).unwrap();
    assert_eq!(id.to_string(), "Unknown[0x1234]");
}

#[test]
fn test_failed_verify_does_not_block_reset() {
    let (engine, _) = Journaled::new((0x70, 0x17));
    let mut gw = HardwareGateway::new(Box::new(engine));
    gw.initialize();
    let h = open(&mut gw);
    assert!(gw.flash_firmware(h, &[0u8; 64], &mut |_| {}));
    assert!(!gw.verify_firmware(h, &[0u8; 64]));
    assert!(gw.last_error().contains("readback differs"));
    assert!(gw.reset_chip(h));
}

#[test]
fn test_simulated_mode_contract() {
    let config = EngineConfig {
        preference: EnginePreference::Simulated,
        simulation: SimulationConfig::instant(),
    };
    let (mut gw, mode) = bind_engine(&config, None).unwrap();
    assert_eq!(mode, EngineMode::Simulated);
    let h = open(gw.as_mut());
    let id = gw.identify_chip(h).unwrap();
    assert!(id.to_string().contains("(simulated)"));
    assert!(gw.flash_firmware(h, &[0xAB; 256], &mut |_| {}));
}

struct Loader {
    available: bool,
}

impl NativeEngineLoader for Loader {
    fn name(&self) -> &str {
        "test-engine"
    }

    fn load(&self) -> Result<Box<dyn NativeEngine>> {
        if self.available {
            Ok(Box::new(Journaled::new((0x70, 0x17)).0))
        } else {
            Err(Error::Engine("library not found".into()))
        }
    }
}

#[test]
fn test_bind_prefers_hardware_when_available() {
    let (gw, mode) = bind_engine(&EngineConfig::default(), Some(&Loader { available: true })).unwrap();
    assert_eq!(mode, EngineMode::HardwareBacked);
    assert_eq!(gw.mode(), EngineMode::HardwareBacked);
}

#[test]
fn test_bind_auto_falls_back_to_simulated() {
    let (gw, mode) = bind_engine(&EngineConfig::default(), Some(&Loader { available: false })).unwrap();
    assert_eq!(mode, EngineMode::Simulated);
    assert_eq!(gw.mode(), EngineMode::Simulated);
}

#[test]
fn test_bind_hardware_reports_unavailable() {
    let config = EngineConfig {
        preference: EnginePreference::Hardware,
        ..EngineConfig::default()
    };
    let err = bind_engine(&config, Some(&Loader { available: false })).err().unwrap();
    assert!(matches!(err, Error::EngineUnavailable(ref m) if m.contains("library not found")));
}
