//! Configuration file support for wchflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (WCHFLASH_*)
//! 3. Local config file (./wchflash.toml)
//! 4. Global config file (~/.config/wchflash/config.toml)
//!
//! `--config PATH` replaces the search with a single file.

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wchflash::{
    AllowList, EngineConfig, EnginePreference, FirmwareRetention, SessionConfig, SimulatedFault,
    TransportMode,
};

/// Name of the local config file.
pub const LOCAL_CONFIG_FILE: &str = "wchflash.toml";

/// Engine selection and simulator tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSection {
    /// `auto`, `simulated` or `hardware`.
    pub preference: Option<String>,
    /// Simulated delay per progress step, in milliseconds.
    pub step_delay_ms: Option<u64>,
    /// Simulated bytes per progress step.
    pub chunk_size: Option<usize>,
    /// Simulated operation that should fail.
    pub fault: Option<String>,
}

/// Per-phase deadlines, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutSection {
    /// Open + identify.
    pub connect: Option<u64>,
    /// Programming.
    pub flash: Option<u64>,
    /// Full erase.
    pub erase: Option<u64>,
    /// Verification.
    pub verify: Option<u64>,
    /// Reset.
    pub reset: Option<u64>,
}

/// Flash workflow switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashSection {
    /// Verify after flashing.
    pub verify: Option<bool>,
    /// Reset after flashing.
    pub reset: Option<bool>,
    /// `keep` or `discard`.
    pub retention: Option<String>,
}

/// One extra supported device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowedDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// `usb-isp` or `serial`.
    pub transport: String,
    /// Optional label shown in device lists.
    pub label: Option<String>,
}

/// Device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSection {
    /// Extra allow-list entries.
    #[serde(default)]
    pub allow: Vec<AllowedDevice>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineSection,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutSection,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashSection,
    /// Device configuration.
    #[serde(default)]
    pub device: DeviceSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!("Could not load config from {}, using defaults", path.display());
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "wchflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Engine config
        let engine = other.engine;
        self.engine.preference = engine.preference.or(self.engine.preference.take());
        self.engine.step_delay_ms = engine.step_delay_ms.or(self.engine.step_delay_ms);
        self.engine.chunk_size = engine.chunk_size.or(self.engine.chunk_size);
        self.engine.fault = engine.fault.or(self.engine.fault.take());

        // Timeouts
        let timeouts = other.timeouts;
        self.timeouts.connect = timeouts.connect.or(self.timeouts.connect);
        self.timeouts.flash = timeouts.flash.or(self.timeouts.flash);
        self.timeouts.erase = timeouts.erase.or(self.timeouts.erase);
        self.timeouts.verify = timeouts.verify.or(self.timeouts.verify);
        self.timeouts.reset = timeouts.reset.or(self.timeouts.reset);

        // Flash config
        self.flash.verify = other.flash.verify.or(self.flash.verify);
        self.flash.reset = other.flash.reset.or(self.flash.reset);
        self.flash.retention = other.flash.retention.or(self.flash.retention.take());

        // Devices accumulate
        self.device.allow.extend(other.device.allow);
    }

    /// Engine binding parameters.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut engine = EngineConfig::default();
        if let Some(preference) = &self.engine.preference {
            engine.preference = preference.parse::<EnginePreference>()?;
        }
        if let Some(ms) = self.engine.step_delay_ms {
            engine.simulation.step_delay = Duration::from_millis(ms);
        }
        if let Some(chunk) = self.engine.chunk_size {
            if chunk == 0 {
                bail!("engine.chunk_size must be greater than zero");
            }
            engine.simulation.chunk_size = chunk;
        }
        if let Some(fault) = &self.engine.fault {
            engine.simulation.fault = Some(fault.parse::<SimulatedFault>()?);
        }
        Ok(engine)
    }

    /// Session behaviour.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut session = SessionConfig::default();
        let t = &self.timeouts;
        let slots = [
            (t.connect, &mut session.timeouts.connect),
            (t.flash, &mut session.timeouts.flash),
            (t.erase, &mut session.timeouts.erase),
            (t.verify, &mut session.timeouts.verify),
            (t.reset, &mut session.timeouts.reset),
        ];
        for (secs, slot) in slots {
            if let Some(secs) = secs {
                if secs == 0 {
                    bail!("timeouts must be at least one second");
                }
                *slot = Duration::from_secs(secs);
            }
        }

        if let Some(verify) = self.flash.verify {
            session.verify_after_flash = verify;
        }
        if let Some(reset) = self.flash.reset {
            session.reset_after_flash = reset;
        }
        if let Some(retention) = &self.flash.retention {
            session.retention = match retention.to_lowercase().as_str() {
                "keep" => FirmwareRetention::Keep,
                "discard" | "discard-after-flash" => FirmwareRetention::DiscardAfterFlash,
                other => bail!("unknown flash.retention '{other}' (expected keep or discard)"),
            };
        }
        Ok(session)
    }

    /// Built-in allow-list plus the configured extra devices.
    pub fn allow_list(&self) -> Result<AllowList> {
        let mut allow = AllowList::default();
        for device in &self.device.allow {
            let transport = TransportMode::from_name(&device.transport).with_context(|| {
                format!(
                    "device {:04X}:{:04X}: unknown transport '{}'",
                    device.vid, device.pid, device.transport
                )
            })?;
            let label = device.label.as_deref().unwrap_or("user-configured device");
            allow.insert(device.vid, device.pid, transport, label);
        }
        Ok(allow)
    }
}
