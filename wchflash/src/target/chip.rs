//! Chip identities and the WCH chip table.
//!
//! The bootloader reports a `(chip_id, device_type)` pair during
//! identification. This module maps that pair to the metadata the session
//! needs to display and sanity-check the target. Pairs missing from the
//! table resolve to an `Unknown[0x....]` identity instead of an error.

use std::fmt;

/// Where an identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IdentitySource {
    /// Read from a real bootloader.
    #[default]
    Device,
    /// Produced by the simulated engine; never a verified read.
    Simulated,
}

/// Static description of one chip model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipDef {
    /// Model name.
    pub name: &'static str,
    /// Chip id byte reported by the bootloader.
    pub chip_id: u8,
    /// Device type (series) byte reported by the bootloader.
    pub device_type: u8,
    /// Code flash size in bytes.
    pub flash_size: u32,
    /// Whether the bootloader scrambles ISP payloads with a session key.
    pub supports_encryption: bool,
}

const KIB: u32 = 1024;

/// Known chips, grouped by series.
const CHIPS: &[ChipDef] = &[
    // CH55x (8051, device type 0x11)
    ChipDef { name: "CH551", chip_id: 0x51, device_type: 0x11, flash_size: 10 * KIB, supports_encryption: false },
    ChipDef { name: "CH552", chip_id: 0x52, device_type: 0x11, flash_size: 16 * KIB, supports_encryption: false },
    ChipDef { name: "CH554", chip_id: 0x54, device_type: 0x11, flash_size: 16 * KIB, supports_encryption: false },
    ChipDef { name: "CH549", chip_id: 0x49, device_type: 0x11, flash_size: 64 * KIB, supports_encryption: false },
    ChipDef { name: "CH559", chip_id: 0x59, device_type: 0x11, flash_size: 64 * KIB, supports_encryption: false },
    // CH32F103 (Cortex-M3, device type 0x14)
    ChipDef { name: "CH32F103C8T6", chip_id: 0x33, device_type: 0x14, flash_size: 64 * KIB, supports_encryption: true },
    // CH32V103 (RISC-V, device type 0x15)
    ChipDef { name: "CH32V103C8T6", chip_id: 0x3F, device_type: 0x15, flash_size: 64 * KIB, supports_encryption: true },
    // CH58x (RISC-V BLE, device type 0x16)
    ChipDef { name: "CH581", chip_id: 0x81, device_type: 0x16, flash_size: 192 * KIB, supports_encryption: true },
    ChipDef { name: "CH582", chip_id: 0x82, device_type: 0x16, flash_size: 448 * KIB, supports_encryption: true },
    ChipDef { name: "CH583", chip_id: 0x83, device_type: 0x16, flash_size: 448 * KIB, supports_encryption: true },
    // CH32V30x (RISC-V, device type 0x17)
    ChipDef { name: "CH32V303VCT6", chip_id: 0x30, device_type: 0x17, flash_size: 256 * KIB, supports_encryption: true },
    ChipDef { name: "CH32V305RBT6", chip_id: 0x50, device_type: 0x17, flash_size: 128 * KIB, supports_encryption: true },
    ChipDef { name: "CH32V307VCT6", chip_id: 0x70, device_type: 0x17, flash_size: 256 * KIB, supports_encryption: true },
    // CH32V20x (RISC-V, device type 0x19)
    ChipDef { name: "CH32V203C8T6", chip_id: 0x30, device_type: 0x19, flash_size: 64 * KIB, supports_encryption: true },
    ChipDef { name: "CH32V208WBU6", chip_id: 0x80, device_type: 0x19, flash_size: 128 * KIB, supports_encryption: true },
    // CH32V00x (RISC-V, device type 0x21)
    ChipDef { name: "CH32V003F4P6", chip_id: 0x30, device_type: 0x21, flash_size: 16 * KIB, supports_encryption: true },
    // CH32X03x (RISC-V, device type 0x23)
    ChipDef { name: "CH32X035R8T6", chip_id: 0x50, device_type: 0x23, flash_size: 62 * KIB, supports_encryption: true },
];

/// All chips in the table.
pub fn chips() -> &'static [ChipDef] {
    CHIPS
}

/// Find the table entry for a `(chip_id, device_type)` pair.
pub fn find_chip(chip_id: u8, device_type: u8) -> Option<&'static ChipDef> {
    CHIPS
        .iter()
        .find(|c| c.chip_id == chip_id && c.device_type == device_type)
}

/// Resolve a `(chip_id, device_type)` pair. Never fails.
pub fn lookup(chip_id: u8, device_type: u8) -> ChipIdentity {
    find_chip(chip_id, device_type).map_or_else(
        || ChipIdentity::unknown(chip_id, device_type),
        ChipIdentity::from_def,
    )
}

/// Identity of the attached chip.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChipIdentity {
    /// Chip id byte.
    pub chip_id: u8,
    /// Device type byte.
    pub device_type: u8,
    /// Model name, `Unknown` for pairs missing from the table.
    pub family_name: String,
    /// Code flash size in bytes (0 when unknown).
    pub flash_size_bytes: u32,
    /// Whether ISP payloads are scrambled.
    pub supports_encryption: bool,
    /// Whether this came from hardware or the simulator.
    pub source: IdentitySource,
}

impl ChipIdentity {
    /// Identity for a table entry.
    pub fn from_def(def: &ChipDef) -> Self {
        Self {
            chip_id: def.chip_id,
            device_type: def.device_type,
            family_name: def.name.to_string(),
            flash_size_bytes: def.flash_size,
            supports_encryption: def.supports_encryption,
            source: IdentitySource::Device,
        }
    }

    /// Identity for a pair missing from the table.
    pub fn unknown(chip_id: u8, device_type: u8) -> Self {
        Self {
            chip_id,
            device_type,
            family_name: "Unknown".to_string(),
            flash_size_bytes: 0,
            supports_encryption: false,
            source: IdentitySource::Device,
        }
    }

    /// Mark the identity as produced by the simulator.
    #[must_use]
    pub fn simulated(mut self) -> Self {
        self.source = IdentitySource::Simulated;
        self
    }

    /// The combined `chip_id << 8 | device_type` code.
    pub fn id_code(&self) -> u16 {
        (u16::from(self.chip_id) << 8) | u16::from(self.device_type)
    }

    /// Whether the pair was found in the chip table.
    pub fn is_known(&self) -> bool {
        find_chip(self.chip_id, self.device_type).is_some()
    }

    /// Whether the identity is a simulator stand-in.
    pub fn is_simulated(&self) -> bool {
        self.source == IdentitySource::Simulated
    }

    /// Whether an image of `size` bytes fits in code flash.
    ///
    /// Unknown chips accept any size since their capacity is not known.
    pub fn fits(&self, size: usize) -> bool {
        self.flash_size_bytes == 0 || size <= self.flash_size_bytes as usize
    }
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[0x{:04x}]", self.family_name, self.id_code())?;
        if self.is_simulated() {
            write!(f, " (simulated)")?;
        }
        Ok(())
    }
}
