//! Firmware intake: format selection, size limits and decoding.
//!
//! Intake is local and synchronous. It never touches a device.

use super::{FirmwareFormat, FirmwareImage, FirmwareSource, anchor_at_flash_start, elf, extension_of, ihex};
use crate::error::ValidationError;
use log::{debug, warn};
use std::fmt;
use std::io::Read;

/// Smallest accepted source, in bytes.
pub const MIN_FIRMWARE_SIZE: u64 = 32;

/// Sources above this size are accepted with a warning.
pub const LARGE_FIRMWARE_SIZE: u64 = 1024 * 1024;

/// Sources above this size are rejected.
pub const MAX_FIRMWARE_SIZE: u64 = 2 * 1024 * 1024;

/// Non-fatal findings attached to an accepted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// The source is above [`LARGE_FIRMWARE_SIZE`].
    LargeFile {
        /// Source size in bytes.
        size: u64,
        /// Threshold that was crossed.
        threshold: u64,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LargeFile { size, threshold } => write!(
                f,
                "Large firmware file: {size} bytes (over {} KiB), flashing will take a while",
                threshold / 1024
            ),
        }
    }
}

/// An accepted image together with its warnings.
#[derive(Debug, Clone)]
pub struct Validated {
    /// The image.
    pub image: FirmwareImage,
    /// Warnings raised during intake, empty for ordinary images.
    pub warnings: Vec<ValidationWarning>,
}

impl Validated {
    /// Whether the large-file warning was raised.
    pub fn is_large(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, ValidationWarning::LargeFile { .. }))
    }
}

/// Read and validate a firmware source.
///
/// At most `MAX_FIRMWARE_SIZE + 1` bytes are read, so an oversize source is
/// rejected without being read entirely.
pub fn select(source: &dyn FirmwareSource) -> Result<Validated, ValidationError> {
    let name = source.display_name();
    let format = format_for(&name)?;

    let reader = source.open().map_err(|e| ValidationError::Unreadable {
        name: name.clone(),
        reason: e.to_string(),
    })?;
    let mut bytes = Vec::new();
    reader
        .take(MAX_FIRMWARE_SIZE + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| ValidationError::Unreadable {
            name: name.clone(),
            reason: e.to_string(),
        })?;

    validate_as(name, format, bytes)
}

/// Validate bytes already in memory under a display name.
pub fn validate_bytes(name: &str, bytes: Vec<u8>) -> Result<Validated, ValidationError> {
    let format = format_for(name)?;
    validate_as(name.to_string(), format, bytes)
}

fn format_for(name: &str) -> Result<FirmwareFormat, ValidationError> {
    let ext = extension_of(name);
    FirmwareFormat::from_extension(ext)
        .ok_or_else(|| ValidationError::UnsupportedFormat(ext.to_string()))
}

fn validate_as(
    name: String,
    format: FirmwareFormat,
    bytes: Vec<u8>,
) -> Result<Validated, ValidationError> {
    let size = bytes.len() as u64;
    if size > MAX_FIRMWARE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            limit: MAX_FIRMWARE_SIZE,
        });
    }
    if size < MIN_FIRMWARE_SIZE {
        return Err(ValidationError::Empty {
            size,
            min: MIN_FIRMWARE_SIZE,
        });
    }

    let (base_address, payload) = match format {
        FirmwareFormat::Binary => (0, bytes.clone()),
        FirmwareFormat::IntelHex => ihex::decode(&bytes).map_err(|reason| malformed(format, reason))?,
        FirmwareFormat::Elf => elf::decode(&bytes).map_err(|reason| malformed(format, reason))?,
    };
    let payload =
        anchor_at_flash_start(base_address, payload).map_err(|reason| malformed(format, reason))?;

    let mut warnings = Vec::new();
    if size > LARGE_FIRMWARE_SIZE {
        let warning = ValidationWarning::LargeFile {
            size,
            threshold: LARGE_FIRMWARE_SIZE,
        };
        warn!("{name}: {warning}");
        warnings.push(warning);
    }

    debug!(
        "Accepted {name} as {format}: {size} bytes, payload {} bytes, data from 0x{base_address:08X}",
        payload.len()
    );
    Ok(Validated {
        image: FirmwareImage::new(name, format, bytes, base_address, payload),
        warnings,
    })
}

fn malformed(format: FirmwareFormat, reason: String) -> ValidationError {
    ValidationError::Malformed {
        format: format.name(),
        reason,
    }
}
