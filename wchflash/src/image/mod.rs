//! Firmware images and where they come from.
//!
//! ## Formats
//!
//! | Extension | Format     | Payload sent to the engine                 |
//! |-----------|------------|--------------------------------------------|
//! | `.bin`    | raw binary | the file as-is                             |
//! | `.hex`    | Intel HEX  | data records flattened from the flash start |
//! | `.elf`    | ELF32 LE   | `PT_LOAD` segments flattened likewise      |
//!
//! The engine writes every payload from flash offset 0. HEX and ELF data is
//! placed at its offset from the start of code flash, which is mapped both at
//! `0x00000000` and at [`FLASH_ALIAS`]. Gaps, including the one below the
//! first data byte, are filled with `0xFF`, the erased state of WCH code
//! flash.

pub mod elf;
pub mod ihex;
pub mod intake;

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use intake::{
    LARGE_FIRMWARE_SIZE, MAX_FIRMWARE_SIZE, MIN_FIRMWARE_SIZE, Validated, ValidationWarning,
    select, validate_bytes,
};

/// Fill value for gaps between loadable regions.
pub const FILL_BYTE: u8 = 0xFF;

/// Largest address span a decoded image may cover.
const MAX_SPAN: u64 = 16 * 1024 * 1024;

/// System-bus alias of the start of code flash.
pub const FLASH_ALIAS: u32 = 0x0800_0000;

/// On-disk firmware format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FirmwareFormat {
    /// Raw binary.
    Binary,
    /// Intel HEX text.
    IntelHex,
    /// ELF executable.
    Elf,
}

impl FirmwareFormat {
    /// Match a file extension (case-insensitive, without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "bin" => Some(Self::Binary),
            "hex" => Some(Self::IntelHex),
            "elf" => Some(Self::Elf),
            _ => None,
        }
    }

    /// Short name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::IntelHex => "Intel HEX",
            Self::Elf => "ELF",
        }
    }
}

impl fmt::Display for FirmwareFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extension of a display name, or an empty string when it has none.
pub fn extension_of(name: &str) -> &str {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
}

/// A validated firmware image.
///
/// Cloning is cheap: both buffers are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Size of the source in bytes.
    pub size_bytes: u32,
    /// Display name of the source.
    pub source_name: String,
    /// Format the source was decoded as.
    pub format: FirmwareFormat,
    /// Load address of the lowest data byte. Zero for raw binaries.
    pub base_address: u32,
    bytes: Arc<[u8]>,
    payload: Arc<[u8]>,
}

impl FirmwareImage {
    pub(crate) fn new(
        source_name: String,
        format: FirmwareFormat,
        bytes: Vec<u8>,
        base_address: u32,
        payload: Vec<u8>,
    ) -> Self {
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FIRMWARE_SIZE
        let size_bytes = bytes.len() as u32;
        Self {
            size_bytes,
            source_name,
            format,
            base_address,
            bytes: bytes.into(),
            payload: payload.into(),
        }
    }

    /// The source bytes exactly as read.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The flat binary handed to the engine, starting at flash offset 0.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle to the payload, for moving into worker threads.
    pub fn payload_arc(&self) -> Arc<[u8]> {
        Arc::clone(&self.payload)
    }
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("source_name", &self.source_name)
            .field("format", &self.format)
            .field("size_bytes", &self.size_bytes)
            .field("base_address", &format_args!("{:#010x}", self.base_address))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Something a firmware image can be read from.
pub trait FirmwareSource {
    /// Name shown to the operator; its extension selects the format.
    fn display_name(&self) -> String;

    /// Open the source for reading.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

/// A firmware file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Wrap a path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The wrapped path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FirmwareSource for FileSource {
    fn display_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// Firmware already held in memory (downloads, tests, content providers).
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Vec<u8>,
}

impl MemorySource {
    /// Wrap a buffer under a display name.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl FirmwareSource for MemorySource {
    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }
}

/// Flatten `(address, data)` regions into one buffer starting at the lowest
/// address. Overlapping regions are rejected.
pub(crate) fn flatten(mut regions: Vec<(u32, Vec<u8>)>) -> Result<(u32, Vec<u8>), String> {
    regions.retain(|(_, data)| !data.is_empty());
    if regions.is_empty() {
        return Err("no loadable data".to_string());
    }
    regions.sort_by_key(|(addr, _)| *addr);

    let base = regions[0].0;
    let mut end = u64::from(base);
    for (addr, data) in &regions {
        let start = u64::from(*addr);
        if start < end {
            return Err(format!("overlapping data at 0x{addr:08X}"));
        }
        end = start + data.len() as u64;
    }
    let span = end - u64::from(base);
    if span > MAX_SPAN {
        return Err(format!(
            "data spans {span} bytes from 0x{base:08X}, more than {MAX_SPAN}"
        ));
    }

    #[allow(clippy::cast_possible_truncation)] // span <= MAX_SPAN
    let mut out = vec![FILL_BYTE; span as usize];
    for (addr, data) in regions {
        let offset = (addr - base) as usize;
        out[offset..offset + data.len()].copy_from_slice(&data);
    }
    Ok((base, out))
}

/// Place a decoded payload at its offset from the start of code flash.
///
/// `load_address` is where the first payload byte belongs, either in the
/// zero-based mapping or behind [`FLASH_ALIAS`].
pub(crate) fn anchor_at_flash_start(load_address: u32, payload: Vec<u8>) -> Result<Vec<u8>, String> {
    let offset = load_address.checked_sub(FLASH_ALIAS).unwrap_or(load_address);
    let end = u64::from(offset) + payload.len() as u64;
    if end > MAX_SPAN {
        return Err(format!("load address 0x{load_address:08X} is outside code flash"));
    }
    if offset == 0 {
        return Ok(payload);
    }

    #[allow(clippy::cast_possible_truncation)] // end <= MAX_SPAN
    let mut out = vec![FILL_BYTE; end as usize];
    out[offset as usize..].copy_from_slice(&payload);
    Ok(out)
}
