//! Device identities, the supported VID/PID allow-list and device events.
//!
//! WCH chips are programmed either through their built-in USB bootloader
//! (USB-ISP) or through a CH340/CH341 USB-to-serial bridge wired to the
//! chip's UART bootloader. Both show up on the host as USB devices and are
//! told apart by their VID/PID pair.

pub mod registry;
#[cfg(feature = "native")]
pub mod watch;

use std::fmt;

/// Transport used to reach the chip's bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportMode {
    /// Native USB bootloader (bulk endpoints).
    UsbIsp,
    /// UART bootloader behind a USB-to-serial bridge.
    SerialAdapter,
}

impl TransportMode {
    /// Short name used in configuration files and JSON output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsbIsp => "usb-isp",
            Self::SerialAdapter => "serial",
        }
    }

    /// Parse a transport name as written in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "usb-isp" | "usb" | "isp" => Some(Self::UsbIsp),
            "serial" | "uart" | "serial-adapter" => Some(Self::SerialAdapter),
            _ => None,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsbIsp => write!(f, "USB-ISP"),
            Self::SerialAdapter => write!(f, "Serial"),
        }
    }
}

/// Built-in allow-list: (VID, PID, transport, label).
const DEFAULT_ALLOW_LIST: &[(u16, u16, TransportMode, &str)] = &[
    (0x4348, 0x55E0, TransportMode::UsbIsp, "WCH USB-ISP bootloader"),
    (0x1A86, 0x55E0, TransportMode::UsbIsp, "WCH USB-ISP bootloader"),
    (0x1A86, 0x7523, TransportMode::SerialAdapter, "CH340 serial bridge"),
    (0x1A86, 0x5523, TransportMode::SerialAdapter, "CH341 serial bridge"),
];

/// One supported VID/PID pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowEntry {
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Transport the pair is programmed through.
    pub transport: TransportMode,
    /// Human-readable label.
    pub label: String,
}

/// The set of devices the registry accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<AllowEntry>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self {
            entries: DEFAULT_ALLOW_LIST
                .iter()
                .map(|&(vid, pid, transport, label)| AllowEntry {
                    vid,
                    pid,
                    transport,
                    label: label.to_string(),
                })
                .collect(),
        }
    }
}

impl AllowList {
    /// An allow-list that accepts nothing.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a pair. A pair that is already present keeps its first entry.
    #[must_use]
    pub fn with_entry(mut self, vid: u16, pid: u16, transport: TransportMode, label: &str) -> Self {
        self.insert(vid, pid, transport, label);
        self
    }

    /// Add a pair in place.
    pub fn insert(&mut self, vid: u16, pid: u16, transport: TransportMode, label: &str) {
        if self.lookup(vid, pid).is_none() {
            self.entries.push(AllowEntry {
                vid,
                pid,
                transport,
                label: label.to_string(),
            });
        }
    }

    /// Find the entry for a VID/PID pair.
    pub fn lookup(&self, vid: u16, pid: u16) -> Option<&AllowEntry> {
        self.entries.iter().find(|e| e.vid == vid && e.pid == pid)
    }

    /// Whether the pair is supported.
    pub fn is_supported(&self, vid: u16, pid: u16) -> bool {
        self.lookup(vid, pid).is_some()
    }

    /// All entries, built-in ones first.
    pub fn entries(&self) -> &[AllowEntry] {
        &self.entries
    }
}

/// Whether a VID/PID pair is on the built-in allow-list.
#[must_use]
pub fn is_supported(vid: u16, pid: u16) -> bool {
    DEFAULT_ALLOW_LIST
        .iter()
        .any(|&(v, p, _, _)| v == vid && p == pid)
}

/// What the device source reports about an attached device.
///
/// `locator` is the only thing an engine needs to open the device: a serial
/// port path for bridges, a USB bus location for bootloaders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Product name as reported by the host (may be empty).
    pub name: String,
    /// Host-specific location used to open the device.
    pub locator: String,
}

impl DeviceDescriptor {
    /// Create a descriptor.
    pub fn new(vendor_id: u16, product_id: u16, name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            name: name.into(),
            locator: locator.into(),
        }
    }

    /// Resolve the descriptor against an allow-list.
    pub fn identity(&self, allow: &AllowList) -> Option<DeviceIdentity> {
        let entry = allow.lookup(self.vendor_id, self.product_id)?;
        let display_name = if self.name.is_empty() {
            entry.label.clone()
        } else {
            self.name.clone()
        };
        Some(DeviceIdentity {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            transport_mode: entry.transport,
            display_name,
        })
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} @ {}",
            self.vendor_id, self.product_id, self.locator
        )
    }
}

/// A supported device, fixed at attach time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// How the bootloader is reached.
    pub transport_mode: TransportMode,
    /// Name shown to the operator.
    pub display_name: String,
}

/// Events delivered by a device source, processed in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device appeared on the host.
    Attached(DeviceDescriptor),
    /// A device disappeared from the host.
    Detached(DeviceDescriptor),
    /// Answer to an earlier permission request.
    PermissionResult {
        /// The device the request was about.
        device: DeviceDescriptor,
        /// Whether access was granted.
        granted: bool,
    },
}

/// Format a list of descriptors for display.
pub fn format_device_list(devices: &[DeviceDescriptor], allow: &AllowList) -> Vec<String> {
    devices
        .iter()
        .map(|d| {
            let kind = allow
                .lookup(d.vendor_id, d.product_id)
                .map(|e| format!(" [{}]", e.transport))
                .unwrap_or_default();
            let name = if d.name.is_empty() {
                String::new()
            } else {
                format!(" - {}", d.name)
            };
            format!("{d}{kind}{name}")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list_pairs_are_supported() {
        let allow = AllowList::default();
        for &(vid, pid, transport, _) in DEFAULT_ALLOW_LIST {
            assert!(is_supported(vid, pid));
            assert!(allow.is_supported(vid, pid));
            assert_eq!(allow.lookup(vid, pid).map(|e| e.transport), Some(transport));
        }
    }

    #[test]
    fn test_pairs_outside_allow_list_are_rejected() {
        // Same vendor, other product.
        assert!(!is_supported(0x1A86, 0x7522));
        // Same product, other vendor.
        assert!(!is_supported(0x10C4, 0x55E0));
        assert!(!is_supported(0x0000, 0x0000));
        assert!(!is_supported(0xFFFF, 0xFFFF));

        for vid in [0x4348u16, 0x1A86, 0x0403] {
            for pid in 0x5500u16..0x5600 {
                let expected = DEFAULT_ALLOW_LIST
                    .iter()
                    .any(|&(v, p, _, _)| v == vid && p == pid);
                assert_eq!(is_supported(vid, pid), expected, "{vid:04X}:{pid:04X}");
            }
        }
    }

    #[test]
    fn test_transport_modes() {
        let allow = AllowList::default();
        assert_eq!(
            allow.lookup(0x4348, 0x55E0).map(|e| e.transport),
            Some(TransportMode::UsbIsp)
        );
        assert_eq!(
            allow.lookup(0x1A86, 0x7523).map(|e| e.transport),
            Some(TransportMode::SerialAdapter)
        );
    }

    #[test]
    fn test_allow_list_insert_keeps_first_entry() {
        let allow = AllowList::default()
            .with_entry(0x4348, 0x55E0, TransportMode::SerialAdapter, "dup")
            .with_entry(0x1234, 0x5678, TransportMode::SerialAdapter, "custom");
        assert_eq!(allow.entries().len(), DEFAULT_ALLOW_LIST.len() + 1);
        assert_eq!(
            allow.lookup(0x4348, 0x55E0).map(|e| e.transport),
            Some(TransportMode::UsbIsp)
        );
        assert!(allow.is_supported(0x1234, 0x5678));
        assert!(!AllowList::empty().is_supported(0x4348, 0x55E0));
    }

    #[test]
    fn test_transport_mode_from_name() {
        assert_eq!(TransportMode::from_name("usb-isp"), Some(TransportMode::UsbIsp));
        assert_eq!(TransportMode::from_name("SERIAL"), Some(TransportMode::SerialAdapter));
        assert_eq!(TransportMode::from_name("bluetooth"), None);
    }

    #[test]
    fn test_descriptor_identity_falls_back_to_label() {
        let allow = AllowList::default();
        let desc = DeviceDescriptor::new(0x1A86, 0x7523, "", "/dev/ttyUSB0");
        let id = desc.identity(&allow).unwrap();
        assert_eq!(id.transport_mode, TransportMode::SerialAdapter);
        assert_eq!(id.display_name, "CH340 serial bridge");

        let unknown = DeviceDescriptor::new(0x0403, 0x6001, "FT232R", "/dev/ttyUSB1");
        assert!(unknown.identity(&allow).is_none());
    }

    #[test]
    fn test_format_device_list() {
        let allow = AllowList::default();
        let devices = vec![
            DeviceDescriptor::new(0x4348, 0x55E0, "USB Module", "usb:1-2"),
            DeviceDescriptor::new(0x1A86, 0x7523, "", "/dev/ttyUSB0"),
        ];
        let formatted = format_device_list(&devices, &allow);
        assert_eq!(formatted.len(), 2);
        assert!(formatted[0].contains("4348:55E0"));
        assert!(formatted[0].contains("USB-ISP"));
        assert!(formatted[0].contains("USB Module"));
        assert!(formatted[1].contains("/dev/ttyUSB0"));
        assert!(formatted[1].contains("Serial"));
    }
}
