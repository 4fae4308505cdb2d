//! Host device discovery.
//!
//! USB-ISP bootloaders are found by enumerating USB devices with `nusb`.
//! Serial bridges are found through `serialport`, which also yields the port
//! path the engine opens. Only pairs on the allow-list are reported.
//!
//! [`DeviceWatcher`] rescans at a fixed interval and turns the difference
//! between two scans into [`DeviceEvent`]s.

use super::{AllowList, DeviceDescriptor, DeviceEvent, TransportMode};
use crate::error::{Error, Result};
use log::{debug, trace, warn};
use nusb::MaybeFuture;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default rescan interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Produces a snapshot of the supported devices currently attached.
pub trait DeviceScanner: Send {
    /// Scan once.
    fn scan(&mut self) -> Result<Vec<DeviceDescriptor>>;
}

/// Scanner over the real host buses.
#[derive(Debug, Clone)]
pub struct HostScanner {
    allow: AllowList,
}

impl HostScanner {
    /// Report devices on `allow`.
    pub fn new(allow: AllowList) -> Self {
        Self { allow }
    }
}

impl DeviceScanner for HostScanner {
    fn scan(&mut self) -> Result<Vec<DeviceDescriptor>> {
        enumerate_devices(&self.allow)
    }
}

fn scan_usb(allow: &AllowList) -> Result<Vec<DeviceDescriptor>> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|e| Error::Io(io::Error::other(format!("USB enumeration failed: {e}"))))?;

    let found = devices
        .filter(|d| {
            allow
                .lookup(d.vendor_id(), d.product_id())
                .is_some_and(|e| e.transport == TransportMode::UsbIsp)
        })
        .map(|d| {
            let locator = format!("usb:{}-{}", d.bus_id(), d.device_address());
            trace!(
                "Found USB device {:04X}:{:04X} at {locator}",
                d.vendor_id(),
                d.product_id()
            );
            DeviceDescriptor::new(
                d.vendor_id(),
                d.product_id(),
                d.product_string().unwrap_or_default(),
                locator,
            )
        })
        .collect();
    Ok(found)
}

fn scan_serial(allow: &AllowList) -> Result<Vec<DeviceDescriptor>> {
    let ports = serialport::available_ports()?;

    let found = ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb)
                if allow
                    .lookup(usb.vid, usb.pid)
                    .is_some_and(|e| e.transport == TransportMode::SerialAdapter) =>
            {
                trace!(
                    "Found serial bridge {:04X}:{:04X} at {}",
                    usb.vid, usb.pid, port.port_name
                );
                Some(DeviceDescriptor::new(
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default(),
                    port.port_name,
                ))
            },
            _ => None,
        })
        .collect();
    Ok(found)
}

/// Supported devices attached right now: USB-ISP bootloaders first, then
/// serial bridges.
pub fn enumerate_devices(allow: &AllowList) -> Result<Vec<DeviceDescriptor>> {
    let mut devices = scan_usb(allow)?;
    devices.extend(scan_serial(allow)?);
    Ok(devices)
}

/// Events that turn scan `prev` into scan `next`.
///
/// Detaches come first, then attaches in discovery order.
pub fn diff(prev: &[DeviceDescriptor], next: &[DeviceDescriptor]) -> Vec<DeviceEvent> {
    let gone = prev
        .iter()
        .filter(|d| !next.contains(d))
        .cloned()
        .map(DeviceEvent::Detached);
    let new = next
        .iter()
        .filter(|d| !prev.contains(d))
        .cloned()
        .map(DeviceEvent::Attached);
    gone.chain(new).collect()
}

/// Background poller feeding device events into a channel.
///
/// A failed scan is skipped: the previous snapshot stays in force, so a
/// transient host error never reads as a detach. Stops when dropped or when
/// the receiving side goes away.
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Watch the host buses for devices on `allow`.
    pub fn spawn(allow: AllowList, interval: Duration, events: Sender<DeviceEvent>) -> Result<Self> {
        Self::with_scanner(HostScanner::new(allow), interval, events)
    }

    /// Watch using a custom scanner.
    pub fn with_scanner<S>(mut scanner: S, interval: Duration, events: Sender<DeviceEvent>) -> Result<Self>
    where
        S: DeviceScanner + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("wchflash-watch".into())
            .spawn(move || {
                let mut known: Vec<DeviceDescriptor> = Vec::new();
                while !stop_flag.load(Ordering::SeqCst) {
                    let current = match scanner.scan() {
                        Ok(current) => current,
                        Err(e) => {
                            warn!("Device scan failed: {e}");
                            thread::sleep(interval);
                            continue;
                        },
                    };
                    for event in diff(&known, &current) {
                        trace!("Watcher event: {event:?}");
                        if events.send(event).is_err() {
                            debug!("Device event receiver gone; watcher stopping");
                            return;
                        }
                    }
                    known = current;
                    thread::sleep(interval);
                }
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop polling and wait for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn dev(locator: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(0x4348, 0x55E0, "", locator)
    }

    #[test]
    fn test_diff() {
        let a = dev("usb:1-1");
        let b = dev("usb:1-2");
        let c = dev("usb:1-3");
        assert_eq!(diff(&[], &[a.clone()]), vec![DeviceEvent::Attached(a.clone())]);
        assert_eq!(
            diff(&[a.clone(), b.clone()], &[b.clone(), c.clone()]),
            vec![DeviceEvent::Detached(a.clone()), DeviceEvent::Attached(c)]
        );
        assert!(diff(&[a.clone(), b.clone()], &[b, a]).is_empty());
    }

    /// Replays scans in order; `None` is a failed scan. The last entry repeats.
    struct Scripted {
        scans: Vec<Option<Vec<DeviceDescriptor>>>,
    }

    impl DeviceScanner for Scripted {
        fn scan(&mut self) -> Result<Vec<DeviceDescriptor>> {
            let next = if self.scans.len() > 1 {
                self.scans.remove(0)
            } else {
                self.scans.first().cloned().flatten()
            };
            next.ok_or_else(|| Error::Io(io::Error::other("bus went away")))
        }
    }

    #[test]
    fn test_watcher_emits_attach_then_detach() {
        let (tx, rx) = channel();
        let scanner = Scripted {
            scans: vec![Some(vec![]), Some(vec![dev("usb:1-1")]), Some(vec![])],
        };
        let watcher = DeviceWatcher::with_scanner(scanner, Duration::from_millis(5), tx).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        watcher.stop();
        assert_eq!(first, DeviceEvent::Attached(dev("usb:1-1")));
        assert_eq!(second, DeviceEvent::Detached(dev("usb:1-1")));
    }

    #[test]
    fn test_failed_scan_is_not_a_detach() {
        let (tx, rx) = channel();
        let scanner = Scripted {
            scans: vec![Some(vec![dev("usb:1-1")]), None, None, Some(vec![dev("usb:1-1")])],
        };
        let watcher = DeviceWatcher::with_scanner(scanner, Duration::from_millis(5), tx).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, DeviceEvent::Attached(dev("usb:1-1")));
        // the device stays present across the failed scans
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        watcher.stop();
    }
}
