//! The flashing session state machine.
//!
//! ```text
//! Disconnected -> [RequestingPermission] -> Connecting -> Identified
//! Identified -> Flashing -> Verifying -> Resetting -> Identified
//! Identified -> Erasing -> Identified
//! any failure -> Error (leave with reconnect)
//! detach, from any state -> Disconnected
//! ```
//!
//! All session data lives in one mutex-guarded [`Core`]. Device events,
//! user commands and operation completions each take that lock, apply their
//! transition and notify observers before releasing it, so observers never
//! see a state without its matching handle.
//!
//! Long engine calls run through the [`Scheduler`]. Every connection gets a
//! new epoch number. Completions carry the epoch they were started under
//! and are dropped if a detach (or a new connect) has moved the session on.
//!
//! Lock order is gateway, then core. A worker holding the gateway may take
//! the core lock to report progress; nothing that holds the core lock waits
//! for the gateway. Closes triggered from a transition therefore run in the
//! background.

mod config;
pub mod observer;
pub mod state;

pub use config::{FirmwareRetention, SessionConfig, Timeouts};
pub use observer::{ChannelObserver, LogLevel, LogLine, SessionEvent, SessionObserver};
pub use state::{Failure, FailureKind, SessionState};

use crate::device::registry::{DeviceRegistry, ImplicitPermission, PermissionState, RegistryAction};
use crate::device::{AllowList, DeviceDescriptor, DeviceEvent, DeviceIdentity};
use crate::engine::{EngineGateway, EngineMode, GatewayStats, Handle};
use crate::error::{Error, Operation, Result, ValidationError};
use crate::image::{FirmwareImage, FirmwareSource, Validated, select};
use crate::scheduler::{Outcome, Scheduler};
use crate::target::ChipIdentity;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type SharedGateway = Arc<Mutex<Box<dyn EngineGateway>>>;
type ConnectResult = Result<(Lease, ChipIdentity)>;
type OpResult = std::result::Result<(), String>;

/// How often the event loop checks for shutdown while idle.
const EVENT_POLL: Duration = Duration::from_millis(100);

/// How long `shutdown` waits for the engine before closing in the background.
const SHUTDOWN_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// A handle and the gateway's open count right after it was issued.
///
/// Engines may hand out the same raw handle again. A later open bumps the
/// count, and that open has already closed whatever the slot held, so a
/// deferred close of an older lease must not reach the engine.
#[derive(Debug, Clone, Copy, Default)]
struct Lease {
    handle: Handle,
    generation: u32,
}

/// Close `lease` unless a later open has taken over the gateway's slot.
fn close_lease(gw: &mut dyn EngineGateway, lease: Lease) {
    let Lease { handle, generation } = lease;
    if gw.stats().opens != generation {
        debug!("Handle {handle} was superseded by a later open; not closing it again");
        return;
    }
    if !gw.close_device(handle) {
        debug!("Close of handle {handle}: {}", gw.last_error());
    }
}

fn op_label(op: Operation) -> &'static str {
    match op {
        Operation::Flash => "flash",
        Operation::Erase => "erase",
        Operation::Verify => "verify",
        Operation::Reset => "reset",
    }
}

struct Core {
    state: SessionState,
    lease: Lease,
    chip: Option<ChipIdentity>,
    epoch: u64,
    registry: DeviceRegistry,
    firmware: Option<FirmwareImage>,
    /// Payload of the flash workflow in progress; verify uses the same bytes.
    workflow_payload: Option<Arc<[u8]>>,
    observers: Vec<Box<dyn SessionObserver>>,
    pending_connect: bool,
    shut_down: bool,
}

impl Core {
    fn emit(&mut self, event: &SessionEvent) {
        self.observers.retain_mut(|o| o.on_event(event));
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let line = LogLine::now(level, message);
        log::log!(log::Level::from(level), "{}", line.message);
        self.emit(&SessionEvent::Log(line));
    }
}

struct Inner {
    core: Mutex<Core>,
    changed: Condvar,
    gateway: SharedGateway,
    scheduler: Scheduler,
    mode: EngineMode,
    config: SessionConfig,
}

impl Inner {
    fn set_state(&self, core: &mut Core, state: SessionState) {
        if core.state != state {
            core.state = state.clone();
            core.emit(&SessionEvent::StateChanged(state));
            self.changed.notify_all();
        }
    }

    fn fail(&self, core: &mut Core, err: &Error) {
        let failure = Failure::from_error(err);
        core.log(LogLevel::Error, failure.detail.clone());
        self.release_handle(core);
        core.chip = None;
        core.workflow_payload = None;
        self.set_state(core, SessionState::Error(failure));
    }

    /// Invalidate the session handle now and close it in the background.
    fn release_handle(&self, core: &mut Core) {
        let lease = std::mem::take(&mut core.lease);
        if lease.handle.is_valid() {
            self.close_in_background(lease);
        }
    }

    fn close_in_background(&self, lease: Lease) {
        let gateway = Arc::clone(&self.gateway);
        Scheduler::spawn_detached("close", move || {
            let mut gw = gateway.lock();
            close_lease(&mut **gw, lease);
        });
    }

    fn tear_down(&self, core: &mut Core, device: &DeviceDescriptor) {
        core.epoch += 1;
        core.pending_connect = false;
        core.chip = None;
        core.workflow_payload = None;
        self.release_handle(core);

        if core.state.is_working() {
            let phase = core.state.name();
            core.log(
                LogLevel::Warn,
                format!("Device {device} detached during {phase}; operation abandoned"),
            );
        } else {
            core.log(LogLevel::Info, format!("Device {device} detached"));
        }
        self.set_state(core, SessionState::Disconnected);
    }

    fn start_connect(self: &Arc<Self>, core: &mut Core, device: DeviceDescriptor) {
        let Some(identity) = core.registry.current_device().cloned() else {
            return;
        };
        if self.scheduler.is_busy() {
            core.pending_connect = true;
            core.log(
                LogLevel::Info,
                format!("Waiting for the previous operation to finish before connecting to {device}"),
            );
            self.set_state(core, SessionState::Connecting);
            return;
        }

        core.pending_connect = false;
        core.epoch += 1;
        let epoch = core.epoch;
        let timeout = self.config.timeouts.connect;
        let gateway = Arc::clone(&self.gateway);
        let (vid, pid, transport) = (identity.vendor_id, identity.product_id, identity.transport_mode);

        let work = move || -> ConnectResult {
            let mut gw = gateway.lock();
            let handle = gw.open_device(&device, vid, pid, transport);
            if !handle.is_valid() {
                return Err(Error::OpenFailed(gw.last_error()));
            }
            let lease = Lease {
                handle,
                generation: gw.stats().opens,
            };
            match gw.identify_chip(handle) {
                Some(chip) => Ok((lease, chip)),
                None => {
                    let reason = gw.last_error();
                    gw.close_device(handle);
                    Err(Error::IdentifyFailed(reason))
                },
            }
        };

        let inner = Arc::clone(self);
        let submitted = self.scheduler.submit("connect", timeout, work, move |outcome| {
            inner.on_connect_done(epoch, timeout, outcome);
        });
        match submitted {
            Ok(()) => {
                core.log(
                    LogLevel::Info,
                    format!("Connecting to {} via {}", identity.display_name, identity.transport_mode),
                );
                self.set_state(core, SessionState::Connecting);
            },
            Err(e) => self.fail(core, &e),
        }
    }

    fn on_connect_done(self: &Arc<Self>, epoch: u64, timeout: Duration, outcome: Outcome<ConnectResult>) {
        let mut core = self.core.lock();
        let current = core.epoch == epoch && !core.shut_down;

        match outcome {
            Outcome::Finished(Ok((lease, chip))) if current => {
                core.lease = lease;
                core.chip = Some(chip.clone());
                core.log(LogLevel::Info, format!("Connected: {chip}"));
                if self.mode == EngineMode::Simulated {
                    core.log(LogLevel::Warn, "Simulated engine: chip identity is not a real read");
                } else if !chip.is_known() {
                    core.log(
                        LogLevel::Warn,
                        format!("Chip {chip} is not in the chip table; flash size unknown"),
                    );
                }
                self.set_state(&mut core, SessionState::Identified(chip));
            },
            Outcome::Finished(Ok((lease, _))) | Outcome::Late(Ok((lease, _))) => {
                core.log(LogLevel::Debug, format!("Closing stale connection {}", lease.handle));
                self.close_in_background(lease);
            },
            Outcome::Finished(Err(e)) if current => self.fail(&mut core, &e),
            Outcome::TimedOut if current => self.fail(&mut core, &Error::ConnectTimeout(timeout)),
            Outcome::Abandoned if current => {
                self.fail(&mut core, &Error::Engine("connect worker exited unexpectedly".into()));
            },
            _ => debug!("Ignoring stale connect outcome"),
        }
        self.resume_pending(&mut core);
    }

    fn start_op(self: &Arc<Self>, core: &mut Core, op: Operation) -> Result<()> {
        let handle = core.lease.handle;
        let epoch = core.epoch;
        let timeout = self.config.timeouts.for_operation(op);
        let payload = core.workflow_payload.clone();
        let gateway = Arc::clone(&self.gateway);
        let progress = Arc::clone(self);

        let work = move || -> OpResult {
            let mut gw = gateway.lock();
            let data = payload.as_deref().unwrap_or_default();
            let ok = match op {
                Operation::Flash => {
                    gw.flash_firmware(handle, data, &mut |pct| progress.on_progress(epoch, pct))
                },
                Operation::Erase => gw.erase_chip(handle),
                Operation::Verify => gw.verify_firmware(handle, data),
                Operation::Reset => gw.reset_chip(handle),
            };
            if ok { Ok(()) } else { Err(gw.last_error()) }
        };

        let inner = Arc::clone(self);
        self.scheduler.submit(op_label(op), timeout, work, move |outcome| {
            inner.on_op_done(op, epoch, timeout, outcome);
        })?;

        let state = match op {
            Operation::Flash => SessionState::Flashing { progress: 0 },
            Operation::Erase => SessionState::Erasing,
            Operation::Verify => SessionState::Verifying,
            Operation::Reset => SessionState::Resetting,
        };
        self.set_state(core, state);
        Ok(())
    }

    fn on_progress(&self, epoch: u64, pct: u8) {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            return;
        }
        if let SessionState::Flashing { progress } = core.state {
            if pct > progress {
                self.set_state(&mut core, SessionState::Flashing { progress: pct.min(100) });
            }
        }
    }

    fn on_op_done(self: &Arc<Self>, op: Operation, epoch: u64, timeout: Duration, outcome: Outcome<OpResult>) {
        let mut core = self.core.lock();
        if core.epoch != epoch || core.shut_down {
            debug!("Discarding {op} result from a previous connection");
        } else {
            match outcome {
                Outcome::Finished(Ok(())) => self.advance(&mut core, op),
                Outcome::Finished(Err(reason)) => {
                    self.fail(&mut core, &Error::OperationFailed { op, reason });
                },
                Outcome::TimedOut => self.fail(&mut core, &Error::OperationTimeout { op, timeout }),
                Outcome::Late(_) => debug!("{op} finished after its deadline; result ignored"),
                Outcome::Abandoned => self.fail(
                    &mut core,
                    &Error::OperationFailed {
                        op,
                        reason: "worker exited unexpectedly".into(),
                    },
                ),
            }
        }
        self.resume_pending(&mut core);
    }

    /// Move to the next step after `op` succeeded.
    fn advance(self: &Arc<Self>, core: &mut Core, op: Operation) {
        let next = match op {
            Operation::Flash => {
                core.log(LogLevel::Info, "Flash complete");
                if self.config.verify_after_flash {
                    Some(Operation::Verify)
                } else if self.config.reset_after_flash {
                    Some(Operation::Reset)
                } else {
                    None
                }
            },
            Operation::Verify => {
                core.log(LogLevel::Info, "Verify OK");
                self.config.reset_after_flash.then_some(Operation::Reset)
            },
            Operation::Reset => {
                core.log(LogLevel::Info, "Chip reset");
                None
            },
            Operation::Erase => {
                core.log(LogLevel::Info, "Erase complete");
                return self.back_to_ready(core);
            },
        };

        match next {
            Some(next) => {
                if let Err(e) = self.start_op(core, next) {
                    self.fail(core, &e);
                }
            },
            None => {
                core.workflow_payload = None;
                if self.config.retention == FirmwareRetention::DiscardAfterFlash {
                    if let Some(image) = core.firmware.take() {
                        core.log(LogLevel::Info, format!("Released firmware {}", image.source_name));
                    }
                }
                core.log(LogLevel::Info, "Done");
                self.back_to_ready(core);
            },
        }
    }

    fn back_to_ready(&self, core: &mut Core) {
        match core.chip.clone() {
            Some(chip) => self.set_state(core, SessionState::Identified(chip)),
            None => self.set_state(core, SessionState::Disconnected),
        }
    }

    fn resume_pending(self: &Arc<Self>, core: &mut Core) {
        if !core.pending_connect || core.shut_down || self.scheduler.is_busy() {
            return;
        }
        if let Some(device) = core.registry.current_descriptor().cloned() {
            self.start_connect(core, device);
        } else {
            core.pending_connect = false;
        }
    }
}

/// One flashing session: at most one device, one connection, one operation.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct FlashSession {
    inner: Arc<Inner>,
}

impl FlashSession {
    /// Create a session over a bound gateway.
    pub fn new(gateway: Box<dyn EngineGateway>, registry: DeviceRegistry, config: SessionConfig) -> Self {
        let mode = gateway.mode();
        info!("Flash session using the {mode} engine");
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: SessionState::Disconnected,
                    lease: Lease::default(),
                    chip: None,
                    epoch: 0,
                    registry,
                    firmware: None,
                    workflow_payload: None,
                    observers: Vec::new(),
                    pending_connect: false,
                    shut_down: false,
                }),
                changed: Condvar::new(),
                gateway: Arc::new(Mutex::new(gateway)),
                scheduler: Scheduler::new(),
                mode,
                config,
            }),
        }
    }

    /// Session with the built-in allow-list, implicit permissions and default config.
    pub fn with_defaults(gateway: Box<dyn EngineGateway>) -> Self {
        let registry = DeviceRegistry::new(AllowList::default(), Box::new(ImplicitPermission));
        Self::new(gateway, registry, SessionConfig::default())
    }

    /// Engine mode, fixed for the session's lifetime.
    pub fn mode(&self) -> EngineMode {
        self.inner.mode
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SessionState {
        self.inner.core.lock().state.clone()
    }

    /// The live connection handle, or [`Handle::INVALID`].
    pub fn handle(&self) -> Handle {
        self.inner.core.lock().lease.handle
    }

    /// The current device, if any.
    pub fn current_device(&self) -> Option<DeviceIdentity> {
        self.inner.core.lock().registry.current_device().cloned()
    }

    /// The selected firmware image, if any.
    pub fn firmware(&self) -> Option<FirmwareImage> {
        self.inner.core.lock().firmware.clone()
    }

    /// Whether an engine operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.scheduler.is_busy()
    }

    /// Gateway open/close counters. Blocks while an engine call runs.
    pub fn gateway_stats(&self) -> GatewayStats {
        self.inner.gateway.lock().stats()
    }

    /// Register an observer.
    pub fn add_observer(&self, observer: Box<dyn SessionObserver>) {
        self.inner.core.lock().observers.push(observer);
    }

    /// Observe through a channel. The current state is sent first.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        let mut core = self.inner.core.lock();
        let mut observer = ChannelObserver::new(tx);
        if observer.on_event(&SessionEvent::StateChanged(core.state.clone())) {
            core.observers.push(Box::new(observer));
        }
        rx
    }

    /// Process one device event.
    pub fn handle_event(&self, event: &DeviceEvent) {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.shut_down {
            return;
        }

        if let DeviceEvent::Attached(device) = event {
            if !core.registry.allow_list().is_supported(device.vendor_id, device.product_id) {
                core.log(LogLevel::Info, format!("Ignoring unsupported device {device}"));
            }
        }

        match core.registry.handle(event) {
            RegistryAction::Ignore => {},
            RegistryAction::RequestPermission(device) => {
                core.log(LogLevel::Info, format!("Requesting USB permission for {device}"));
                inner.set_state(&mut core, SessionState::RequestingPermission);
            },
            RegistryAction::Connect(device) => inner.start_connect(&mut core, device),
            RegistryAction::PermissionDenied(device) => {
                core.log(LogLevel::Warn, format!("USB permission denied for {device}"));
                inner.set_state(&mut core, SessionState::Disconnected);
            },
            RegistryAction::TearDown(device) => inner.tear_down(&mut core, &device),
        }
    }

    /// Process device events from `events` on a dedicated thread, in
    /// arrival order, until every sender is gone or the session shuts down.
    pub fn spawn_event_loop(&self, events: Receiver<DeviceEvent>) -> io::Result<JoinHandle<()>> {
        let session = self.clone();
        thread::Builder::new()
            .name("wchflash-events".into())
            .spawn(move || {
                loop {
                    match events.recv_timeout(EVENT_POLL) {
                        Ok(event) => session.handle_event(&event),
                        Err(RecvTimeoutError::Timeout) => {},
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if session.inner.core.lock().shut_down {
                        break;
                    }
                }
                debug!("Device event loop stopped");
            })
    }

    /// Read and validate a firmware source, and select it on success.
    ///
    /// Picking a new source always drops the previous selection. The session
    /// state is not touched.
    pub fn select_firmware(&self, source: &dyn FirmwareSource) -> std::result::Result<Validated, ValidationError> {
        let result = select(source);
        let mut core = self.inner.core.lock();
        core.firmware = None;
        match &result {
            Ok(validated) => {
                let image = &validated.image;
                for warning in &validated.warnings {
                    core.log(LogLevel::Warn, format!("{}: {warning}", image.source_name));
                }
                core.log(
                    LogLevel::Info,
                    format!(
                        "Selected {} ({}, {} bytes)",
                        image.source_name, image.format, image.size_bytes
                    ),
                );
                core.firmware = Some(image.clone());
            },
            Err(e) => core.log(LogLevel::Error, format!("{}: {e}", source.display_name())),
        }
        result
    }

    /// Drop the selected firmware.
    pub fn clear_firmware(&self) {
        self.inner.core.lock().firmware = None;
    }

    fn check_ready(core: &Core) -> Result<()> {
        if core.shut_down {
            return Err(Error::NotReady("session is shut down".into()));
        }
        if core.registry.current_device().is_none() {
            return Err(Error::NoDevice);
        }
        if core.state.is_working() {
            return Err(Error::Busy);
        }
        if !core.state.is_ready() {
            return Err(Error::NotReady(format!("session is {}", core.state.name())));
        }
        Ok(())
    }

    /// Start the flash workflow: flash, then verify and reset as configured.
    pub fn flash(&self) -> Result<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        Self::check_ready(&core)?;
        let image = core.firmware.clone().ok_or(Error::NoFirmware)?;

        if let Some(chip) = &core.chip {
            if !chip.fits(image.payload().len()) {
                return Err(Error::OperationFailed {
                    op: Operation::Flash,
                    reason: format!(
                        "image of {} bytes does not fit the {} bytes of {} flash",
                        image.payload().len(),
                        chip.flash_size_bytes,
                        chip.family_name
                    ),
                });
            }
        }

        core.workflow_payload = Some(image.payload_arc());
        if let Err(e) = inner.start_op(&mut core, Operation::Flash) {
            core.workflow_payload = None;
            return Err(e);
        }
        core.log(
            LogLevel::Info,
            format!(
                "Flashing {} ({} bytes, data from 0x{:08X})",
                image.source_name,
                image.payload().len(),
                image.base_address
            ),
        );
        Ok(())
    }

    /// Erase the code flash.
    pub fn erase(&self) -> Result<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        Self::check_ready(&core)?;
        inner.start_op(&mut core, Operation::Erase)?;
        core.log(LogLevel::Info, "Erasing chip");
        Ok(())
    }

    /// Connect again to the current device after a failure.
    pub fn reconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.shut_down {
            return Err(Error::NotReady("session is shut down".into()));
        }
        let device = core.registry.current_descriptor().cloned().ok_or(Error::NoDevice)?;
        if core.registry.permission() != Some(PermissionState::Granted) {
            return Err(Error::PermissionDenied(device.to_string()));
        }
        if !matches!(core.state, SessionState::Error(_) | SessionState::Disconnected) {
            return Err(Error::NotReady(format!("cannot reconnect while {}", core.state.name())));
        }
        core.log(LogLevel::Info, format!("Reconnecting to {device}"));
        inner.start_connect(&mut core, device);
        Ok(())
    }

    /// Block until `pred` holds for the state, or `timeout` passes.
    ///
    /// Returns the matching state, or `None` on timeout.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&SessionState) -> bool) -> Option<SessionState> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
        let mut core = self.inner.core.lock();
        loop {
            if pred(&core.state) {
                return Some(core.state.clone());
            }
            if self.inner.changed.wait_until(&mut core, deadline).timed_out() {
                return pred(&core.state).then(|| core.state.clone());
            }
        }
    }

    /// Stop processing events and close any held handle.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let lease = {
            let mut core = inner.core.lock();
            if core.shut_down {
                return;
            }
            core.shut_down = true;
            core.epoch += 1;
            core.pending_connect = false;
            core.chip = None;
            core.workflow_payload = None;
            core.log(LogLevel::Info, "Session shutting down");
            let lease = std::mem::take(&mut core.lease);
            inner.set_state(&mut core, SessionState::Disconnected);
            lease
        };

        if lease.handle.is_valid() {
            if let Some(mut gw) = inner.gateway.try_lock_for(SHUTDOWN_CLOSE_WAIT) {
                close_lease(&mut **gw, lease);
            } else {
                warn!("Engine still busy; closing handle {} in the background", lease.handle);
                inner.close_in_background(lease);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SimulatedGateway, SimulationConfig};
    use crate::image::MemorySource;

    const WAIT: Duration = Duration::from_secs(5);

    fn session() -> FlashSession {
        FlashSession::with_defaults(Box::new(SimulatedGateway::new(SimulationConfig::instant())))
    }

    fn isp() -> DeviceDescriptor {
        DeviceDescriptor::new(0x4348, 0x55E0, "", "sim:1")
    }

    #[test]
    fn test_flash_without_device_is_rejected() {
        let s = session();
        assert!(matches!(s.flash(), Err(Error::NoDevice)));
        assert!(matches!(s.erase(), Err(Error::NoDevice)));
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_flash_without_firmware_is_rejected() {
        let s = session();
        s.handle_event(&DeviceEvent::Attached(isp()));
        assert!(s.wait_for(WAIT, SessionState::is_ready).is_some());
        assert!(matches!(s.flash(), Err(Error::NoFirmware)));
        assert!(s.state().is_ready());
    }

    #[test]
    fn test_unsupported_device_leaves_state_alone() {
        let s = session();
        let rx = s.subscribe();
        s.handle_event(&DeviceEvent::Attached(DeviceDescriptor::new(0x0403, 0x6001, "", "tty")));
        assert_eq!(s.state(), SessionState::Disconnected);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Log(l) if l.message.contains("unsupported"))));
    }

    #[test]
    fn test_erase_returns_to_identified() {
        let s = session();
        s.handle_event(&DeviceEvent::Attached(isp()));
        s.wait_for(WAIT, SessionState::is_ready).unwrap();
        s.erase().unwrap();
        assert!(s.wait_for(WAIT, SessionState::is_ready).is_some());
    }

    #[test]
    fn test_select_bad_firmware_clears_selection() {
        let s = session();
        s.select_firmware(&MemorySource::new("app.bin", vec![0u8; 64])).unwrap();
        assert!(s.firmware().is_some());
        assert!(s.select_firmware(&MemorySource::new("app.txt", vec![0u8; 64])).is_err());
        assert!(s.firmware().is_none());
    }

    #[test]
    fn test_reconnect_requires_device() {
        assert!(matches!(session().reconnect(), Err(Error::NoDevice)));
    }

    #[test]
    fn test_shutdown_ignores_later_events() {
        let s = session();
        s.shutdown();
        s.handle_event(&DeviceEvent::Attached(isp()));
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(matches!(s.flash(), Err(Error::NotReady(_))));
    }
}
