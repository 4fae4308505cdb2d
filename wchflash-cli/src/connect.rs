//! Session setup and the terminal side of a session.
//!
//! A [`Bench`] owns the flash session, its event loop and the device source:
//! the host watcher, or a simulated attach in `--simulate` mode. Commands
//! observe the session through a subscription and never block on an engine
//! call themselves.

use anyhow::{Context, Result, anyhow, bail};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use wchflash::device::watch::DEFAULT_POLL_INTERVAL;
use wchflash::{
    ChipIdentity, DeviceDescriptor, DeviceEvent, DeviceRegistry, DeviceWatcher, EngineMode,
    EnginePreference, FlashSession, ImplicitPermission, SessionConfig, SessionEvent, SessionState,
    bind_engine,
};

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

/// VID/PID of the device attached in simulated mode.
pub(crate) const SIMULATED_DEVICE: (u16, u16) = (0x4348, 0x55E0);

/// Granularity of interrupt checks while waiting.
const TICK: Duration = Duration::from_millis(100);

fn simulated_device(index: u32) -> DeviceDescriptor {
    DeviceDescriptor::new(
        SIMULATED_DEVICE.0,
        SIMULATED_DEVICE.1,
        "Simulated USB-ISP bootloader",
        format!("sim:{index}"),
    )
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Interrupted".into()).into()
}

/// A running session with its device source.
pub(crate) struct Bench {
    pub(crate) session: FlashSession,
    events: Sender<DeviceEvent>,
    event_loop: Option<JoinHandle<()>>,
    watcher: Option<DeviceWatcher>,
    simulated: Option<u32>,
}

impl Bench {
    /// Bind the engine, build the session and start feeding it devices.
    pub(crate) fn open(cli: &Cli, config: &Config, session_config: SessionConfig) -> Result<Self> {
        let mut engine = config.engine_config().context("Invalid [engine] configuration")?;
        if cli.simulate {
            engine.preference = EnginePreference::Simulated;
        }
        let (gateway, mode) = bind_engine(&engine, None)?;
        if mode == EngineMode::Simulated && !cli.quiet {
            eprintln!(
                "{} {}",
                style("⚠").yellow(),
                style("Using the simulated engine: nothing is written to a real chip").yellow()
            );
        }

        let allow = config.allow_list()?;
        let registry = DeviceRegistry::new(allow.clone(), Box::new(ImplicitPermission));
        let session = FlashSession::new(gateway, registry, session_config);

        let (events, rx) = channel();
        let event_loop = session.spawn_event_loop(rx).context("Failed to start the event loop")?;

        let mut bench = Self {
            session,
            events,
            event_loop: Some(event_loop),
            watcher: None,
            simulated: None,
        };
        if cli.simulate {
            bench.attach_simulated(0)?;
        } else {
            let watcher = DeviceWatcher::spawn(allow, DEFAULT_POLL_INTERVAL, bench.events.clone())
                .context("Failed to start the device watcher")?;
            bench.watcher = Some(watcher);
        }
        Ok(bench)
    }

    fn attach_simulated(&mut self, index: u32) -> Result<()> {
        debug!("Attaching simulated device sim:{index}");
        self.events
            .send(DeviceEvent::Attached(simulated_device(index)))
            .map_err(|_| anyhow!("session event loop stopped"))?;
        self.simulated = Some(index);
        Ok(())
    }

    /// Whether devices come from the simulator.
    pub(crate) fn is_simulated(&self) -> bool {
        self.simulated.is_some()
    }

    /// Unplug the simulated device and plug in a fresh one.
    pub(crate) fn replug_simulated(&mut self) -> Result<()> {
        let Some(index) = self.simulated else {
            return Ok(());
        };
        self.events
            .send(DeviceEvent::Detached(simulated_device(index)))
            .map_err(|_| anyhow!("session event loop stopped"))?;
        // the stale Identified state must not be taken for the next device
        self.wait_state(Some(Duration::from_secs(5)), |s| *s == SessionState::Disconnected)?
            .context("simulated device did not detach")?;
        self.attach_simulated(index + 1)
    }

    /// Poll the session until `pred` holds.
    ///
    /// `None` for `timeout` waits forever. Returns `Ok(None)` on timeout and
    /// a cancellation error on Ctrl-C.
    pub(crate) fn wait_state(
        &self,
        timeout: Option<Duration>,
        pred: impl Fn(&SessionState) -> bool,
    ) -> Result<Option<SessionState>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if was_interrupted() {
                return Err(cancelled());
            }
            if let Some(state) = self.session.wait_for(TICK, &pred) {
                return Ok(Some(state));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }

    /// Wait until a chip is identified.
    pub(crate) fn wait_ready(&self, cli: &Cli, timeout: Option<Duration>) -> Result<ChipIdentity> {
        let spinner = spinner(cli, "Waiting for a supported device...");
        let state = self.wait_state(timeout, |s| s.is_ready() || s.failure().is_some());
        spinner.finish_and_clear();

        match state? {
            Some(SessionState::Identified(chip)) => Ok(chip),
            Some(SessionState::Error(failure)) => Err(anyhow!("Connect failed: {}", failure.detail)),
            Some(other) => Err(anyhow!("Unexpected session state: {other}")),
            None => {
                let secs = timeout.map_or(0, |t| t.as_secs());
                bail!("No supported device became ready within {secs}s")
            },
        }
    }

    /// Start an operation and render it until the session settles.
    pub(crate) fn drive(
        &self,
        cli: &Cli,
        start: impl FnOnce(&FlashSession) -> wchflash::Result<()>,
    ) -> Result<ChipIdentity> {
        let rx = self.session.subscribe();
        start(&self.session)?;
        render(cli, &rx)
    }

    /// Stop the session and its device source.
    pub(crate) fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.session.shutdown();
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(event_loop) = self.event_loop.take() {
            let _ = event_loop.join();
        }
    }
}

impl Drop for Bench {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spinner(cli: &Cli, message: &'static str) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        if !cli.quiet {
            eprintln!("{} {message}", style("⏳").yellow());
        }
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

fn phase_line(cli: &Cli, pb: &ProgressBar, text: &str) {
    if cli.quiet {
        return;
    }
    pb.suspend(|| eprintln!("{} {text}", style("→").cyan()));
}

/// Render state changes until the session is ready again or fails.
fn render(cli: &Cli, rx: &Receiver<SessionEvent>) -> Result<ChipIdentity> {
    let pb = progress_bar(cli);
    let mut started = false;
    let mut last_phase = "";

    loop {
        if was_interrupted() {
            pb.abandon();
            return Err(cancelled());
        }
        let state = match rx.recv_timeout(TICK) {
            Ok(SessionEvent::StateChanged(state)) => state,
            Ok(SessionEvent::Log(_)) | Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("Session stopped"),
        };

        if state.name() != last_phase {
            last_phase = state.name();
            match &state {
                SessionState::Flashing { .. } => {
                    pb.reset();
                    phase_line(cli, &pb, "Flashing");
                },
                SessionState::Erasing => phase_line(cli, &pb, "Erasing"),
                SessionState::Verifying => phase_line(cli, &pb, "Verifying"),
                SessionState::Resetting => phase_line(cli, &pb, "Resetting"),
                _ => {},
            }
        }

        match state {
            SessionState::Flashing { progress } => {
                started = true;
                pb.set_position(u64::from(progress));
                if progress == 100 {
                    pb.finish();
                }
            },
            SessionState::Erasing | SessionState::Verifying | SessionState::Resetting => started = true,
            SessionState::Identified(chip) if started => {
                pb.finish_and_clear();
                return Ok(chip);
            },
            SessionState::Error(failure) => {
                pb.abandon();
                bail!("{}", failure.detail);
            },
            SessionState::Disconnected if started => {
                pb.abandon();
                bail!("Device detached during the operation");
            },
            _ => {},
        }
    }
}
