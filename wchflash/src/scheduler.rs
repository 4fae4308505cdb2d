//! Runs long engine calls off the caller's thread, one at a time, each with
//! a deadline.
//!
//! A submitted operation runs on its own worker thread. A waiter thread
//! waits for the result up to the deadline and hands the [`Outcome`] to the
//! completion callback. The worker cannot be interrupted, so when the
//! deadline passes the callback first gets [`Outcome::TimedOut`] and later,
//! if the worker ever finishes, [`Outcome::Late`] with the result. Callers
//! use the late result only to release resources (a handle that was opened
//! after its connect timed out, for example).

use crate::error::{Error, Result};
use log::{debug, error, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// How a scheduled operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation returned within its deadline.
    Finished(T),
    /// The deadline passed first.
    TimedOut,
    /// The operation returned after its deadline had already been reported.
    Late(T),
    /// The worker ended without producing a result.
    Abandoned,
}

impl<T> Outcome<T> {
    /// The value of a `Finished` outcome.
    pub fn finished(self) -> Option<T> {
        match self {
            Self::Finished(v) => Some(v),
            _ => None,
        }
    }
}

/// Serializes long-running operations.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    busy: Arc<AtomicBool>,
}

/// Clears the busy flag once, at the latest when dropped, so an unwinding
/// waiter never leaves the scheduler stuck.
struct BusyGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl BusyGuard {
    fn release(&mut self) {
        if self.armed {
            self.armed = false;
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl Scheduler {
    /// A scheduler with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start `op` in the background.
    ///
    /// Returns [`Error::Busy`] when another operation is in flight. The busy
    /// flag is cleared before `on_complete` sees the first outcome, so the
    /// callback may submit a follow-up operation.
    pub fn submit<T, F, C>(&self, label: &'static str, timeout: Duration, op: F, on_complete: C) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnMut(Outcome<T>) + Send + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Rejecting {label}: another operation is in flight");
            return Err(Error::Busy);
        }
        let mut guard = BusyGuard {
            flag: Arc::clone(&self.busy),
            armed: true,
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("wchflash-{label}"))
            .spawn(move || {
                // The receiver is gone only if the waiter itself died.
                let _ = tx.send(op());
            })?;

        let waiter = thread::Builder::new()
            .name(format!("wchflash-{label}-wait"))
            .spawn(move || Self::wait(label, timeout, &rx, &mut guard, on_complete));
        if let Err(e) = waiter {
            // The worker still runs; its result is dropped.
            error!("Failed to start waiter for {label}: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    fn wait<T, C>(label: &str, timeout: Duration, rx: &mpsc::Receiver<T>, guard: &mut BusyGuard, mut on_complete: C)
    where
        C: FnMut(Outcome<T>),
    {
        match rx.recv_timeout(timeout) {
            Ok(value) => {
                guard.release();
                on_complete(Outcome::Finished(value));
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!("{label} did not finish within {}s", timeout.as_secs_f32());
                guard.release();
                on_complete(Outcome::TimedOut);
                if let Ok(value) = rx.recv() {
                    debug!("{label} finished after its deadline");
                    on_complete(Outcome::Late(value));
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                error!("{label} worker exited without a result");
                guard.release();
                on_complete(Outcome::Abandoned);
            },
        }
    }

    /// Run `op` and block until it finishes or `timeout` passes.
    ///
    /// A result that arrives after the deadline is dropped.
    pub fn run<T, F>(&self, label: &'static str, timeout: Duration, op: F) -> Result<Outcome<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.submit(label, timeout, op, move |outcome| {
            if !matches!(outcome, Outcome::Late(_)) {
                let _ = tx.send(outcome);
            }
        })?;
        Ok(rx.recv().unwrap_or(Outcome::Abandoned))
    }

    /// Run `op` in the background without taking the busy slot.
    ///
    /// Used for cleanup that must not block the caller, such as closing a
    /// handle after a detach.
    pub fn spawn_detached<F>(label: &'static str, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = thread::Builder::new().name(format!("wchflash-{label}")).spawn(op) {
            error!("Failed to start {label}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Instant;

    #[test]
    fn test_run_returns_result() {
        let s = Scheduler::new();
        assert_eq!(s.run("add", Duration::from_secs(5), || 2 + 2).unwrap(), Outcome::Finished(4));
        assert!(!s.is_busy());
    }

    #[test]
    fn test_run_times_out_without_blocking_past_deadline() {
        let s = Scheduler::new();
        let start = Instant::now();
        let outcome = s
            .run("sleepy", Duration::from_millis(50), || {
                thread::sleep(Duration::from_millis(500));
                1
            })
            .unwrap();
        assert_eq!(outcome, Outcome::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(400));
        assert!(!s.is_busy());
    }

    #[test]
    fn test_second_submit_is_rejected() {
        let s = Scheduler::new();
        let (release_tx, release_rx) = channel::<()>();
        let (done_tx, done_rx) = channel();
        s.submit(
            "blocker",
            Duration::from_secs(5),
            move || release_rx.recv().is_ok(),
            move |o| {
                let _ = done_tx.send(o);
            },
        )
        .unwrap();
        assert!(s.is_busy());
        assert!(matches!(
            s.submit("second", Duration::from_secs(1), || (), |_| {}),
            Err(Error::Busy)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(done_rx.recv().unwrap(), Outcome::Finished(true));
        assert!(!s.is_busy());
    }

    #[test]
    fn test_late_result_is_delivered_after_timeout() {
        let s = Scheduler::new();
        let (tx, rx) = channel();
        s.submit(
            "late",
            Duration::from_millis(20),
            || {
                thread::sleep(Duration::from_millis(100));
                7
            },
            move |o| {
                let _ = tx.send(o);
            },
        )
        .unwrap();
        assert_eq!(rx.recv().unwrap(), Outcome::TimedOut);
        assert_eq!(rx.recv().unwrap(), Outcome::Late(7));
    }

    #[test]
    fn test_callback_may_submit_follow_up() {
        let s = Scheduler::new();
        let chained = s.clone();
        let (tx, rx) = channel();
        s.submit(
            "first",
            Duration::from_secs(5),
            || 1,
            move |_| {
                let tx = tx.clone();
                let result = chained.submit("second", Duration::from_secs(5), || 2, move |o| {
                    let _ = tx.send(o);
                });
                assert!(result.is_ok());
            },
        )
        .unwrap();
        assert_eq!(rx.recv().unwrap(), Outcome::Finished(2));
    }

    #[test]
    fn test_panicking_worker_is_abandoned() {
        let s = Scheduler::new();
        let outcome = s
            .run("boom", Duration::from_secs(5), || -> u8 { panic!("worker failure") })
            .unwrap();
        assert_eq!(outcome, Outcome::Abandoned);
        assert!(!s.is_busy());
    }
}
