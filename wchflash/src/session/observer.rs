//! Observable session output: state changes and timestamped log lines.

use super::state::SessionState;
use chrono::{DateTime, Local};
use std::fmt;
use std::sync::mpsc::Sender;

/// Severity of a session log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress.
    Info,
    /// Something the operator should notice.
    Warn,
    /// A failure.
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Local wall-clock time.
    pub timestamp: DateTime<Local>,
    /// Severity.
    pub level: LogLevel,
    /// Text.
    pub message: String,
}

impl LogLine {
    /// A line stamped with the current time.
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Something observers are told about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session state changed.
    StateChanged(SessionState),
    /// A log line was emitted.
    Log(LogLine),
}

/// Passive consumer of session events.
///
/// Called with the session lock held: implementations must return quickly
/// and must not call back into the session.
pub trait SessionObserver: Send {
    /// Handle one event. Returning `false` unsubscribes the observer.
    fn on_event(&mut self, event: &SessionEvent) -> bool;
}

/// Observer that forwards events into a channel.
///
/// Unsubscribes itself once the receiver is dropped.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: Sender<SessionEvent>,
}

impl ChannelObserver {
    /// Forward into `tx`.
    pub fn new(tx: Sender<SessionEvent>) -> Self {
        Self { tx }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_event(&mut self, event: &SessionEvent) -> bool {
        self.tx.send(event.clone()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_channel_observer_unsubscribes_when_receiver_dropped() {
        let (tx, rx) = channel();
        let mut obs = ChannelObserver::new(tx);
        let event = SessionEvent::Log(LogLine::now(LogLevel::Info, "hello"));
        assert!(obs.on_event(&event));
        assert_eq!(rx.recv().unwrap(), event);
        drop(rx);
        assert!(!obs.on_event(&event));
    }

    #[test]
    fn test_log_line_display() {
        let line = LogLine::now(LogLevel::Warn, "careful");
        let text = line.to_string();
        assert!(text.starts_with('['));
        assert!(text.ends_with("] careful"));
    }
}
