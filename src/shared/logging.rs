use crate::shared::clock::{format_millis_rfc3339, Clock, SystemClock};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Appends JSON lines `{timestamp, level, event, message}` to a log file.
///
/// Write failures are swallowed: logging must never fail the caller.
#[derive(Clone)]
pub struct Logger {
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("path", &self.path).finish()
    }
}

impl Logger {
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            clock: Arc::new(SystemClock),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            clock: Arc::new(SystemClock),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn debug(&self, event: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, event, message.as_ref());
    }

    pub fn info(&self, event: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Info, event, message.as_ref());
    }

    pub fn warn(&self, event: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, event, message.as_ref());
    }

    pub fn error(&self, event: &str, message: impl AsRef<str>) {
        self.log(LogLevel::Error, event, message.as_ref());
    }

    pub fn log(&self, level: LogLevel, event: &str, message: &str) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let payload = serde_json::json!({
            "timestamp": format_millis_rfc3339(self.clock.now_millis()),
            "level": level.as_str(),
            "event": event,
            "message": message,
        });
        let Ok(line) = serde_json::to_string(&payload) else {
            return;
        };

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::clock::ManualClock;

    #[test]
    fn log_lines_are_json_objects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/runtime.log");
        let logger = Logger::to_file(&path).with_clock(Arc::new(ManualClock::new(0)));
        logger.info("engine.started", "workers=2");
        logger.warn("profiles.list.skipped", "bad file");

        let raw = fs::read_to_string(&path).expect("read log");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["level"], "info");
        assert_eq!(first["event"], "engine.started");
        assert_eq!(first["timestamp"], "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = Logger::disabled();
        logger.error("noop", "ignored");
        assert!(logger.path().is_none());
    }
}
