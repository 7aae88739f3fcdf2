//! Reporting surface for engine progress.
//!
//! The engine never writes to stderr itself; it talks to a [`Reporter`]
//! supplied by the caller (the CLI installs a level-filtered stderr
//! implementation). Durable evidence goes to the JSONL event log instead.

use std::fmt;
use std::str::FromStr;

/// Verbosity threshold, configured via `MFP_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Progress sink for compile and serve.
pub trait Reporter {
    fn debug(&mut self, msg: &str);
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Discards everything; used in tests.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn debug(&mut self, _msg: &str) {}
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Level-filtered stderr reporter.
#[derive(Debug)]
pub struct StderrReporter {
    min_level: LogLevel,
}

impl StderrReporter {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }

    fn emit(&self, level: LogLevel, msg: &str) {
        if level >= self.min_level {
            eprintln!("[{level}] {msg}");
        }
    }
}

impl Reporter for StderrReporter {
    fn debug(&mut self, msg: &str) {
        self.emit(LogLevel::Debug, msg);
    }

    fn info(&mut self, msg: &str) {
        self.emit(LogLevel::Info, msg);
    }

    fn warn(&mut self, msg: &str) {
        self.emit(LogLevel::Warn, msg);
    }

    fn error(&mut self, msg: &str) {
        self.emit(LogLevel::Error, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_and_order() {
        assert_eq!("debug".parse::<LogLevel>().expect("parse"), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().expect("parse"), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Debug < LogLevel::Error);
    }
}
