//! Append-only JSONL event log.
//!
//! Compile and execution evidence lands in `events.jsonl` under the state
//! directory: one JSON object per line, append-only, safe to tail. Events
//! carry classifications and ids only; submitted code and credential values
//! never appear here.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default events file name inside the state directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// One logged occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfpEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    CompileStarted {
        source_count: usize,
    },
    SourceSkipped {
        server: String,
        reason: String,
    },
    SourceCompiled {
        server: String,
        endpoint_count: usize,
    },
    SourceFailed {
        server: String,
        reason: String,
    },
    ExecutionFinished {
        /// Last state-machine phase reached.
        phase: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_id: Option<String>,
        duration_ms: u64,
    },
}

impl MfpEvent {
    pub fn now(kind: EventKind) -> Self {
        Self { timestamp: Utc::now(), kind }
    }
}

/// Append-only writer over the events file. Cloneable and safe to share:
/// each append opens the file in append mode and writes one line.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(state_dir: &Path) -> Self {
        Self { path: events_path(state_dir) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Failures are returned, not panicked; callers treat
    /// evidence loss as a warning.
    pub fn append(&self, event: &MfpEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }
        let line = serde_json::to_string(event).context("failed to serialize event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open events file {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append event to {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_writes_one_line_per_event() {
        let td = tempdir().expect("tempdir");
        let log = EventLog::new(td.path());

        log.append(&MfpEvent::now(EventKind::CompileStarted { source_count: 2 }))
            .expect("append");
        log.append(&MfpEvent::now(EventKind::SourceCompiled {
            server: "weather".to_string(),
            endpoint_count: 3,
        }))
        .expect("append");

        let content = fs::read_to_string(log.path()).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"compile_started\""));
        assert!(lines[1].contains("\"weather\""));

        // Every line is standalone JSON.
        for line in lines {
            let _: MfpEvent = serde_json::from_str(line).expect("parse line");
        }
    }

    #[test]
    fn execution_event_serializes_classification_only() {
        let event = MfpEvent::now(EventKind::ExecutionFinished {
            phase: "Done".to_string(),
            success: true,
            error_type: None,
            cache_id: Some("abc".to_string()),
            duration_ms: 120,
        });
        let json = serde_json::to_string(&event).expect("json");
        assert!(json.contains("\"execution_finished\""));
        assert!(!json.contains("error_type"));
    }
}
