//! File I/O accounting: a tracing observer and an append-only JSON-lines log.

use anyhow::{Context, Result};
use modelsync_core::{IoActivity, IoObserver};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::lock;

/// Logs every file read and write at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingIoObserver;

impl IoObserver for TracingIoObserver {
    fn on_io_activity(&self, activity: &IoActivity) {
        tracing::debug!(
            endpoint = %activity.endpoint_id,
            direction = ?activity.direction,
            bytes = activity.bytes,
            "File I/O"
        );
    }
}

/// Appends one JSON object per file read or write.
#[derive(Clone)]
pub struct ActivityLog {
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl ActivityLog {
    /// Open (or create) the log in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening activity log {}", path.display()))?;
        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    fn write_json(&self, activity: &IoActivity) {
        let mut guard = lock(&self.writer);
        if serde_json::to_writer(&mut *guard, activity).is_ok() {
            let _ = guard.write_all(b"\n");
            let _ = guard.flush();
        }
    }
}

impl IoObserver for ActivityLog {
    fn on_io_activity(&self, activity: &IoActivity) {
        self.write_json(activity);
    }
}

/// Forwards each record to every registered observer in order.
#[derive(Clone, Default)]
pub struct IoFanout {
    observers: Vec<Arc<dyn IoObserver>>,
}

impl IoFanout {
    /// Empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.
    pub fn with(mut self, observer: Arc<dyn IoObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl IoObserver for IoFanout {
    fn on_io_activity(&self, activity: &IoActivity) {
        for observer in &self.observers {
            observer.on_io_activity(activity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelsync_core::{EndpointId, IoDirection};

    #[test]
    fn activity_log_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/activity.jsonl");
        let log = ActivityLog::open(&path).expect("log opens");
        log.on_io_activity(&IoActivity::now(
            EndpointId::from("W1"),
            IoDirection::FileWrite,
            42,
        ));
        log.on_io_activity(&IoActivity::now(
            EndpointId::from("R1"),
            IoDirection::FileRead,
            7,
        ));

        let text = std::fs::read_to_string(&path).expect("log readable");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["endpoint_id"], "W1");
        assert_eq!(lines[0]["direction"], "file_write");
        assert_eq!(lines[0]["bytes"], 42);
        assert_eq!(lines[1]["direction"], "file_read");
    }

    #[test]
    fn fanout_reaches_every_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        let fanout = IoFanout::new()
            .with(Arc::new(move |activity: &IoActivity| {
                lock(&first).push(("first", activity.bytes));
            }))
            .with(Arc::new(move |activity: &IoActivity| {
                lock(&second).push(("second", activity.bytes));
            }));
        fanout.on_io_activity(&IoActivity::now(
            EndpointId::from("W1"),
            IoDirection::FileWrite,
            3,
        ));
        assert_eq!(*lock(&seen), vec![("first", 3), ("second", 3)]);
    }
}
