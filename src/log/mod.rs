//! Supervision log - JSON lines per project.
//!
//! Records session lifecycle, workflow progress and intervention events as
//! they cross the bus. Each line is a self-contained JSON object with an RFC
//! 3339 timestamp, so the log can be grepped, tailed or post-processed.
//! Raw session output is not logged.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::events::{Event, SessionEvent};

#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: &'a Event,
}

/// Writer for the JSON lines supervision log.
pub struct SupervisionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl SupervisionLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: &Event) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Output chunks are too noisy for the log.
fn is_logged(event: &Event) -> bool {
    !matches!(event, Event::Session(SessionEvent::Output { .. }))
}

/// Drain `events` into `log` on a background thread until the bus goes away.
pub fn spawn_writer(log: SupervisionLog, events: mpsc::Receiver<Event>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        debug!(path = %log.path().display(), "supervision log writer started");
        for event in events.iter().filter(is_logged) {
            if let Err(e) = log.log(&event) {
                warn!(path = %log.path().display(), error = %format!("{e:#}"), "supervision log write failed");
            }
        }
    })
}
