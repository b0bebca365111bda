//! Agent log: the human-readable narrative of a fetch session.
//!
//! This is product output, separate from `tracing` diagnostics. Sinks are
//! fire-and-forget; a failing sink never interrupts a session.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::io::clock::Clock;

pub trait LogSink: Send + Sync {
    fn append_log(&self, message: &str);
}

/// Forwards agent log lines to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append_log(&self, message: &str) {
        info!(target: "fetcher::agent", "{message}");
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn append_log(&self, _message: &str) {}
}

enum WriterMsg {
    Append(String),
    /// Truncate the file, then write this entry.
    Reset(String),
    Flush(Sender<()>),
}

/// Appends `[YYYY-mm-dd HH:MM:SS] message` lines to a file from a background
/// thread and keeps the most recent `max_lines` entries in memory.
pub struct FileLogSink {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    max_lines: usize,
    recent: Mutex<VecDeque<String>>,
    sender: Mutex<Option<Sender<WriterMsg>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileLogSink {
    /// Open (or create) the log file and load its tail.
    pub fn open(path: &Path, max_lines: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        if !path.exists() {
            let entry = format_entry(clock.as_ref(), "log initialized");
            fs::write(path, &entry).with_context(|| format!("create log {}", path.display()))?;
        }

        let contents =
            fs::read_to_string(path).with_context(|| format!("read log {}", path.display()))?;
        let lines: Vec<&str> = contents.lines().collect();
        let recent: VecDeque<String> = lines[lines.len().saturating_sub(max_lines)..]
            .iter()
            .map(|line| format!("{line}\n"))
            .collect();

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("open log {}", path.display()))?;
        let (sender, receiver) = mpsc::channel();
        let writer_path = path.to_path_buf();
        let writer = thread::Builder::new()
            .name("fetcher-log-writer".to_string())
            .spawn(move || run_writer(writer_path, file, receiver))
            .context("spawn log writer")?;

        Ok(Self {
            path: path.to_path_buf(),
            clock,
            max_lines,
            recent: Mutex::new(recent),
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recent entries, oldest first, newline-terminated.
    pub fn recent(&self) -> String {
        match self.recent.lock() {
            Ok(recent) => recent.iter().map(String::as_str).collect(),
            Err(_) => String::new(),
        }
    }

    /// Truncate the file and the in-memory tail, leaving one "log cleared" entry.
    pub fn clear(&self) {
        let entry = format_entry(self.clock.as_ref(), "log cleared");
        if let Ok(mut recent) = self.recent.lock() {
            recent.clear();
            recent.push_back(entry.clone());
        }
        self.send(WriterMsg::Reset(entry));
    }

    /// Block until everything sent so far has reached the file.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.send(WriterMsg::Flush(ack_tx)) {
            let _ = ack_rx.recv();
        }
    }

    fn send(&self, msg: WriterMsg) -> bool {
        let Ok(sender) = self.sender.lock() else {
            return false;
        };
        match sender.as_ref() {
            Some(sender) => sender.send(msg).is_ok(),
            None => false,
        }
    }
}

impl LogSink for FileLogSink {
    fn append_log(&self, message: &str) {
        let entry = format_entry(self.clock.as_ref(), message);
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.max_lines {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }
        if !self.send(WriterMsg::Append(entry)) {
            warn!(path = %self.path.display(), "agent log writer is gone, dropping entry");
        }
    }
}

impl Drop for FileLogSink {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut writer) = self.writer.lock()
            && let Some(handle) = writer.take()
        {
            let _ = handle.join();
        }
    }
}

fn format_entry(clock: &dyn Clock, message: &str) -> String {
    format!("[{}] {message}\n", clock.now_string())
}

fn run_writer(path: PathBuf, mut file: File, receiver: Receiver<WriterMsg>) {
    for msg in receiver {
        let written = match msg {
            WriterMsg::Append(entry) => file.write_all(entry.as_bytes()),
            WriterMsg::Reset(entry) => File::create(&path).and_then(|mut fresh| {
                fresh.write_all(entry.as_bytes())?;
                file = OpenOptions::new().append(true).open(&path)?;
                Ok(())
            }),
            WriterMsg::Flush(ack) => {
                let flushed = file.flush();
                let _ = ack.send(());
                flushed
            }
        };
        if let Err(err) = written {
            warn!(path = %path.display(), err = %err, "failed to write agent log");
        }
    }
}
