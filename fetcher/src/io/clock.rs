//! Wall-clock strings for prompts and log lines.

use chrono::Local;

/// Format shared by prompts and the agent log.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait Clock: Send + Sync {
    /// Current local time as `YYYY-mm-dd HH:MM:SS`.
    fn now_string(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_string(&self) -> String {
        Local::now().format(TIMESTAMP_FORMAT).to_string()
    }
}
