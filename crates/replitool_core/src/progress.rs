use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::config::is_ci;

const SPINNER_FRAMES: [char; 8] = ['⣾', '⣽', '⣻', '⢿', '⡿', '⣟', '⣯', '⣷'];
const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if bytes < 1024 {
        format!("{bytes} B")
    } else if value < KB * KB {
        format!("{:.1} KB", value / KB)
    } else if value < KB * KB * KB {
        format!("{:.1} MB", value / (KB * KB))
    } else {
        format!("{:.1} GB", value / (KB * KB * KB))
    }
}

/// Sink for streamed byte counts.
pub trait ProgressSink {
    fn advance(&mut self, bytes: u64);
}

/// Spinner line on stderr. Suppressed in CI, where only the final line is printed.
#[derive(Debug)]
pub struct Progress {
    label: String,
    total: Option<u64>,
    done: u64,
    frame: usize,
    interactive: bool,
    last_draw: Option<Instant>,
}

impl Progress {
    pub fn new(label: impl Into<String>, total: Option<u64>) -> Self {
        Self::with_mode(label, total, !is_ci())
    }

    pub fn with_mode(label: impl Into<String>, total: Option<u64>, interactive: bool) -> Self {
        Self {
            label: label.into(),
            total: total.filter(|value| *value > 0),
            done: 0,
            frame: 0,
            interactive,
            last_draw: None,
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn summary(&self) -> String {
        let mut line = format!("Downloaded: {}", format_bytes(self.done));
        if let Some(total) = self.total {
            let percent = if total == 0 {
                100.0
            } else {
                (self.done as f64 / total as f64) * 100.0
            };
            line.push_str(&format!(" of {} ({percent:.1}%)", format_bytes(total)));
        }
        line
    }

    pub fn finish(&mut self) {
        let mut stderr = io::stderr();
        if self.interactive {
            let _ = write!(stderr, "\r{}\r", " ".repeat(self.label.len() + 60));
        }
        let _ = writeln!(stderr, "{}", self.summary());
        let _ = stderr.flush();
    }

    fn redraw(&mut self) {
        if !self.interactive {
            return;
        }
        if let Some(last) = self.last_draw
            && last.elapsed() < REDRAW_INTERVAL
        {
            return;
        }
        let frame = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
        self.frame = self.frame.wrapping_add(1);
        self.last_draw = Some(Instant::now());
        let mut stderr = io::stderr();
        let _ = write!(stderr, "\r{frame} {}", self.summary());
        let _ = stderr.flush();
    }
}

impl ProgressSink for Progress {
    fn advance(&mut self, bytes: u64) {
        self.done = self.done.saturating_add(bytes);
        self.redraw();
    }
}

/// Discards progress; used by tests and quiet callers.
#[derive(Debug, Default)]
pub struct NoProgress {
    pub bytes: u64,
}

impl ProgressSink for NoProgress {
    fn advance(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }
}
