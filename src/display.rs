//! Progress line rendering.
//!
//! The coordinator owns a [`ProgressSink`] and is the only writer, except
//! while progress headers are being sniffed on the raw-socket path, where the
//! sniffer borrows it exclusively and every call is flushed before returning.

use std::io::{self, Write};
use std::time::Duration;

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};

/// Braille spinner frames, advanced once per rendered progress line.
const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Single-line progress indicator plus operator notices.
pub trait ProgressSink: Send {
    /// Renders (replaces) the progress line.
    fn write_progress(
        &mut self,
        read_rows: u64,
        read_bytes: u64,
        total_rows_approx: u64,
        elapsed: Duration,
    ) -> io::Result<()>;

    /// Erases the progress line if one is shown.
    fn clear_progress(&mut self) -> io::Result<()>;

    /// Writes an operator-visible message.
    fn notice(&mut self, message: &str) -> io::Result<()>;
}

/// Renders progress on a terminal-like writer (normally stderr).
pub struct TerminalProgress<W: Write + Send> {
    out: W,
    enabled: bool,
    visible: bool,
    frame: usize,
}

impl<W: Write + Send> TerminalProgress<W> {
    /// Creates a renderer. With `enabled == false` only notices are written,
    /// which keeps redirected stderr free of control sequences.
    pub fn new(out: W, enabled: bool) -> Self {
        Self {
            out,
            enabled,
            visible: false,
            frame: 0,
        }
    }

    /// Consumes the renderer and returns the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ProgressSink for TerminalProgress<W> {
    fn write_progress(
        &mut self,
        read_rows: u64,
        read_bytes: u64,
        total_rows_approx: u64,
        elapsed: Duration,
    ) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let spinner = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
        self.frame = self.frame.wrapping_add(1);
        let line = format!(
            "{spinner} {}",
            format_progress(read_rows, read_bytes, total_rows_approx, elapsed)
        );

        queue!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(line)
        )?;
        self.out.flush()?;
        self.visible = true;
        Ok(())
    }

    fn clear_progress(&mut self) -> io::Result<()> {
        if !self.visible {
            return Ok(());
        }
        queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        self.out.flush()?;
        self.visible = false;
        Ok(())
    }

    fn notice(&mut self, message: &str) -> io::Result<()> {
        self.out.write_all(message.as_bytes())?;
        self.out.flush()
    }
}

/// Formats the text of a progress line.
pub fn format_progress(
    read_rows: u64,
    read_bytes: u64,
    total_rows_approx: u64,
    elapsed: Duration,
) -> String {
    let mut line = format!(
        "Progress: {} rows, {}",
        format_count(read_rows),
        format_bytes(read_bytes)
    );

    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        line.push_str(&format!(
            " ({} rows/s., {}/s.)",
            format_count((read_rows as f64 / secs) as u64),
            format_bytes((read_bytes as f64 / secs) as u64)
        ));
    }

    if total_rows_approx > 0 {
        let percent = (read_rows as f64 * 100.0 / total_rows_approx as f64).min(100.0);
        line.push_str(&format!(" {percent:.0}%"));
    }

    line.push_str(&format!(" elapsed {secs:.1}s"));
    line
}

/// Formats a row count with thousands separators.
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Formats a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Formats the wall-clock time reported after completion.
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.3}s", elapsed.as_secs_f64())
}
