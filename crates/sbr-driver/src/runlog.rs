// SPDX-License-Identifier: AGPL-3.0-only

//! Run log and result sinks
//!
//! The [`RunLog`] is an append-only list of lines owned by whoever is driving
//! the run. Sinks only see it at checkpoints, via [`RunLog::flush_to`].

use crate::clock::format_timestamp;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Ordered, append-only event log of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    /// An empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// A log opened with its start timestamp
    pub fn started(at: OffsetDateTime) -> Self {
        let mut log = Self::new();
        log.push(format!("Start Time: {}", format_timestamp(at)));
        log
    }

    /// Append one line
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Append several lines
    pub fn extend(&mut self, lines: impl IntoIterator<Item = String>) {
        self.lines.extend(lines);
    }

    /// All lines so far
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether nothing was logged
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Hand the whole log to `sink` and flush it.
    ///
    /// # Errors
    ///
    /// Returns the sink's I/O error.
    pub fn flush_to(&self, sink: &mut dyn ResultSink) -> std::io::Result<()> {
        sink.append(&self.lines);
        sink.flush()
    }
}

/// Where progress and the run log end up
pub trait ResultSink {
    /// Progress after `current` of `total` drive operations
    fn report_progress(&mut self, current: u64, total: u64);

    /// Buffer log lines
    fn append(&mut self, lines: &[String]);

    /// Persist buffered lines
    ///
    /// # Errors
    ///
    /// Returns an I/O error if persisting fails.
    fn flush(&mut self) -> std::io::Result<()>;
}

/// Writes the run log to a text file, one event per line.
///
/// The first flush truncates the file; later flushes in the same run append.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    pending: Vec<String>,
    truncated: bool,
}

impl FileSink {
    /// Log to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Vec::new(),
            truncated: false,
        }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for FileSink {
    fn report_progress(&mut self, _current: u64, _total: u64) {}

    fn append(&mut self, lines: &[String]) {
        self.pending.extend_from_slice(lines);
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!self.truncated)
            .append(self.truncated)
            .open(&self.path)?;
        self.truncated = true;

        let mut out = BufWriter::new(file);
        for line in self.pending.drain(..) {
            writeln!(out, "{line}")?;
        }
        out.flush()?;

        tracing::debug!("Run log written to {}", self.path.display());
        Ok(())
    }
}

/// Keeps everything in memory; counts flushes
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Lines appended so far
    pub lines: Vec<String>,
    /// Last progress report
    pub progress: Option<(u64, u64)>,
    /// Number of progress reports
    pub progress_reports: u64,
    /// Number of flushes
    pub flushes: u32,
}

impl MemorySink {
    /// An empty sink
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for MemorySink {
    fn report_progress(&mut self, current: u64, total: u64) {
        self.progress = Some((current, total));
        self.progress_reports += 1;
    }

    fn append(&mut self, lines: &[String]) {
        self.lines.extend_from_slice(lines);
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
