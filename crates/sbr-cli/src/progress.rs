// SPDX-License-Identifier: AGPL-3.0-only

//! Terminal progress for a run
//!
//! Draws the progress bar on stderr and hands the run log to a [`FileSink`].

use sbr_driver::{FileSink, ResultSink};
use std::io::Write;
use std::path::Path;

const BAR_WIDTH: usize = 50;

/// `Progress |█████-----| 50.0% Complete`
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn render_bar(current: u64, total: u64, width: usize) -> String {
    let fraction = if total == 0 {
        1.0
    } else {
        current.min(total) as f64 / total as f64
    };
    let filled = (fraction * width as f64) as usize;
    format!(
        "Progress |{}{}| {:.1}% Complete",
        "█".repeat(filled),
        "-".repeat(width - filled),
        fraction * 100.0
    )
}

/// File-backed sink with a live progress bar
#[derive(Debug)]
pub struct ConsoleSink {
    file: FileSink,
    show_bar: bool,
}

impl ConsoleSink {
    pub fn new(path: &Path, show_bar: bool) -> Self {
        Self {
            file: FileSink::new(path),
            show_bar,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl ResultSink for ConsoleSink {
    fn report_progress(&mut self, current: u64, total: u64) {
        if !self.show_bar {
            return;
        }
        let mut err = std::io::stderr().lock();
        let drawn = write!(err, "\r{}", render_bar(current, total, BAR_WIDTH))
            .and_then(|()| if current >= total { writeln!(err) } else { Ok(()) })
            .and_then(|()| err.flush());
        if let Err(e) = drawn {
            tracing::debug!("Progress bar not drawn: {e}");
        }
    }

    fn append(&mut self, lines: &[String]) {
        self.file.append(lines);
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_fills_proportionally() {
        assert_eq!(
            render_bar(1, 4, 8),
            "Progress |██------| 25.0% Complete"
        );
        assert_eq!(
            render_bar(3, 3, 4),
            "Progress |████| 100.0% Complete"
        );
        assert_eq!(render_bar(0, 0, 2), "Progress |██| 100.0% Complete");
    }

    #[test]
    fn log_goes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let mut sink = ConsoleSink::new(&path, false);

        sink.report_progress(1, 2);
        sink.append(&["Start Time: now".to_string()]);
        sink.flush().unwrap();

        assert_eq!(sink.path(), path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Start Time: now\n");
    }
}
