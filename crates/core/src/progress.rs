//! Textual progress meter: spinner and bar redrawn in place on stderr as
//! prompts complete. Purely observational, no effect on scheduling.

use std::io::{self, Write};

const SPINNER: &[char] = &['|', '/', '-', '\\'];
const BAR_WIDTH: usize = 30;

/// Tracks completed prompts and redraws a one-line indicator per finalize.
#[derive(Debug)]
pub struct ProgressMeter {
    enabled: bool,
    total: usize,
    completed: usize,
    spinner_index: usize,
}

impl ProgressMeter {
    pub fn new(total: usize, enabled: bool) -> Self {
        Self {
            enabled,
            total,
            completed: 0,
            spinner_index: 0,
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Record one completed prompt and redraw the indicator.
    pub fn tick(&mut self) {
        let line = self.advance();
        if self.enabled {
            let mut err = io::stderr();
            let _ = write!(err, "\r {line}");
            let _ = err.flush();
        }
    }

    /// Count the completion and produce the indicator line. The spinner
    /// frame advances after it is drawn, so the first tick renders `|`.
    fn advance(&mut self) -> String {
        self.completed = (self.completed + 1).min(self.total);
        let line = self.render();
        self.spinner_index = (self.spinner_index + 1) % SPINNER.len();
        line
    }

    /// Print the closing full-bar line. Called on success and on abort, so
    /// an interrupted run still leaves the terminal on a fresh line.
    pub fn finish(&self) {
        if self.enabled {
            let line = self.render_final();
            let mut err = io::stderr();
            let _ = writeln!(err, "\r {line}");
            let _ = err.flush();
        }
    }

    fn render(&self) -> String {
        let total = self.total.max(1);
        let filled = self.completed * BAR_WIDTH / total;
        let pct = (100.0 * self.completed as f64 / total as f64).round();
        format!(
            "{} [{}{}] {}/{} ({:3.0}%)",
            SPINNER[self.spinner_index],
            "=".repeat(filled),
            " ".repeat(BAR_WIDTH - filled),
            self.completed,
            self.total,
            pct
        )
    }

    fn render_final(&self) -> String {
        format!(
            "[{}] {}/{} (100%)",
            "=".repeat(BAR_WIDTH),
            self.total,
            self.total
        )
    }
}
