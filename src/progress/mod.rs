use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::format::human_duration;

/// Spinner shown while one startup stage runs.
pub struct Progress {
    spinner: Option<ProgressBar>,
    started: Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            spinner: None,
            started: Instant::now(),
        }
    }

    pub fn spinner(&mut self, message: &str) {
        self.stop_and_clear();
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]") {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(spinner);
        self.started = Instant::now();
    }

    /// Replaces the spinner with `message` and the stage duration.
    pub fn finish(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_with_message(format!("{} ({})", message, human_duration(self.started.elapsed())));
        }
    }

    pub fn stop_and_clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.stop_and_clear();
    }
}
