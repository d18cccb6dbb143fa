use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::pipeline::{PipelineStats, PipelineStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Terminal reporting for the daemon: startup stages and a live status line.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    fn spinner(&self, template: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = self.spinner("{spinner} {msg}");
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    pub fn status_line(&self) -> StatusLine {
        let spinner = self.pretty().then(|| self.spinner("{spinner} [{elapsed}] {msg}"));
        StatusLine {
            spinner,
            last_status: None,
        }
    }
}

/// A startup stage. Reports success with its duration when dropped.
pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failure: Option<String>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failure: None,
        }
    }

    pub fn fail(mut self, reason: &str) {
        self.failure = Some(reason.to_string());
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = format_duration(self.start.elapsed());
        let message = match &self.failure {
            Some(reason) => format!("✘ {} ({}): {}", self.name, elapsed, reason),
            None => format!("✔ {} ({})", self.name, elapsed),
        };
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// Session status display. Plain mode prints only status changes.
pub struct StatusLine {
    spinner: Option<ProgressBar>,
    last_status: Option<PipelineStatus>,
}

impl StatusLine {
    pub fn update(&mut self, stats: &PipelineStats) {
        match &self.spinner {
            Some(spinner) => spinner.set_message(summarize(stats)),
            None => {
                if self.last_status.as_ref() != Some(&stats.status) {
                    eprintln!("--> {}", stats.status);
                }
            }
        }
        self.last_status = Some(stats.status.clone());
    }

    pub fn finish(self, message: &str) {
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => eprintln!("{message}"),
        }
    }
}

fn summarize(stats: &PipelineStats) -> String {
    format!(
        "{} | {} captured, {} processed, {} skipped, {} failed | backend {}",
        stats.status,
        stats.capture.frames_captured,
        stats.frames_processed,
        stats.frames_skipped + stats.inference.skipped,
        stats.inference.failed,
        stats.capture.backend.unwrap_or("-")
    )
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn plain_mode_is_used_without_tty() {
        assert!(!Ui::new(UiMode::Pretty, false).pretty());
        assert!(!Ui::new(UiMode::Plain, true).pretty());
        assert!(Ui::new(UiMode::Auto, true).pretty());
    }
}
