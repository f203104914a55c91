//! Terminal rendering of a run's event stream.
//!
//! Supports three output modes:
//! - `full`: progress bar plus per-step status lines
//! - `minimal`: one line per finished step
//! - `json`: every event as a JSON line, for piping into other tools

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::events::{LogLevel, RunEvent, StepStatus};
use crate::ui::icons::{CHECK, CROSS, RUNNING, SPARKLE, STOP, WARN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

/// Tally of what a run did, built from its events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub requests: usize,
    pub failed_requests: usize,
    pub warnings: usize,
    pub outcome: Option<String>,
}

impl RunSummary {
    pub fn observe(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Step {
                status,
                requests,
                failures,
                ..
            } => match status {
                StepStatus::Success | StepStatus::Failure => {
                    if *status == StepStatus::Success {
                        self.steps_succeeded += 1;
                    } else {
                        self.steps_failed += 1;
                    }
                    self.requests += requests.as_ref().map_or(0, Vec::len);
                    self.failed_requests += failures.as_ref().map_or(0, Vec::len);
                }
                StepStatus::Pending | StepStatus::InProgress => {}
            },
            RunEvent::Log { level, .. } => {
                if *level == LogLevel::Warn {
                    self.warnings += 1;
                }
                if let Some(outcome) = event.outcome() {
                    self.outcome = Some(outcome.to_string());
                }
            }
        }
    }

    /// Completed and stopped runs count as success.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome.as_deref(), Some("completed" | "stopped"))
    }
}

/// Renders run events on the terminal.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    bar: ProgressBar,
    verbose: bool,
    term: Term,
    summary: Mutex<RunSummary>,
}

impl RunUI {
    pub fn new(flow: &str, total_steps: usize, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let bar = match mode {
            UiMode::Full => {
                let bar = multi.add(ProgressBar::new(100));
                if let Ok(bar_style) = ProgressStyle::default_bar()
                    .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                {
                    bar.set_style(bar_style.progress_chars("█▓▒░"));
                }
                bar.set_prefix(flow.to_string());
                bar.set_message(format!("{} steps", total_steps));
                bar.enable_steady_tick(Duration::from_millis(120));
                bar
            }
            UiMode::Minimal | UiMode::Json => ProgressBar::hidden(),
        };

        Self {
            mode,
            multi,
            bar,
            verbose,
            term: Term::stdout(),
            summary: Mutex::new(RunSummary::default()),
        }
    }

    /// Print a line above the bar, falling back to stderr.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle_event(&self, event: &RunEvent) {
        self.summary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observe(event);
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &RunEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &RunEvent) {
        match event {
            RunEvent::Step { step, status, .. } if status.is_terminal() => {
                let mark = if *status == StepStatus::Success { "ok" } else { "FAILED" };
                let _ = writeln!(&self.term, "{step}: {mark}");
            }
            RunEvent::Log { level, message, .. } if *level != LogLevel::Info => {
                let _ = writeln!(&self.term, "{level:?}: {message}");
            }
            RunEvent::Log {
                message, data: Some(_), ..
            } if event.outcome().is_some() => {
                let _ = writeln!(&self.term, "{message}");
            }
            _ => {}
        }
    }

    fn handle_full(&self, event: &RunEvent) {
        match event {
            RunEvent::Step {
                step,
                status,
                requests,
                failures,
                ..
            } => self.on_step(
                step,
                *status,
                requests.as_ref().map_or(0, Vec::len),
                failures.as_ref().map_or(0, Vec::len),
            ),
            RunEvent::Log {
                level,
                message,
                progress,
                ..
            } => {
                if let Some(progress) = progress {
                    self.bar.set_position(u64::from(*progress));
                }
                match event.outcome() {
                    Some(outcome) => self.on_outcome(outcome, message),
                    None => self.on_log(*level, message),
                }
            }
        }
    }

    fn on_step(&self, step: &str, status: StepStatus, requests: usize, failures: usize) {
        match status {
            StepStatus::Pending => {}
            StepStatus::InProgress => {
                self.bar.set_message(format!("{}", style(step).yellow()));
                if self.verbose {
                    self.print_line(format!("  {}{}", RUNNING, style(step).dim()));
                }
            }
            StepStatus::Success => {
                let calls = if failures > 0 {
                    format!("{requests} calls, {failures} recovered")
                } else {
                    format!("{requests} calls")
                };
                self.print_line(format!(
                    "  {}{} {}",
                    CHECK,
                    step,
                    style(format!("({calls})")).dim()
                ));
            }
            StepStatus::Failure => {
                self.print_line(format!(
                    "  {}{} {}",
                    CROSS,
                    style(step).red().bold(),
                    style(format!("({requests} calls, {failures} failed)")).dim()
                ));
            }
        }
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => {
                if self.verbose {
                    self.print_line(format!("    {} {}", style("→").dim(), style(message).dim()));
                }
            }
            LogLevel::Warn => self.print_line(format!("    {}{}", WARN, style(message).yellow())),
            LogLevel::Error => self.print_line(format!("    {}{}", CROSS, style(message).red())),
        }
    }

    fn on_outcome(&self, outcome: &str, message: &str) {
        let line = match outcome {
            "completed" => format!("{}{}", SPARKLE, style(message).green().bold()),
            "stopped" => format!("{}{}", STOP, style(message).cyan()),
            "cancelled" => format!("{}{}", STOP, style(message).yellow()),
            _ => format!("{}{}", CROSS, style(message).red().bold()),
        };
        self.print_line(line);
    }

    /// Clear the bar and return the run's tally.
    pub fn finish(&self) -> RunSummary {
        self.bar.finish_and_clear();
        let summary = self
            .summary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if self.mode == UiMode::Full {
            self.print_line(format!(
                "{} steps ok, {} failed, {} calls ({} failed), {} warnings",
                style(summary.steps_succeeded).green(),
                style(summary.steps_failed).red(),
                summary.requests,
                summary.failed_requests,
                summary.warnings
            ));
        }
        summary
    }
}
