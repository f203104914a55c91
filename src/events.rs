//! Run event stream: log lines and step-status transitions.
//!
//! Everything an observer sees about a run flows through an [`EventSink`].
//! Log events are mirrored into `tracing` at the matching level so the
//! process log and the live stream agree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::recorder::CallRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Success,
    Failure,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failure)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in-progress"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        timestamp: DateTime<Utc>,
    },
    Step {
        step: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requests: Option<Vec<CallRecord>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failures: Option<Vec<CallRecord>>,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    /// The `outcome` tag carried by terminal run events, if any.
    pub fn outcome(&self) -> Option<&str> {
        match self {
            RunEvent::Log {
                data: Some(data), ..
            } => data.get("outcome").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

/// Sending half of a run's event stream.
///
/// Sends never fail from the caller's point of view: a dropped receiver (the
/// observer went away) just means nobody is listening.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose events go nowhere.
    pub fn detached() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
        progress: Option<u8>,
    ) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(progress, "{}", message),
            LogLevel::Warn => tracing::warn!(progress, "{}", message),
            LogLevel::Error => tracing::error!(progress, "{}", message),
        }
        self.emit(RunEvent::Log {
            level,
            message,
            data,
            progress,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, None, None);
    }

    pub fn progress(&self, message: impl Into<String>, progress: u8) {
        self.log(LogLevel::Info, message, None, Some(progress));
    }

    pub fn step(
        &self,
        step: &str,
        status: StepStatus,
        requests: Option<Vec<CallRecord>>,
        failures: Option<Vec<CallRecord>>,
    ) {
        tracing::debug!(step, %status, "step status");
        self.emit(RunEvent::Step {
            step: step.to_string(),
            status,
            requests,
            failures,
            timestamp: Utc::now(),
        });
    }
}
