//! Typed error hierarchy for the harness.
//!
//! Three enums cover the three layers:
//! - `ApiError`: a single remote call (platform, token, artifact store)
//! - `SnapshotError`: the persisted run snapshot
//! - `FlowError`: everything a step or flow can propagate, including the two
//!   distinguished non-error signals (`Cancelled`, `StopEarly`)

use serde::Serialize;
use thiserror::Error;

use crate::cancel::Cancelled;

/// Request context attached to a failed remote call.
///
/// Carries enough to rebuild a `CallRecord` for the failing attempt; the
/// `call_id` matches the record the client already wrote, so re-recording the
/// failure at the step boundary overwrites instead of duplicating it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub call_id: String,
    pub method: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Errors from a single remote call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{} {} returned HTTP {status}: {message}", .request.method, .request.endpoint)]
    Status {
        request: Box<RequestContext>,
        status: u16,
        message: String,
    },

    #[error("{} {} failed: {message}", .request.method, .request.endpoint)]
    Transport {
        request: Box<RequestContext>,
        message: String,
    },

    #[error("{} {} returned an unreadable body: {message}", .request.method, .request.endpoint)]
    Decode {
        request: Box<RequestContext>,
        message: String,
    },

    #[error("Token acquisition failed: {0}")]
    Auth(String),

    #[error("Artifact upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ApiError {
    /// Request context of the failing call, when the error came from one.
    pub fn request(&self) -> Option<&RequestContext> {
        match self {
            ApiError::Status { request, .. }
            | ApiError::Transport { request, .. }
            | ApiError::Decode { request, .. } => Some(request),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled(_))
    }

    /// True when the platform rejected the call because the target already
    /// exists (duplicate resource assignment and friends).
    pub fn is_conflict(&self) -> bool {
        match self {
            ApiError::Status {
                status, message, ..
            } => *status == 409 || message.to_lowercase().contains("already"),
            _ => false,
        }
    }

    /// Server-side or transport failures worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::Transport { .. } => true,
            _ => false,
        }
    }
}

/// Errors from the persisted run snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to read snapshot at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write snapshot at {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot at {path} is not valid JSON: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Run {run_id} no longer owns the snapshot")]
    StaleRun { run_id: uuid::Uuid },
}

/// Errors propagated by steps, flows and the run controller.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Run cancelled")]
    Cancelled,

    #[error("Stopped after step '{step}'")]
    StopEarly { step: String },

    #[error("Step '{step}' failed: {message}")]
    StepFatal { step: String, message: String },

    #[error("Gave up waiting for {what} after {attempts} attempts")]
    PollExhausted { what: String, attempts: u32 },

    #[error("Step '{requested}' started while step '{active}' is still open")]
    StepOverlap { active: String, requested: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Api(ApiError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    pub fn fatal(step: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::StepFatal {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlowError::Cancelled)
    }

    pub fn is_stop_early(&self) -> bool {
        matches!(self, FlowError::StopEarly { .. })
    }

    /// Request context of the underlying remote call, if any.
    pub fn request(&self) -> Option<&RequestContext> {
        match self {
            FlowError::Api(e) => e.request(),
            _ => None,
        }
    }
}

impl From<Cancelled> for FlowError {
    fn from(_: Cancelled) -> Self {
        FlowError::Cancelled
    }
}

impl From<ApiError> for FlowError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Cancelled(_) => FlowError::Cancelled,
            other => FlowError::Api(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16, message: &str) -> ApiError {
        ApiError::Status {
            request: Box::new(RequestContext {
                call_id: "call-1".into(),
                method: "POST".into(),
                endpoint: "/resources".into(),
                status: Some(status),
                ..Default::default()
            }),
            status,
            message: message.into(),
        }
    }

    #[test]
    fn api_error_display_includes_method_and_endpoint() {
        let err = status_error(400, "bad payload");
        let text = err.to_string();
        assert!(text.contains("POST"));
        assert!(text.contains("/resources"));
        assert!(text.contains("400"));
        assert!(text.contains("bad payload"));
    }

    #[test]
    fn api_error_conflict_detection() {
        assert!(status_error(409, "duplicate").is_conflict());
        assert!(status_error(400, "Resource already exists").is_conflict());
        assert!(!status_error(400, "bad payload").is_conflict());
        assert!(!ApiError::Auth("nope".into()).is_conflict());
    }

    #[test]
    fn api_error_transient_detection() {
        assert!(status_error(503, "unavailable").is_transient());
        assert!(status_error(429, "slow down").is_transient());
        assert!(!status_error(404, "missing").is_transient());
    }

    #[test]
    fn cancelled_api_error_becomes_flow_cancelled() {
        let err: FlowError = ApiError::from(Cancelled).into();
        assert!(err.is_cancelled());
    }

    #[test]
    fn api_error_keeps_request_context_through_flow_error() {
        let err: FlowError = status_error(500, "boom").into();
        let ctx = err.request().expect("request context");
        assert_eq!(ctx.call_id, "call-1");
        assert_eq!(ctx.status, Some(500));
    }

    #[test]
    fn stop_early_is_distinct_from_cancel() {
        let err = FlowError::StopEarly {
            step: "activate".into(),
        };
        assert!(err.is_stop_early());
        assert!(!err.is_cancelled());
        assert!(err.to_string().contains("activate"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ApiError::Auth("x".into()));
        assert_std_error(&FlowError::Cancelled);
        assert_std_error(&SnapshotError::StaleRun {
            run_id: uuid::Uuid::nil(),
        });
    }
}
