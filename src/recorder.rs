//! Per-step capture of outbound call attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Failure,
}

/// One attempt at a remote operation.
///
/// `id` identifies the logical attempt: recording a second record with the
/// same id replaces the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub method: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub outcome: CallOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    pub fn success(
        id: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::new(id, method, endpoint, CallOutcome::Success)
    }

    pub fn failure(
        id: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut record = Self::new(id, method, endpoint, CallOutcome::Failure);
        record.message = Some(message.into());
        record
    }

    fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        outcome: CallOutcome,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            endpoint: endpoint.into(),
            status: None,
            request_body: None,
            response_body: None,
            duration_ms: None,
            outcome,
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Build a record from the context a client attached to a request.
    pub fn from_context(ctx: &RequestContext, outcome: CallOutcome) -> Self {
        Self {
            id: ctx.call_id.clone(),
            method: ctx.method.clone(),
            endpoint: ctx.endpoint.clone(),
            status: ctx.status,
            request_body: ctx.request_body.clone(),
            response_body: ctx.response_body.clone(),
            duration_ms: ctx.duration_ms,
            outcome,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == CallOutcome::Failure
    }
}

/// Ordered, id-keyed store of call attempts plus the ids currently failing.
#[derive(Debug, Default, Clone)]
pub struct RequestRecorder {
    requests: Vec<CallRecord>,
    failing: Vec<String>,
}

impl RequestRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a record by id and update the failure set.
    ///
    /// A failure outcome adds (or keeps) the id in the failure set; a success
    /// outcome for a previously failing id clears it. Returns `true` when the
    /// id was not seen before.
    pub fn record(&mut self, record: CallRecord) -> bool {
        let id = record.id.clone();
        let failed = record.is_failure();

        let inserted = match self.requests.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                self.requests.push(record);
                true
            }
        };

        if failed {
            if !self.failing.contains(&id) {
                self.failing.push(id);
            }
        } else {
            self.failing.retain(|f| f != &id);
        }

        inserted
    }

    pub fn requests(&self) -> Vec<CallRecord> {
        self.requests.clone()
    }

    /// Records currently failing, in the order they first failed.
    pub fn failures(&self) -> Vec<CallRecord> {
        self.failing
            .iter()
            .filter_map(|id| self.requests.iter().find(|r| &r.id == id))
            .cloned()
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        !self.failing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_id_updates_in_place() {
        let mut rec = RequestRecorder::new();
        assert!(rec.record(CallRecord::success("a", "GET", "/challenges/1")));
        let updated = CallRecord::success("a", "GET", "/challenges/1").with_status(200);
        assert!(!rec.record(updated));

        let requests = rec.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status, Some(200));
    }

    #[test]
    fn test_failure_then_success_clears_failure() {
        let mut rec = RequestRecorder::new();
        rec.record(CallRecord::failure("a", "GET", "/challenges/1", "boom").with_status(503));
        assert!(rec.has_failures());

        rec.record(CallRecord::success("a", "GET", "/challenges/1").with_status(200));
        assert!(!rec.has_failures());
        assert!(rec.failures().is_empty());
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn test_other_failures_are_kept() {
        let mut rec = RequestRecorder::new();
        rec.record(CallRecord::failure("a", "POST", "/resources", "dup"));
        rec.record(CallRecord::failure("b", "POST", "/submissions", "nope"));
        rec.record(CallRecord::success("a", "POST", "/resources"));

        let failures = rec.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "b");
    }

    #[test]
    fn test_repeated_failure_is_tracked_once() {
        let mut rec = RequestRecorder::new();
        rec.record(CallRecord::failure("a", "GET", "/x", "first"));
        rec.record(CallRecord::failure("a", "GET", "/x", "second"));
        let failures = rec.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message.as_deref(), Some("second"));
    }

    #[test]
    fn test_requests_preserve_first_seen_order() {
        let mut rec = RequestRecorder::new();
        rec.record(CallRecord::success("a", "GET", "/a"));
        rec.record(CallRecord::success("b", "GET", "/b"));
        rec.record(CallRecord::success("a", "GET", "/a").with_status(201));
        let ids: Vec<_> = rec.requests().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_call_record_serializes_camel_case() {
        let mut record = CallRecord::success("a", "GET", "/a");
        record.duration_ms = Some(12);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["durationMs"], 12);
        assert_eq!(json["outcome"], "success");
        assert!(json.get("requestBody").is_none());
    }
}
