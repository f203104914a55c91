//! Step execution wrapper.
//!
//! [`StepExecutor::with_step`] runs one named unit of a flow. The runner gets
//! a [`StepContext`] which is passed explicitly to every remote-call wrapper;
//! the client layer records each attempt into it. Only one step may be open
//! for recording at a time, enforced at runtime.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::cancel::{Cancelled, CancellationToken};
use crate::errors::FlowError;
use crate::events::{EventSink, StepStatus};
use crate::recorder::{CallOutcome, CallRecord, RequestRecorder};

/// Field overrides applied when deriving a record from an error.
#[derive(Debug, Clone, Default)]
pub struct CallOverrides {
    pub method: Option<String>,
    pub endpoint: Option<String>,
    pub status: Option<u16>,
}

struct StepInner {
    name: String,
    recorder: Mutex<RequestRecorder>,
    events: EventSink,
    token: CancellationToken,
}

/// Step-scoped handle threaded through every remote call of a step.
///
/// Clones share the same recorder. [`StepContext::with_call_id`] produces a
/// clone that pins the id used for the next recorded attempts, so repeated
/// polls of the same resource update one record instead of piling up.
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<StepInner>,
    call_id: Option<String>,
}

impl StepContext {
    pub fn new(name: &str, events: EventSink, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(StepInner {
                name: name.to_string(),
                recorder: Mutex::new(RequestRecorder::new()),
                events,
                token,
            }),
            call_id: None,
        }
    }

    /// A context for calls made outside any flow step (CLI helpers, tests).
    pub fn detached(name: &str) -> Self {
        Self::new(name, EventSink::detached(), CancellationToken::new())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        self.inner.token.check()
    }

    pub async fn wait(&self, duration: Duration) -> Result<(), Cancelled> {
        self.inner.token.wait(duration).await
    }

    pub fn with_call_id(&self, id: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            call_id: Some(id.into()),
        }
    }

    /// Id for the next call attempt: the pinned id, or a fresh one.
    pub fn call_id(&self) -> String {
        self.call_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn recorder(&self) -> MutexGuard<'_, RequestRecorder> {
        self.inner
            .recorder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upsert a call record and re-emit the step's aggregate state.
    pub fn record_request(&self, record: CallRecord) {
        tracing::debug!(
            step = %self.inner.name,
            call_id = %record.id,
            method = %record.method,
            endpoint = %record.endpoint,
            status = ?record.status,
            outcome = ?record.outcome,
            "recorded call"
        );
        let (requests, failures) = {
            let mut recorder = self.recorder();
            recorder.record(record);
            (recorder.requests(), recorder.failures())
        };
        self.inner.events.step(
            &self.inner.name,
            StepStatus::InProgress,
            Some(requests),
            Some(failures),
        );
    }

    /// Derive a failure record from an error and record it.
    ///
    /// Errors that came from a remote call reuse that call's id, so the record
    /// the client already wrote is overwritten rather than duplicated.
    pub fn record_failure(&self, error: &FlowError, overrides: Option<CallOverrides>) {
        let overrides = overrides.unwrap_or_default();
        let mut record = match error.request() {
            Some(ctx) => CallRecord::from_context(ctx, CallOutcome::Failure),
            None => CallRecord::failure(
                self.call_id(),
                "INTERNAL",
                self.inner.name.clone(),
                error.to_string(),
            ),
        };
        record.message = Some(error.to_string());
        if let Some(method) = overrides.method {
            record.method = method;
        }
        if let Some(endpoint) = overrides.endpoint {
            record.endpoint = endpoint;
        }
        if overrides.status.is_some() {
            record.status = overrides.status;
        }
        self.record_request(record);
    }

    pub fn requests(&self) -> Vec<CallRecord> {
        self.recorder().requests()
    }

    pub fn failures(&self) -> Vec<CallRecord> {
        self.recorder().failures()
    }

    pub fn has_failures(&self) -> bool {
        self.recorder().has_failures()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.inner.events.info(message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.inner.events.warn(message);
    }

    fn emit_terminal(&self, status: StepStatus) {
        let (requests, failures) = {
            let recorder = self.recorder();
            (recorder.requests(), recorder.failures())
        };
        self.inner
            .events
            .step(&self.inner.name, status, Some(requests), Some(failures));
    }
}

/// Clears the active-step slot when a step finishes, however it finishes.
struct ActiveStep {
    slot: Arc<Mutex<Option<String>>>,
}

impl Drop for ActiveStep {
    fn drop(&mut self) {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }
}

/// Runs the steps of one flow execution.
#[derive(Clone)]
pub struct StepExecutor {
    events: EventSink,
    token: CancellationToken,
    active: Arc<Mutex<Option<String>>>,
}

impl StepExecutor {
    pub fn new(events: EventSink, token: CancellationToken) -> Self {
        Self {
            events,
            token,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Emit the initial `pending` state for every step of a flow.
    pub fn announce(&self, steps: &[&str]) {
        for step in steps {
            self.events.step(step, StepStatus::Pending, None, None);
        }
    }

    /// Name of the step currently open for recording.
    pub fn active_step(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn open(&self, name: &str) -> Result<ActiveStep, FlowError> {
        let mut slot = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = slot.as_ref() {
            return Err(FlowError::StepOverlap {
                active: active.clone(),
                requested: name.to_string(),
            });
        }
        *slot = Some(name.to_string());
        Ok(ActiveStep {
            slot: Arc::clone(&self.active),
        })
    }

    /// Run `runner` as step `name`.
    ///
    /// Emits `in-progress` before invoking and exactly one terminal status
    /// after: `success` when the runner returned `Ok` with no outstanding
    /// failures, `failure` otherwise. Errors are recorded (except the
    /// cancellation signal) and propagated unchanged.
    pub async fn with_step<T, F, Fut>(&self, name: &str, runner: F) -> Result<T, FlowError>
    where
        F: FnOnce(StepContext) -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        let _active = self.open(name)?;
        let ctx = StepContext::new(name, self.events.clone(), self.token.clone());
        self.events.step(name, StepStatus::InProgress, None, None);
        tracing::info!(step = name, "step started");

        let result = runner(ctx.clone()).await;

        if let Err(err) = &result
            && !err.is_cancelled()
        {
            ctx.record_failure(err, None);
        }

        let status = if result.is_ok() && !ctx.has_failures() {
            StepStatus::Success
        } else {
            StepStatus::Failure
        };
        ctx.emit_terminal(status);
        tracing::info!(step = name, %status, "step finished");
        result
    }
}
