//! Run controller: at most one active run, newest wins.
//!
//! Starting a run while another is active cancels the old one and waits for
//! it to unwind before the snapshot store is handed to the new run, so two
//! runs never write the snapshot at the same time.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::errors::FlowError;
use crate::events::{EventSink, LogLevel, RunEvent};
use crate::flows::{FlowEnv, FlowKind, FlowRun, RunMode, run_flow};
use crate::snapshot::SnapshotStore;
use crate::step::StepExecutor;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub flow: FlowKind,
    pub mode: RunMode,
}

/// What a caller gets back from [`RunController::start`].
pub struct RunHandle {
    pub run_id: Uuid,
    pub events: UnboundedReceiver<RunEvent>,
}

/// Public view of the run currently in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRunInfo {
    pub run_id: Uuid,
    pub flow: FlowKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_step: Option<String>,
    pub started_at: DateTime<Utc>,
}

struct ActiveRun {
    info: ActiveRunInfo,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// How a run ended, as reported in its final log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
    Cancelled,
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Stopped => "stopped",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Failed => "failed",
        }
    }

    fn classify(result: &Result<(), FlowError>, token: &CancellationToken) -> Self {
        match result {
            Ok(()) => RunOutcome::Completed,
            Err(FlowError::StopEarly { .. }) => RunOutcome::Stopped,
            Err(err) if err.is_cancelled() => RunOutcome::Cancelled,
            // A preempted run can trip over a stale snapshot handle or a
            // half-finished call before it observes its token.
            Err(_) if token.is_cancelled() => RunOutcome::Cancelled,
            Err(_) => RunOutcome::Failed,
        }
    }
}

pub struct RunController {
    env: Arc<FlowEnv>,
    store: Arc<SnapshotStore>,
    start_lock: tokio::sync::Mutex<()>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

fn lock_slot(slot: &Mutex<Option<ActiveRun>>) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunController {
    pub fn new(env: Arc<FlowEnv>, store: Arc<SnapshotStore>) -> Self {
        Self {
            env,
            store,
            start_lock: tokio::sync::Mutex::new(()),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn active_run(&self) -> Option<ActiveRunInfo> {
        lock_slot(&self.active).as_ref().map(|run| run.info.clone())
    }

    /// Start a run, preempting whatever is active.
    ///
    /// The request is validated before anything else happens, so a bad
    /// `to-step` target leaves the current run alone.
    pub async fn start(&self, request: RunRequest) -> Result<RunHandle, FlowError> {
        request.mode.validate(request.flow)?;

        let _guard = self.start_lock.lock().await;
        self.preempt().await;

        let run_id = Uuid::new_v4();
        let snapshot = self.store.begin_run(run_id, request.flow.as_str())?;
        let (events, rx) = EventSink::channel();
        let token = CancellationToken::new();
        let exec = StepExecutor::new(events.clone(), token.clone());
        let run = FlowRun::new(
            request.flow,
            request.mode.clone(),
            Arc::clone(&self.env),
            exec,
            snapshot,
        );

        let info = ActiveRunInfo {
            run_id,
            flow: request.flow,
            to_step: match &request.mode {
                RunMode::ToStep(step) => Some(step.clone()),
                RunMode::Full => None,
            },
            started_at: Utc::now(),
        };

        // Hold the slot while spawning so the task cannot clear it first.
        let mut slot = lock_slot(&self.active);
        let handle = tokio::spawn(drive(
            run,
            run_id,
            events,
            token.clone(),
            Arc::clone(&self.active),
        ));
        tracing::info!(%run_id, flow = %request.flow, "run started");
        *slot = Some(ActiveRun {
            info,
            token,
            handle,
        });
        Ok(RunHandle { run_id, events: rx })
    }

    /// Cancel the active run, if any. Returns the cancelled run's id.
    pub fn cancel(&self) -> Option<Uuid> {
        let slot = lock_slot(&self.active);
        let run = slot.as_ref()?;
        run.token.cancel();
        tracing::info!(run_id = %run.info.run_id, "run cancellation requested");
        Some(run.info.run_id)
    }

    /// Cancel `run_id` only if it is still the active run.
    pub fn cancel_run(&self, run_id: Uuid) -> bool {
        let slot = lock_slot(&self.active);
        match slot.as_ref() {
            Some(run) if run.info.run_id == run_id => {
                run.token.cancel();
                tracing::info!(%run_id, "run cancelled by its observer");
                true
            }
            _ => false,
        }
    }

    async fn preempt(&self) {
        let previous = lock_slot(&self.active).take();
        if let Some(previous) = previous {
            tracing::info!(run_id = %previous.info.run_id, "preempting active run");
            previous.token.cancel();
            if let Err(e) = previous.handle.await {
                tracing::warn!(
                    run_id = %previous.info.run_id,
                    error = %e,
                    "preempted run task ended abnormally"
                );
            }
        }
    }
}

async fn drive(
    run: FlowRun,
    run_id: Uuid,
    events: EventSink,
    token: CancellationToken,
    slot: Arc<Mutex<Option<ActiveRun>>>,
) {
    let result = run_flow(&run).await;
    let outcome = RunOutcome::classify(&result, &token);
    let data = Some(json!({ "outcome": outcome.as_str() }));
    let message = result.as_ref().err().map(ToString::to_string).unwrap_or_default();
    match outcome {
        RunOutcome::Completed => events.log(LogLevel::Info, "Flow completed", data, Some(100)),
        RunOutcome::Stopped => events.log(LogLevel::Info, message, data, Some(100)),
        RunOutcome::Cancelled => events.log(LogLevel::Info, "Run cancelled", data, None),
        RunOutcome::Failed => events.log(LogLevel::Error, message, data, None),
    }
    tracing::info!(%run_id, outcome = outcome.as_str(), "run finished");

    let mut slot = lock_slot(&slot);
    if slot.as_ref().is_some_and(|run| run.info.run_id == run_id) {
        *slot = None;
    }
}
