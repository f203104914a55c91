//! Phase polling: wait until a challenge's phases reach the wanted states.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;

use crate::errors::FlowError;
use crate::names::PhaseName;
use crate::platform::{Challenge, PhaseState, PlatformApi};
use crate::step::StepContext;

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` polls until satisfied or cancelled.
    pub max_attempts: Option<u32>,
    /// How far past its scheduled end a phase may be before a lag warning.
    pub lag_grace: Duration,
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            lag_grace: Duration::from_secs(15),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_lag_grace(mut self, grace: Duration) -> Self {
        self.lag_grace = grace;
        self
    }
}

pub struct PhasePoller<'a> {
    api: &'a dyn PlatformApi,
    challenge_id: &'a str,
    options: PollOptions,
}

impl<'a> PhasePoller<'a> {
    pub fn new(api: &'a dyn PlatformApi, challenge_id: &'a str, options: PollOptions) -> Self {
        Self {
            api,
            challenge_id,
            options,
        }
    }

    /// Poll until every phase in `open` is open and every phase in `closed`
    /// is closed. A phase the challenge does not have never counts as open
    /// and always counts as closed.
    pub async fn await_phases(
        &self,
        ctx: &StepContext,
        open: &[PhaseName],
        closed: &[PhaseName],
    ) -> Result<Challenge, FlowError> {
        let label = phase_label(open, closed);
        let mut reported_missing = BTreeSet::new();
        let watched: Vec<(PhaseName, PhaseState)> = open
            .iter()
            .map(|p| (*p, PhaseState::Open))
            .chain(closed.iter().map(|p| (*p, PhaseState::Closed)))
            .collect();

        self.await_condition(ctx, &label, &watched, |challenge| {
            for phase in open.iter().chain(closed) {
                if challenge.phase(*phase).is_none() && reported_missing.insert(*phase) {
                    ctx.warn(format!(
                        "Challenge has no {phase} phase; treating it as never open"
                    ));
                }
            }
            let all_open = open
                .iter()
                .all(|p| challenge.phase_state(*p) == Some(PhaseState::Open));
            let all_closed = closed.iter().all(|p| {
                matches!(challenge.phase_state(*p), None | Some(PhaseState::Closed))
            });
            all_open && all_closed
        })
        .await
    }

    /// Poll until every phase of the challenge is closed.
    pub async fn await_all_closed(&self, ctx: &StepContext) -> Result<Challenge, FlowError> {
        self.await_condition(ctx, "all phases closed", &[], Challenge::all_phases_closed)
            .await
    }

    /// Poll until the challenge is completed with at least one winner.
    pub async fn await_completion(&self, ctx: &StepContext) -> Result<Challenge, FlowError> {
        self.await_condition(ctx, "completion", &[], |challenge| {
            challenge.is_completed() && !challenge.winners.is_empty()
        })
        .await
    }

    /// Fetch the challenge until `satisfied` holds.
    ///
    /// Every fetch reuses one call id, so a transient failure followed by a
    /// successful poll leaves no outstanding failure on the step. Returns on
    /// the first satisfied fetch without sleeping.
    pub async fn await_condition<F>(
        &self,
        ctx: &StepContext,
        label: &str,
        watched: &[(PhaseName, PhaseState)],
        mut satisfied: F,
    ) -> Result<Challenge, FlowError>
    where
        F: FnMut(&Challenge) -> bool,
    {
        let polled = ctx.with_call_id(format!("poll:{}:{}", self.challenge_id, label));
        let mut lagging = BTreeSet::new();
        let mut attempts = 0u32;

        loop {
            ctx.check()?;
            attempts += 1;

            match self.api.get_challenge(&polled, self.challenge_id).await {
                Ok(challenge) => {
                    if satisfied(&challenge) {
                        tracing::debug!(label, attempts, "poll satisfied");
                        return Ok(challenge);
                    }
                    self.warn_lagging(ctx, &challenge, watched, &mut lagging);
                }
                Err(err) if err.is_cancelled() => return Err(FlowError::Cancelled),
                Err(err) if err.is_transient() => {
                    ctx.warn(format!("Polling for {label} failed, retrying: {err}"));
                }
                Err(err) => return Err(err.into()),
            }

            if let Some(max) = self.options.max_attempts
                && attempts >= max
            {
                return Err(FlowError::PollExhausted {
                    what: label.to_string(),
                    attempts,
                });
            }
            ctx.wait(self.options.interval).await?;
        }
    }

    fn warn_lagging(
        &self,
        ctx: &StepContext,
        challenge: &Challenge,
        watched: &[(PhaseName, PhaseState)],
        warned: &mut BTreeSet<PhaseName>,
    ) {
        let Ok(grace) = chrono::Duration::from_std(self.options.lag_grace) else {
            return;
        };
        let now = Utc::now();
        for (name, wanted) in watched {
            let Some(phase) = challenge.phase(*name) else {
                continue;
            };
            let state = phase.state();
            if state == *wanted || warned.contains(name) {
                continue;
            }
            if let Some(end) = phase.scheduled_end_date
                && end + grace < now
            {
                warned.insert(*name);
                ctx.events().log(
                    crate::events::LogLevel::Warn,
                    format!(
                        "Phase {name} is lagging: scheduled to end at {end}, still {state:?}"
                    ),
                    Some(serde_json::json!({
                        "phase": name.as_str(),
                        "scheduledEnd": end,
                        "state": state,
                    })),
                    None,
                );
            }
        }
    }
}

fn phase_label(open: &[PhaseName], closed: &[PhaseName]) -> String {
    let mut parts = Vec::new();
    if !open.is_empty() {
        let names: Vec<&str> = open.iter().map(|p| p.as_str()).collect();
        parts.push(format!("open {}", names.join("+")));
    }
    if !closed.is_empty() {
        let names: Vec<&str> = closed.iter().map(|p| p.as_str()).collect();
        parts.push(format!("closed {}", names.join("+")));
    }
    parts.join(", ")
}
