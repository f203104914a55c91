//! Flow state machines and the machinery they share.
//!
//! A flow is a fixed, ordered list of named steps. [`FlowRun`] wraps every
//! step in the [`StepExecutor`], reports progress after each one, and raises
//! the stop-early signal once the step a `to-step` run targets has finished.
//! The steps common to all flows (token, challenge creation, activation,
//! resource assignment, submissions, review passes, completion) live here;
//! the flow modules sequence them.

pub mod answers;
pub mod design;
pub mod iterative;
pub mod reviews;
pub mod standard;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{ChallengeSettings, EngineConfig, FlowsConfig, HarnessConfig};
use crate::errors::FlowError;
use crate::events::EventSink;
use crate::names::{PhaseName, RoleIds, RoleName};
use crate::platform::token::M2mCredentials;
use crate::platform::{
    ArtifactStore, Challenge, HttpArtifactStore, HttpPlatformClient, M2mTokenSource, NewChallenge,
    NewResource, NewReview, NewSubmission, PlatformApi, Review, ReviewItemInput, ReviewPatch,
    Scorecard, StaticTokenSource, TokenSource,
};
use crate::poller::{PhasePoller, PollOptions};
use crate::recorder::CallRecord;
use crate::snapshot::{ParticipantRecord, RunSnapshot, RunSnapshotHandle};
use crate::step::{StepContext, StepExecutor};

use answers::{Verdict, review_items};
use reviews::{ReviewMatch, match_pending_review};

pub const STANDARD_STEPS: &[&str] = &[
    "token",
    "create-challenge",
    "update-draft",
    "activate",
    "await-registration-submission-open",
    "assign-resources",
    "create-submissions",
    "await-review-open",
    "create-reviews",
    "await-appeals-open",
    "create-appeals",
    "await-appeals-response-open",
    "respond-to-appeals",
    "await-all-closed",
    "await-completion",
];

pub const ITERATIVE_STEPS: &[&str] = &[
    "token",
    "create-challenge",
    "update-draft",
    "activate",
    "await-registration-submission-open",
    "assign-resources",
    "create-initial-submissions",
    "fail-reviews",
    "create-winning-submission",
    "pass-review",
    "await-winner",
];

pub const DESIGN_STEPS: &[&str] = &[
    "token",
    "create-challenge",
    "update-draft",
    "activate",
    "await-checkpoint-submission-open",
    "assign-resources",
    "create-checkpoint-submissions",
    "await-checkpoint-screening-open",
    "checkpoint-screening",
    "await-checkpoint-review-open",
    "checkpoint-review",
    "await-submission-open",
    "create-submissions",
    "await-screening-open",
    "screening",
    "await-review-open",
    "review",
    "await-approval-open",
    "approval-reject",
    "await-approval-reopen",
    "approval-pass",
    "await-all-closed",
    "await-completion",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "first2finish")]
    First2Finish,
    #[serde(rename = "topgear")]
    Topgear,
    #[serde(rename = "topgear-late")]
    TopgearLate,
    #[serde(rename = "design")]
    Design,
}

impl FlowKind {
    pub const ALL: [FlowKind; 5] = [
        FlowKind::Standard,
        FlowKind::First2Finish,
        FlowKind::Topgear,
        FlowKind::TopgearLate,
        FlowKind::Design,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FlowKind::Standard => "standard",
            FlowKind::First2Finish => "first2finish",
            FlowKind::Topgear => "topgear",
            FlowKind::TopgearLate => "topgear-late",
            FlowKind::Design => "design",
        }
    }

    pub fn steps(self) -> &'static [&'static str] {
        match self {
            FlowKind::Standard => STANDARD_STEPS,
            FlowKind::First2Finish | FlowKind::Topgear | FlowKind::TopgearLate => ITERATIVE_STEPS,
            FlowKind::Design => DESIGN_STEPS,
        }
    }

    pub fn has_step(self, step: &str) -> bool {
        self.steps().contains(&step)
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        FlowKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                FlowError::Config(format!(
                    "Unknown flow '{}'. Valid flows: standard, first2finish, topgear, topgear-late, design",
                    s
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Full,
    /// Stop right after the named step completes.
    ToStep(String),
}

impl RunMode {
    /// Reject a `to-step` target the flow does not have.
    pub fn validate(&self, kind: FlowKind) -> Result<(), FlowError> {
        match self {
            RunMode::ToStep(step) if !kind.has_step(step) => Err(FlowError::Config(format!(
                "Flow '{}' has no step '{}'. Steps: {}",
                kind,
                step,
                kind.steps().join(", ")
            ))),
            _ => Ok(()),
        }
    }
}

/// Collaborators and settings shared by every run.
pub struct FlowEnv {
    pub api: Arc<dyn PlatformApi>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub tokens: Arc<dyn TokenSource>,
    pub engine: EngineConfig,
    pub flows: FlowsConfig,
}

impl FlowEnv {
    /// Wire the HTTP adapters from configuration.
    pub fn from_config(config: &HarnessConfig) -> anyhow::Result<Self> {
        let http = HttpPlatformClient::http_client(config.timeout())
            .context("Failed to build HTTP client")?;
        let tokens: Arc<dyn TokenSource> = match &config.auth.static_token {
            Some(token) => Arc::new(StaticTokenSource::new(token.clone())),
            None => Arc::new(M2mTokenSource::new(
                http.clone(),
                M2mCredentials {
                    token_url: config.auth.token_url.clone(),
                    client_id: config.auth.client_id.clone(),
                    client_secret: config.auth.client_secret.clone(),
                    audience: config.auth.audience.clone(),
                },
            )),
        };
        let api = HttpPlatformClient::new(
            http.clone(),
            &config.platform.api_url,
            Arc::clone(&tokens),
        );
        let artifacts = HttpArtifactStore::new(
            http,
            &config.storage.upload_url,
            config.storage.public_url(),
            &config.storage.key_prefix,
        );
        Ok(Self {
            api: Arc::new(api),
            artifacts: Arc::new(artifacts),
            tokens,
            engine: config.engine.clone(),
            flows: config.flows.clone(),
        })
    }
}

/// Run one flow to completion, to its target step, or until cancelled.
pub async fn run_flow(run: &FlowRun) -> Result<(), FlowError> {
    run.mode.validate(run.kind)?;
    run.exec.announce(run.kind.steps());
    match run.kind {
        FlowKind::Standard => standard::run(run).await,
        FlowKind::First2Finish | FlowKind::Topgear | FlowKind::TopgearLate => {
            iterative::run(run).await
        }
        FlowKind::Design => design::run(run).await,
    }
}

/// One review to write: who reviews which submission, and how it comes out.
#[derive(Debug, Clone)]
pub struct ReviewTarget {
    pub reviewer: String,
    pub resource_id: String,
    pub submitter: String,
    pub submission_id: String,
    pub verdict: Verdict,
    /// Distinguishes reviews of the same submission by the same reviewer in
    /// different phases or rounds.
    pub round: Option<&'static str>,
}

impl ReviewTarget {
    pub fn key(&self) -> String {
        let key = RunSnapshot::review_key(&self.reviewer, &self.submitter, &self.submission_id);
        match self.round {
            Some(round) => format!("{key}:{round}"),
            None => key,
        }
    }
}

/// State of one run of one flow.
pub struct FlowRun {
    kind: FlowKind,
    mode: RunMode,
    env: Arc<FlowEnv>,
    exec: StepExecutor,
    snapshot: RunSnapshotHandle,
    rng: Mutex<StdRng>,
}

impl FlowRun {
    pub fn new(
        kind: FlowKind,
        mode: RunMode,
        env: Arc<FlowEnv>,
        exec: StepExecutor,
        snapshot: RunSnapshotHandle,
    ) -> Self {
        let rng = match env.engine.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            kind,
            mode,
            env,
            exec,
            snapshot,
            rng: Mutex::new(rng),
        }
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    pub fn api(&self) -> &dyn PlatformApi {
        self.env.api.as_ref()
    }

    pub fn env(&self) -> &FlowEnv {
        &self.env
    }

    pub fn events(&self) -> &EventSink {
        self.exec.events()
    }

    pub fn snapshot(&self) -> &RunSnapshotHandle {
        &self.snapshot
    }

    /// Run `runner` as the named step, then report progress and honour the
    /// run mode's stop point.
    pub async fn step<T, F, Fut>(&self, name: &str, runner: F) -> Result<T, FlowError>
    where
        F: FnOnce(StepContext) -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        let steps = self.kind.steps();
        let index = steps.iter().position(|s| *s == name).ok_or_else(|| {
            FlowError::Config(format!("Step '{}' is not part of flow '{}'", name, self.kind))
        })?;

        let value = self.exec.with_step(name, runner).await?;

        let total = steps.len().saturating_sub(1).max(1);
        let progress = u8::try_from(index * 100 / total).unwrap_or(100);
        self.events().progress(format!("Completed {name}"), progress);

        if let RunMode::ToStep(target) = &self.mode
            && target == name
        {
            return Err(FlowError::StopEarly {
                step: name.to_string(),
            });
        }
        Ok(value)
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    pub fn chance(&self, probability: f64) -> bool {
        self.with_rng(|rng| rng.gen_bool(probability.clamp(0.0, 1.0)))
    }

    pub fn pick(&self, items: &[String]) -> Option<String> {
        self.with_rng(|rng| items.choose(rng).cloned())
    }

    pub fn generate_items(&self, scorecard: &Scorecard, verdict: Verdict) -> Vec<ReviewItemInput> {
        self.with_rng(|rng| review_items(scorecard, verdict, rng))
    }

    pub fn poll_interval(&self, settings: &ChallengeSettings) -> Duration {
        Duration::from_secs(
            settings
                .poll_interval_secs
                .unwrap_or(self.env.engine.poll_interval_secs),
        )
    }

    pub fn poller<'a>(&'a self, challenge_id: &'a str, interval: Duration) -> PhasePoller<'a> {
        PhasePoller::new(
            self.api(),
            challenge_id,
            PollOptions::every(interval).with_lag_grace(self.env.engine.phase_lag_grace()),
        )
    }

    /// Id of the challenge this run created.
    pub fn challenge_id(&self) -> Result<String, FlowError> {
        self.snapshot
            .read()
            .challenge_id
            .ok_or_else(|| FlowError::Config("No challenge has been created in this run".into()))
    }

    // ── Shared steps ─────────────────────────────────────────────────

    pub async fn token_step(&self) -> Result<(), FlowError> {
        self.step("token", |ctx| async move {
            ctx.check()?;
            self.env.tokens.token().await?;
            ctx.info("Acquired platform token");
            Ok(())
        })
        .await
    }

    pub async fn create_challenge_step(
        &self,
        settings: &ChallengeSettings,
    ) -> Result<Challenge, FlowError> {
        self.step("create-challenge", |ctx| async move {
            let name = format!(
                "{} {} {}",
                settings.name_prefix,
                self.kind,
                Utc::now().format("%Y-%m-%d %H:%M:%S")
            );
            let request = NewChallenge {
                name: name.clone(),
                type_id: settings.type_id.clone(),
                track_id: settings.track_id.clone(),
                timeline_template_id: settings.timeline_template_id.clone(),
                project_id: settings.project_id,
                status: "New".to_string(),
                description: format!("Automated {} lifecycle run", self.kind),
                tags: settings.tags.clone(),
                start_date: Utc::now(),
            };
            let challenge = self.api().create_challenge(&ctx, &request).await?;
            self.snapshot
                .update(|s| s.set_challenge(&challenge.id, &challenge.name))?;
            ctx.info(format!("Created challenge {} ({})", challenge.name, challenge.id));
            Ok(challenge)
        })
        .await
    }

    pub async fn activate_step(&self, challenge_id: &str) -> Result<(), FlowError> {
        self.step("activate", |ctx| async move {
            let challenge = self.api().activate_challenge(&ctx, challenge_id).await?;
            ctx.info(format!("Challenge {} is {}", challenge.id, challenge.status));
            Ok(())
        })
        .await
    }

    pub async fn await_phases_step(
        &self,
        name: &str,
        challenge_id: &str,
        interval: Duration,
        open: &[PhaseName],
        closed: &[PhaseName],
    ) -> Result<Challenge, FlowError> {
        self.step(name, |ctx| async move {
            self.poller(challenge_id, interval)
                .await_phases(&ctx, open, closed)
                .await
        })
        .await
    }

    pub async fn await_all_closed_step(
        &self,
        challenge_id: &str,
        interval: Duration,
    ) -> Result<(), FlowError> {
        self.step("await-all-closed", |ctx| async move {
            self.poller(challenge_id, interval)
                .await_all_closed(&ctx)
                .await?;
            ctx.info("All phases closed");
            Ok(())
        })
        .await
    }

    /// Wait for completion and report the winners.
    pub async fn completion_step(
        &self,
        name: &str,
        challenge_id: &str,
        interval: Duration,
        also_closed: &[PhaseName],
    ) -> Result<Challenge, FlowError> {
        self.step(name, |ctx| async move {
            let poller = self.poller(challenge_id, interval);
            let challenge = poller.await_completion(&ctx).await?;
            let challenge = if also_closed.is_empty() {
                challenge
            } else {
                poller.await_phases(&ctx, &[], also_closed).await?
            };
            let mut winners = challenge.winners.clone();
            winners.sort_by_key(|w| w.placement);
            for winner in &winners {
                ctx.info(format!("Winner #{}: {}", winner.placement, winner.handle));
            }
            self.events().log(
                crate::events::LogLevel::Info,
                format!("Challenge {} completed", challenge.id),
                Some(serde_json::json!({ "winners": winners })),
                None,
            );
            Ok(challenge)
        })
        .await
    }

    /// Assign every `(handle, role)` pair, resolving optional roles through
    /// their fallback chain, then record the discovered participants.
    pub async fn assign_resources_step(
        &self,
        challenge_id: &str,
        assignments: &[(String, RoleName)],
    ) -> Result<(), FlowError> {
        self.step("assign-resources", |ctx| async move {
            let roles = self.api().list_resource_roles(&ctx).await?;
            let role_ids =
                RoleIds::from_pairs(roles.iter().map(|r| (r.name.as_str(), r.id.as_str())));
            self.snapshot.update(|s| s.set_role_ids(&role_ids))?;

            let mut conflicted = false;
            for (handle, role) in assignments {
                if handle.is_empty() {
                    continue;
                }
                let Some((used, role_id)) = role_ids.resolve(*role) else {
                    ctx.warn(format!("No role id for {role}; {handle} is not assigned"));
                    continue;
                };
                if used != *role {
                    ctx.warn(format!("Role {role} is missing; assigning {handle} as {used}"));
                }
                let request = NewResource {
                    challenge_id: challenge_id.to_string(),
                    member_handle: handle.clone(),
                    role_id: role_id.to_string(),
                };
                match self.api().add_resource(&ctx, &request).await {
                    Ok(resource) => {
                        self.snapshot
                            .update(|s| s.set_resource(handle, *role, &resource.id))?;
                        ctx.info(format!("Assigned {handle} as {used}"));
                    }
                    // The failed call stays recorded so the step ends `failure`,
                    // but the remaining assignments still go out.
                    Err(err) if err.is_conflict() => {
                        ctx.warn(format!("{handle} is already assigned as {used}: {err}"));
                        conflicted = true;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            let resources = self.api().list_resources(&ctx, challenge_id).await?;
            self.snapshot.update(|s| {
                if conflicted {
                    for (handle, role) in assignments {
                        let wanted = role_ids.resolve(*role).map(|(_, id)| id.to_string());
                        if let Some(found) = resources
                            .iter()
                            .find(|r| {
                                r.member_handle.eq_ignore_ascii_case(handle)
                                    && Some(&r.role_id) == wanted.as_ref()
                            })
                        {
                            s.set_resource(handle, *role, &found.id);
                        }
                    }
                }
                s.add_participants(resources.iter().map(|r| ParticipantRecord {
                    id: r.id.clone(),
                    member_id: r.member_id.clone(),
                    member_handle: r.member_handle.clone(),
                    role_id: r.role_id.clone(),
                }));
            })?;
            tracing::debug!(participants = resources.len(), "resources assigned");
            Ok(())
        })
        .await
    }

    /// Upload the configured artifact once; returns its bytes' public URL.
    pub async fn upload_artifact(
        &self,
        ctx: &StepContext,
        settings: &ChallengeSettings,
    ) -> Result<String, FlowError> {
        let path = settings
            .submission_zip_path
            .as_ref()
            .ok_or_else(|| {
                FlowError::Config(format!(
                    "submission_zip_path is not set for flow '{}'",
                    self.kind
                ))
            })?;
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            FlowError::fatal(
                ctx.name(),
                format!("Cannot read submission artifact {}: {e}", path.display()),
            )
        })?;
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "submission.zip".to_string());
        ctx.check()?;
        let call_id = ctx.call_id();
        let stored = self.env.artifacts.upload(&file_name, bytes).await?;
        ctx.record_request(CallRecord::success(call_id, "PUT", format!("artifact:{}", stored.key)));
        Ok(stored.url)
    }

    /// Create one submission for `handle` and remember it.
    pub async fn submit(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
        handle: &str,
        kind: &str,
        url: &str,
    ) -> Result<String, FlowError> {
        let member_id = self
            .snapshot
            .read()
            .participant(handle)
            .map(|p| p.member_id.clone())
            .ok_or_else(|| {
                FlowError::fatal(
                    ctx.name(),
                    format!("{handle} is not a participant of the challenge"),
                )
            })?;
        let submission = self
            .api()
            .create_submission(
                ctx,
                &NewSubmission {
                    challenge_id: challenge_id.to_string(),
                    member_id,
                    kind: kind.to_string(),
                    url: url.to_string(),
                    file_type: "zip".to_string(),
                },
            )
            .await?;
        self.snapshot
            .update(|s| s.add_submission(handle, &submission.id))?;
        ctx.info(format!("{handle} submitted {} ({kind})", submission.id));
        Ok(submission.id)
    }

    /// Create `per_submitter` submissions of `kind` for every submitter.
    pub async fn submissions_step(
        &self,
        name: &str,
        challenge_id: &str,
        settings: &ChallengeSettings,
        per_submitter: u32,
        kind: &str,
    ) -> Result<Vec<(String, String)>, FlowError> {
        self.step(name, |ctx| async move {
            let url = self.upload_artifact(&ctx, settings).await?;
            let mut created = Vec::new();
            for handle in &settings.submitters {
                for _ in 0..per_submitter {
                    let id = self.submit(&ctx, challenge_id, handle, kind, &url).await?;
                    created.push((handle.clone(), id));
                }
            }
            Ok(created)
        })
        .await
    }

    /// Resolve the resource id a handle holds for `role`.
    pub fn resource_id(&self, handle: &str, role: RoleName) -> Option<String> {
        let snapshot = self.snapshot.read();
        snapshot
            .resource_for(handle, role)
            .map(str::to_string)
            .or_else(|| {
                role.fallbacks()
                    .iter()
                    .find_map(|r| snapshot.resource_for(handle, *r).map(str::to_string))
            })
    }

    /// Find the pending review for each target, polling the review list up to
    /// the configured number of attempts.
    pub async fn discover_reviews(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
        phase_id: Option<&str>,
        targets: &[ReviewTarget],
    ) -> Result<Vec<Option<Review>>, FlowError> {
        let attempts = self.env.engine.review_discovery_attempts.max(1);
        let interval = self.env.engine.review_discovery_interval();
        let listed = ctx.with_call_id(format!("reviews:{}:{}", challenge_id, ctx.name()));
        let mut found: Vec<Option<Review>> = vec![None; targets.len()];
        let mut warned = BTreeSet::new();

        for attempt in 1..=attempts {
            ctx.check()?;
            match self.api().list_reviews(&listed, challenge_id).await {
                Ok(reviews) => {
                    for (i, target) in targets.iter().enumerate() {
                        if found[i].is_some() {
                            continue;
                        }
                        let claimed: BTreeSet<&str> =
                            found.iter().flatten().map(|r| r.id.as_str()).collect();
                        let available: Vec<Review> = reviews
                            .iter()
                            .filter(|r| !claimed.contains(r.id.as_str()))
                            .cloned()
                            .collect();
                        let resolved = match match_pending_review(
                            &available,
                            &target.resource_id,
                            &target.submission_id,
                            phase_id,
                        ) {
                            ReviewMatch::Exact(review) => Some(review.clone()),
                            ReviewMatch::OnlyPending(review) => {
                                ctx.warn(format!(
                                    "No review of {} found for submission {}; using its only pending review {}",
                                    target.reviewer, target.submission_id, review.id
                                ));
                                Some(review.clone())
                            }
                            ReviewMatch::Ambiguous(count) => {
                                if warned.insert(i) {
                                    ctx.warn(format!(
                                        "{count} pending reviews for submission {} and none belongs to {}; leaving it unresolved",
                                        target.submission_id, target.reviewer
                                    ));
                                }
                                None
                            }
                            ReviewMatch::Missing => None,
                        };
                        found[i] = resolved;
                    }
                }
                Err(err) if err.is_cancelled() => return Err(FlowError::Cancelled),
                Err(err) if err.is_transient() => {
                    ctx.warn(format!("Listing reviews failed, retrying: {err}"));
                }
                Err(err) => return Err(err.into()),
            }

            if found.iter().all(Option::is_some) {
                break;
            }
            if attempt < attempts {
                ctx.wait(interval).await?;
            }
        }
        Ok(found)
    }

    /// Write one review: patch the discovered pending review, or create one
    /// when allowed. Records the review key in the snapshot.
    pub async fn write_review(
        &self,
        ctx: &StepContext,
        scorecard: &Scorecard,
        phase_id: Option<&str>,
        target: &ReviewTarget,
        pending: Option<Review>,
        create_missing: bool,
    ) -> Result<String, FlowError> {
        ctx.check()?;
        let items = self.generate_items(scorecard, target.verdict);
        let review_id = match pending {
            Some(review) => {
                let patch = ReviewPatch {
                    scorecard_id: scorecard.id.clone(),
                    status: "COMPLETED".to_string(),
                    committed: true,
                    review_items: items,
                };
                self.api().patch_review(ctx, &review.id, &patch).await?.id
            }
            None if create_missing => {
                ctx.warn(format!(
                    "No pending review for submission {}; creating one for {}",
                    target.submission_id, target.reviewer
                ));
                let review = NewReview {
                    resource_id: target.resource_id.clone(),
                    submission_id: target.submission_id.clone(),
                    scorecard_id: scorecard.id.clone(),
                    phase_id: phase_id.map(str::to_string),
                    status: "COMPLETED".to_string(),
                    committed: true,
                    review_items: items,
                };
                self.api().create_review(ctx, &review).await?.id
            }
            None => {
                return Err(FlowError::fatal(
                    ctx.name(),
                    format!(
                        "No pending review for submission {} by {} after {} attempts",
                        target.submission_id,
                        target.reviewer,
                        self.env.engine.review_discovery_attempts
                    ),
                ));
            }
        };
        self.snapshot
            .update(|s| s.set_review(&target.key(), &review_id))?;
        ctx.info(format!(
            "{} reviewed submission {} of {} ({:?})",
            target.reviewer, target.submission_id, target.submitter, target.verdict
        ));
        Ok(review_id)
    }

    /// Review every target in `phase`: skip keys already written this run,
    /// fetch the scorecard once, discover pending reviews, then patch them.
    pub async fn review_targets(
        &self,
        ctx: &StepContext,
        challenge: &Challenge,
        phase: PhaseName,
        scorecard_id: &str,
        targets: Vec<ReviewTarget>,
        create_missing: bool,
    ) -> Result<Vec<String>, FlowError> {
        let snapshot = self.snapshot.read();
        let targets: Vec<ReviewTarget> = targets
            .into_iter()
            .filter(|t| {
                let done = snapshot.has_review(&t.key());
                if done {
                    ctx.info(format!("Review {} already written, skipping", t.key()));
                }
                !done
            })
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let phase_id = challenge.phase(phase).map(|p| p.id.clone());
        if phase_id.is_none() {
            ctx.warn(format!(
                "Challenge has no {phase} phase; matching reviews on submission only"
            ));
        }
        let scorecard = self.api().get_scorecard(ctx, scorecard_id).await?;
        let pending = self
            .discover_reviews(ctx, &challenge.id, phase_id.as_deref(), &targets)
            .await?;

        let mut written = Vec::new();
        for (target, review) in targets.iter().zip(pending) {
            let id = self
                .write_review(ctx, &scorecard, phase_id.as_deref(), target, review, create_missing)
                .await?;
            written.push(id);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::events::{RunEvent, StepStatus};
    use crate::platform::fake::{FakePlatform, flow_env};
    use crate::snapshot::SnapshotStore;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) struct Harness {
        pub run: FlowRun,
        pub rx: UnboundedReceiver<RunEvent>,
        pub token: CancellationToken,
        pub store: Arc<SnapshotStore>,
        _dir: TempDir,
    }

    pub(crate) fn zip_fixture(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("submission.zip");
        std::fs::write(&path, b"PK\x03\x04harness").unwrap();
        path
    }

    pub(crate) fn harness(
        kind: FlowKind,
        mode: RunMode,
        platform: Arc<FakePlatform>,
        configure: impl FnOnce(&mut FlowsConfig, &std::path::Path),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let zip = zip_fixture(&dir);
        let mut flows = FlowsConfig::default();
        configure(&mut flows, &zip);
        let env = flow_env(platform, flows);
        let store = Arc::new(SnapshotStore::open(dir.path().join("snapshot.json")).unwrap());
        let snapshot = store.begin_run(uuid::Uuid::new_v4(), kind.as_str()).unwrap();
        let (sink, rx) = EventSink::channel();
        let token = CancellationToken::new();
        let exec = StepExecutor::new(sink, token.clone());
        Harness {
            run: FlowRun::new(kind, mode, env, exec, snapshot),
            rx,
            token,
            store,
            _dir: dir,
        }
    }

    pub(crate) fn drain(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub(crate) fn terminal_status(events: &[RunEvent], step: &str) -> Option<StepStatus> {
        events.iter().rev().find_map(|event| match event {
            RunEvent::Step {
                step: name, status, ..
            } if name == step && status.is_terminal() => Some(*status),
            _ => None,
        })
    }

    #[test]
    fn test_flow_kind_parsing() {
        assert_eq!("first2finish".parse::<FlowKind>().unwrap(), FlowKind::First2Finish);
        assert_eq!("Topgear-Late".parse::<FlowKind>().unwrap(), FlowKind::TopgearLate);
        assert!("marathon".parse::<FlowKind>().is_err());
        assert_eq!(serde_json::to_string(&FlowKind::TopgearLate).unwrap(), "\"topgear-late\"");
    }

    #[test]
    fn test_step_lists_are_unique_and_start_with_token() {
        for kind in FlowKind::ALL {
            let steps = kind.steps();
            assert_eq!(steps[0], "token");
            let unique: BTreeSet<_> = steps.iter().collect();
            assert_eq!(unique.len(), steps.len(), "{kind} has duplicate steps");
        }
    }

    #[test]
    fn test_to_step_validation() {
        assert!(RunMode::ToStep("activate".into()).validate(FlowKind::Standard).is_ok());
        let err = RunMode::ToStep("approval-pass".into())
            .validate(FlowKind::Standard)
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
        assert!(RunMode::Full.validate(FlowKind::Design).is_ok());
    }

    #[tokio::test]
    async fn test_progress_excludes_token_step() {
        let platform = Arc::new(FakePlatform::standard(1));
        let mut h = harness(FlowKind::Standard, RunMode::Full, platform, |_, _| {});
        h.run.token_step().await.unwrap();
        h.run
            .step("update-draft", |_ctx| async { Ok::<_, FlowError>(()) })
            .await
            .unwrap();
        let progress: Vec<u8> = drain(&mut h.rx)
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::Log { progress, .. } => progress,
                _ => None,
            })
            .collect();
        // token = 0/14, update-draft = 2/14
        assert_eq!(progress, vec![0, 14]);
    }

    #[tokio::test]
    async fn test_stop_early_after_target_step() {
        let platform = Arc::new(FakePlatform::standard(1));
        let h = harness(
            FlowKind::Standard,
            RunMode::ToStep("token".into()),
            platform,
            |_, _| {},
        );
        let err = h.run.token_step().await.unwrap_err();
        assert!(err.is_stop_early());
        assert!(!h.token.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_step_name_is_rejected() {
        let platform = Arc::new(FakePlatform::standard(1));
        let h = harness(FlowKind::Standard, RunMode::Full, platform, |_, _| {});
        let err = h
            .run
            .step("not-a-step", |_ctx| async { Ok::<_, FlowError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[tokio::test]
    async fn test_duplicate_resource_is_warned_and_recovered() {
        let platform = Arc::new(FakePlatform::standard(1));
        platform.conflict_on("bob");
        let mut h = harness(FlowKind::Standard, RunMode::Full, Arc::clone(&platform), |_, _| {});
        let settings = ChallengeSettings::default();
        let challenge = h.run.create_challenge_step(&settings).await.unwrap();
        h.run
            .assign_resources_step(
                &challenge.id,
                &[
                    ("alice".to_string(), RoleName::Submitter),
                    ("bob".to_string(), RoleName::Submitter),
                ],
            )
            .await
            .unwrap();

        let snapshot = h.store.current();
        assert!(snapshot.resource_for("alice", RoleName::Submitter).is_some());
        assert!(snapshot.resource_for("bob", RoleName::Submitter).is_some());
        assert_eq!(snapshot.participants.len(), 2);

        let events = drain(&mut h.rx);
        assert_eq!(
            terminal_status(&events, "assign-resources"),
            Some(StepStatus::Failure)
        );
        assert!(events.iter().any(|e| matches!(e,
            RunEvent::Log { message, .. } if message.contains("already assigned"))));
        let failures = events
            .iter()
            .rev()
            .find_map(|e| match e {
                RunEvent::Step {
                    step,
                    failures: Some(failures),
                    ..
                } if step == "assign-resources" => {
                    Some(failures.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, Some(409));
    }

    #[tokio::test]
    async fn test_missing_role_falls_back_with_warning() {
        let platform =
            Arc::new(FakePlatform::standard(1).without_role(RoleName::IterativeReviewer));
        let mut h = harness(FlowKind::Standard, RunMode::Full, Arc::clone(&platform), |_, _| {});
        let challenge = h
            .run
            .create_challenge_step(&ChallengeSettings::default())
            .await
            .unwrap();
        h.run
            .assign_resources_step(
                &challenge.id,
                &[("rev".to_string(), RoleName::IterativeReviewer)],
            )
            .await
            .unwrap();
        let resources = platform.resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].role_id, "role-reviewer");
        assert_eq!(
            h.run.resource_id("rev", RoleName::IterativeReviewer),
            Some(resources[0].id.clone())
        );
        let events = drain(&mut h.rx);
        assert!(events.iter().any(|e| matches!(e,
            RunEvent::Log { message, .. } if message.contains("assigning rev as Reviewer"))));
    }

    #[tokio::test]
    async fn test_missing_pending_review_is_fatal_unless_creation_allowed() {
        let platform = Arc::new(FakePlatform::standard(1));
        let h = harness(FlowKind::Standard, RunMode::Full, Arc::clone(&platform), |_, _| {});
        let challenge = h
            .run
            .create_challenge_step(&ChallengeSettings::default())
            .await
            .unwrap();
        let target = ReviewTarget {
            reviewer: "rev".into(),
            resource_id: "res-x".into(),
            submitter: "alice".into(),
            submission_id: "sub-x".into(),
            verdict: Verdict::Pass,
            round: None,
        };

        let ctx = StepContext::detached("create-reviews");
        let err = h
            .run
            .review_targets(&ctx, &challenge, PhaseName::Review, "sc", vec![target.clone()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::StepFatal { .. }));
        assert_eq!(platform.count("list_reviews"), 3);

        let written = h
            .run
            .review_targets(&ctx, &challenge, PhaseName::Review, "sc", vec![target.clone()], true)
            .await
            .unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(platform.count("create_review"), 1);

        // The key is now in the snapshot, so a second pass is a no-op.
        let again = h
            .run
            .review_targets(&ctx, &challenge, PhaseName::Review, "sc", vec![target], true)
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(platform.count("create_review"), 1);
    }
}
