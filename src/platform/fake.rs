//! In-memory platform used by poller, flow and controller tests.
//!
//! The fake runs a small autopilot: after activation it walks through a list
//! of [`Stage`]s, each opening a set of phases and leaving once its exit
//! condition holds. Exits are evaluated when the challenge is fetched, the
//! same moment a real autopilot's effects become visible to a poller.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::models::*;
use super::{ArtifactStore, PlatformApi, StaticTokenSource};
use crate::config::{EngineConfig, FlowsConfig};
use crate::errors::{ApiError, RequestContext};
use crate::flows::FlowEnv;
use crate::names::{PhaseName, RoleName};
use crate::recorder::{CallOutcome, CallRecord};
use crate::step::StepContext;

pub const SCORECARD_YES_NO: &str = "q-yes-no";
pub const SCORECARD_SCALE: &str = "q-scale";

#[derive(Debug, Clone)]
pub enum StageExit {
    Submissions { kind: &'static str, count: usize },
    ReviewsCommitted,
    Polls(u32),
    PassingReview,
    Never,
}

#[derive(Debug, Clone)]
pub struct ReviewSpawn {
    pub phase: PhaseName,
    /// First role with an assigned resource gets the reviews.
    pub roles: Vec<RoleName>,
    pub kind: &'static str,
    /// Also spawn for submissions created while the stage is active.
    pub on_submit: bool,
    /// Leave out submissions that already failed a committed review.
    pub skip_failed: bool,
}

impl ReviewSpawn {
    pub fn new(phase: PhaseName, roles: &[RoleName], kind: &'static str) -> Self {
        Self {
            phase,
            roles: roles.to_vec(),
            kind,
            on_submit: false,
            skip_failed: false,
        }
    }

    pub fn on_submit(mut self) -> Self {
        self.on_submit = true;
        self
    }

    pub fn skip_failed(mut self) -> Self {
        self.skip_failed = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub open: Vec<PhaseName>,
    pub reviews: Option<ReviewSpawn>,
    pub exit: StageExit,
    pub complete: bool,
    /// Phases open in both this and the previous stage close and reopen
    /// within the transition, so no poll sees them closed.
    pub reopen: bool,
}

impl Stage {
    pub fn open(phases: &[PhaseName]) -> Self {
        Self {
            open: phases.to_vec(),
            reviews: None,
            exit: StageExit::Never,
            complete: false,
            reopen: false,
        }
    }

    pub fn completed() -> Self {
        Self {
            complete: true,
            ..Self::open(&[])
        }
    }

    pub fn spawning(mut self, spawn: ReviewSpawn) -> Self {
        self.reviews = Some(spawn);
        self
    }

    pub fn until(mut self, exit: StageExit) -> Self {
        self.exit = exit;
        self
    }

    pub fn reopening(mut self) -> Self {
        self.reopen = true;
        self
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    phases: Vec<PhaseName>,
    stages: Vec<Stage>,
    stage: Option<usize>,
    polls_in_stage: u32,
    challenge: Option<Challenge>,
    roles: Vec<ResourceRole>,
    resources: Vec<Resource>,
    submissions: Vec<Submission>,
    reviews: Vec<Review>,
    appeals: Vec<Appeal>,
    responses: Vec<(String, AppealResponse)>,
    item_patches: Vec<(String, String)>,
    updates: Vec<ChallengeUpdate>,
    calls: Vec<String>,
    get_failures: u32,
    conflicts: BTreeSet<String>,
    appeal_conflicts: u32,
}

pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new(phases: &[PhaseName], stages: Vec<Stage>) -> Self {
        let roles = RoleName::ALL
            .iter()
            .map(|role| ResourceRole {
                id: role_id(*role),
                name: role.as_str().to_string(),
            })
            .collect();
        Self {
            state: Mutex::new(FakeState {
                phases: phases.to_vec(),
                stages,
                roles,
                ..Default::default()
            }),
        }
    }

    pub fn standard(expected_submissions: usize) -> Self {
        use PhaseName::*;
        Self::new(
            &[Registration, Submission, Review, Appeals, AppealsResponse],
            vec![
                Stage::open(&[Registration, Submission]).until(StageExit::Submissions {
                    kind: CONTEST_SUBMISSION,
                    count: expected_submissions,
                }),
                Stage::open(&[Review])
                    .spawning(ReviewSpawn::new(Review, &[RoleName::Reviewer], CONTEST_SUBMISSION))
                    .until(StageExit::ReviewsCommitted),
                Stage::open(&[Appeals]).until(StageExit::Polls(1)),
                Stage::open(&[AppealsResponse]).until(StageExit::Polls(1)),
                Stage::open(&[]).until(StageExit::Polls(1)),
                Stage::completed(),
            ],
        )
    }

    pub fn iterative(submission_phase: PhaseName) -> Self {
        use PhaseName::*;
        Self::new(
            &[Registration, submission_phase, IterativeReview],
            vec![
                Stage::open(&[Registration, submission_phase, IterativeReview])
                    .spawning(
                        ReviewSpawn::new(
                            IterativeReview,
                            &[RoleName::IterativeReviewer, RoleName::Reviewer],
                            CONTEST_SUBMISSION,
                        )
                        .on_submit(),
                    )
                    .until(StageExit::PassingReview),
                Stage::completed(),
            ],
        )
    }

    pub fn design(checkpoint_submissions: usize, final_submissions: usize) -> Self {
        Self::design_stages(checkpoint_submissions, final_submissions, false)
    }

    /// Design challenge whose Approval phase reopens between two polls after
    /// the rejecting pass.
    pub fn design_quick_reopen(checkpoint_submissions: usize, final_submissions: usize) -> Self {
        Self::design_stages(checkpoint_submissions, final_submissions, true)
    }

    fn design_stages(
        checkpoint_submissions: usize,
        final_submissions: usize,
        quick_reopen: bool,
    ) -> Self {
        use PhaseName::*;
        let approval = ReviewSpawn::new(
            Approval,
            &[RoleName::Approver, RoleName::Reviewer],
            CONTEST_SUBMISSION,
        );
        let mut stages = vec![
            Stage::open(&[Registration, CheckpointSubmission]).until(StageExit::Submissions {
                kind: CHECKPOINT_SUBMISSION,
                count: checkpoint_submissions,
            }),
            Stage::open(&[CheckpointScreening])
                .spawning(ReviewSpawn::new(
                    CheckpointScreening,
                    &[
                        RoleName::CheckpointScreener,
                        RoleName::Screener,
                        RoleName::PrimaryScreener,
                        RoleName::Reviewer,
                    ],
                    CHECKPOINT_SUBMISSION,
                ))
                .until(StageExit::ReviewsCommitted),
            Stage::open(&[CheckpointReview])
                .spawning(
                    ReviewSpawn::new(
                        CheckpointReview,
                        &[RoleName::CheckpointReviewer, RoleName::Reviewer],
                        CHECKPOINT_SUBMISSION,
                    )
                    .skip_failed(),
                )
                .until(StageExit::ReviewsCommitted),
            Stage::open(&[Submission]).until(StageExit::Submissions {
                kind: CONTEST_SUBMISSION,
                count: final_submissions,
            }),
            Stage::open(&[Screening])
                .spawning(ReviewSpawn::new(
                    Screening,
                    &[RoleName::Screener, RoleName::PrimaryScreener, RoleName::Reviewer],
                    CONTEST_SUBMISSION,
                ))
                .until(StageExit::ReviewsCommitted),
            Stage::open(&[Review])
                .spawning(
                    ReviewSpawn::new(Review, &[RoleName::Reviewer], CONTEST_SUBMISSION)
                        .skip_failed(),
                )
                .until(StageExit::ReviewsCommitted),
            Stage::open(&[Approval])
                .spawning(approval.clone())
                .until(StageExit::ReviewsCommitted),
            ];
        let reopened = Stage::open(&[Approval])
            .spawning(approval)
            .until(StageExit::ReviewsCommitted);
        if quick_reopen {
            stages.push(reopened.reopening());
        } else {
            stages.push(Stage::open(&[]).until(StageExit::Polls(1)));
            stages.push(reopened);
        }
        stages.push(Stage::open(&[]).until(StageExit::Polls(1)));
        stages.push(Stage::completed());
        Self::new(
            &[
                Registration,
                CheckpointSubmission,
                CheckpointScreening,
                CheckpointReview,
                Submission,
                Screening,
                Review,
                Approval,
            ],
            stages,
        )
    }

    pub fn without_role(self, role: RoleName) -> Self {
        self.lock().roles.retain(|r| r.name != role.as_str());
        self
    }

    pub fn scorecard(id: &str) -> Scorecard {
        Scorecard {
            id: id.to_string(),
            name: "Harness scorecard".to_string(),
            min_score: 0.0,
            max_score: 100.0,
            scorecard_groups: vec![ScorecardGroup {
                id: "g1".into(),
                name: "Group".into(),
                sections: vec![ScorecardSection {
                    id: "s1".into(),
                    name: "Section".into(),
                    questions: vec![
                        ScorecardQuestion {
                            id: SCORECARD_YES_NO.into(),
                            kind: QuestionKind::YesNo,
                            ..Default::default()
                        },
                        ScorecardQuestion {
                            id: SCORECARD_SCALE.into(),
                            kind: QuestionKind::Scale,
                            scale_min: Some(1),
                            scale_max: Some(10),
                            ..Default::default()
                        },
                    ],
                }],
            }],
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn insert_challenge(&self, challenge: Challenge) {
        self.lock().challenge = Some(challenge);
    }

    pub fn fail_next_gets(&self, count: u32) {
        self.lock().get_failures = count;
    }

    /// `add_resource` for `handle` reports a duplicate (the resource exists).
    pub fn conflict_on(&self, handle: &str) {
        self.lock().conflicts.insert(handle.to_string());
    }

    /// The next `count` appeals are stored but reported as duplicates, as if
    /// another client had filed them first.
    pub fn conflict_next_appeals(&self, count: u32) {
        self.lock().appeal_conflicts = count;
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn challenge(&self) -> Option<Challenge> {
        self.lock().challenge.clone()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.lock().resources.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    pub fn reviews(&self) -> Vec<Review> {
        self.lock().reviews.clone()
    }

    pub fn appeals(&self) -> Vec<Appeal> {
        self.lock().appeals.clone()
    }

    pub fn responses(&self) -> Vec<(String, AppealResponse)> {
        self.lock().responses.clone()
    }

    pub fn item_patches(&self) -> Vec<(String, String)> {
        self.lock().item_patches.clone()
    }

    pub fn updates(&self) -> Vec<ChallengeUpdate> {
        self.lock().updates.clone()
    }

    pub fn stage(&self) -> Option<usize> {
        self.lock().stage
    }

    /// A review passes when every answer is `YES` or the top of its scale.
    pub fn review_passes(review: &Review) -> bool {
        !review.review_items.is_empty()
            && review.review_items.iter().all(|item| {
                let answer = item.initial_answer.as_deref().unwrap_or_default();
                match item.scorecard_question_id.as_str() {
                    SCORECARD_YES_NO => answer == "YES",
                    SCORECARD_SCALE => answer == "10",
                    _ => true,
                }
            })
    }
}

fn role_id(role: RoleName) -> String {
    format!("role-{}", role.as_str().to_lowercase().replace(' ', "-"))
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn phase_instance(&self, phase: PhaseName) -> Option<String> {
        self.challenge
            .as_ref()
            .and_then(|c| c.phase(phase))
            .map(|p| p.id.clone())
    }

    fn failed(&self, submission_id: &str) -> bool {
        self.reviews
            .iter()
            .any(|r| {
                r.submission_id == submission_id && r.committed && !FakePlatform::review_passes(r)
            })
    }

    fn enter_stage(&mut self, index: usize) {
        let stage = self.stages[index].clone();
        self.stage = Some(index);
        self.polls_in_stage = 0;
        let winners = if stage.complete { self.winners() } else { Vec::new() };
        let now = Utc::now();

        if let Some(challenge) = self.challenge.as_mut() {
            for phase in &mut challenge.phases {
                let should_open =
                    !stage.complete && phase.kind().is_some_and(|k| stage.open.contains(&k));
                if phase.is_open && !should_open {
                    phase.is_open = false;
                    phase.actual_end_date = Some(now);
                } else if should_open && (!phase.is_open || stage.reopen) {
                    phase.is_open = true;
                    phase.actual_start_date = Some(now);
                    phase.actual_end_date = None;
                }
            }
            if stage.complete {
                challenge.status = "Completed".to_string();
                challenge.winners = winners;
            }
        }

        if let Some(spawn) = &stage.reviews {
            self.spawn_reviews(spawn, None);
        }
    }

    fn spawn_reviews(&mut self, spawn: &ReviewSpawn, only: Option<&str>) {
        let Some(phase_id) = self.phase_instance(spawn.phase) else {
            return;
        };
        let Some(role) = spawn.roles.iter().map(|r| role_id(*r)).find(|id| {
            self.resources.iter().any(|res| &res.role_id == id)
        }) else {
            return;
        };
        let reviewers: Vec<String> = self
            .resources
            .iter()
            .filter(|res| res.role_id == role)
            .map(|res| res.id.clone())
            .collect();
        let submissions: Vec<String> = self
            .submissions
            .iter()
            .filter(|s| s.kind == spawn.kind)
            .filter(|s| only.is_none_or(|id| s.id == id))
            .filter(|s| !spawn.skip_failed || !self.failed(&s.id))
            .map(|s| s.id.clone())
            .collect();

        for reviewer in &reviewers {
            for submission in &submissions {
                let exists = self.reviews.iter().any(|r| {
                    &r.resource_id == reviewer
                        && &r.submission_id == submission
                        && r.phase_id.as_deref() == Some(phase_id.as_str())
                        && r.is_pending()
                });
                if !exists {
                    let id = self.next("review");
                    self.reviews.push(Review {
                        id,
                        resource_id: reviewer.clone(),
                        submission_id: submission.clone(),
                        phase_id: Some(phase_id.clone()),
                        scorecard_id: None,
                        status: "PENDING".into(),
                        committed: false,
                        final_score: None,
                        review_items: Vec::new(),
                    });
                }
            }
        }
    }

    fn gate_met(&self, index: usize) -> bool {
        let stage = &self.stages[index];
        match &stage.exit {
            StageExit::Submissions { kind, count } => {
                self.submissions.iter().filter(|s| s.kind == *kind).count() >= *count
            }
            StageExit::ReviewsCommitted => {
                let phase_id = stage
                    .reviews
                    .as_ref()
                    .and_then(|spawn| self.phase_instance(spawn.phase));
                let in_phase: Vec<&Review> = self
                    .reviews
                    .iter()
                    .filter(|r| r.phase_id.is_some() && r.phase_id == phase_id)
                    .collect();
                !in_phase.is_empty() && in_phase.iter().all(|r| r.committed)
            }
            StageExit::Polls(n) => self.polls_in_stage >= *n,
            StageExit::PassingReview => self
                .reviews
                .iter()
                .any(|r| r.committed && FakePlatform::review_passes(r)),
            StageExit::Never => false,
        }
    }

    fn handle_of(&self, member_id: &str) -> Option<String> {
        self.resources
            .iter()
            .find(|r| r.member_id == member_id)
            .map(|r| r.member_handle.clone())
    }

    fn winners(&self) -> Vec<Winner> {
        let mut members: Vec<String> = self
            .reviews
            .iter()
            .filter(|r| r.committed && FakePlatform::review_passes(r))
            .filter_map(|r| self.submissions.iter().find(|s| s.id == r.submission_id))
            .filter(|s| s.kind == CONTEST_SUBMISSION)
            .map(|s| s.member_id.clone())
            .collect();
        if members.is_empty()
            && let Some(first) = self.submissions.first()
        {
            members.push(first.member_id.clone());
        }
        let mut seen = BTreeSet::new();
        members.retain(|m| seen.insert(m.clone()));
        members
            .into_iter()
            .enumerate()
            .map(|(i, member_id)| Winner {
                handle: self.handle_of(&member_id).unwrap_or_default(),
                placement: u32::try_from(i + 1).unwrap_or(u32::MAX),
                user_id: member_id,
            })
            .collect()
    }

    fn build_items(&mut self, inputs: &[ReviewItemInput]) -> Vec<ReviewItem> {
        inputs
            .iter()
            .map(|input| ReviewItem {
                id: self.next("item"),
                scorecard_question_id: input.scorecard_question_id.clone(),
                initial_answer: Some(input.initial_answer.clone()),
                final_answer: None,
                review_item_comments: input
                    .review_item_comments
                    .iter()
                    .map(|c| ReviewItemComment {
                        id: self.next("comment"),
                        content: c.content.clone(),
                        kind: c.kind.clone(),
                        appeal: None,
                    })
                    .collect(),
            })
            .collect()
    }

    fn comment_mut(&mut self, comment_id: &str) -> Option<&mut ReviewItemComment> {
        self.reviews
            .iter_mut()
            .flat_map(|r| r.review_items.iter_mut())
            .flat_map(|i| i.review_item_comments.iter_mut())
            .find(|c| c.id == comment_id)
    }
}

type Outcome<T> = Result<T, (u16, String)>;

/// Record the call into the step the way the HTTP client does.
fn respond<T>(
    ctx: &StepContext,
    method: &str,
    endpoint: String,
    outcome: Outcome<T>,
) -> Result<T, ApiError> {
    let mut request = RequestContext {
        call_id: ctx.call_id(),
        method: method.to_string(),
        endpoint,
        duration_ms: Some(1),
        ..Default::default()
    };
    match outcome {
        Ok(value) => {
            request.status = Some(200);
            ctx.record_request(CallRecord::from_context(&request, CallOutcome::Success));
            Ok(value)
        }
        Err((status, message)) => {
            request.status = Some(status);
            let err = ApiError::Status {
                request: Box::new(request.clone()),
                status,
                message,
            };
            ctx.record_request(
                CallRecord::from_context(&request, CallOutcome::Failure)
                    .with_message(err.to_string()),
            );
            Err(err)
        }
    }
}

fn not_found<T>(what: &str) -> Outcome<T> {
    Err((404, format!("{what} not found")))
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn create_challenge(
        &self,
        ctx: &StepContext,
        new: &NewChallenge,
    ) -> Result<Challenge, ApiError> {
        ctx.check()?;
        let challenge = {
            let mut s = self.lock();
            s.calls.push("create_challenge".into());
            let id = s.next("challenge");
            let phases = s
                .phases
                .clone()
                .into_iter()
                .map(|phase| {
                    let slug = phase.as_str().to_lowercase().replace(' ', "-");
                    ChallengePhase {
                        id: format!("ph-{slug}"),
                        phase_id: format!("def-{slug}"),
                        name: phase.as_str().to_string(),
                        duration: Some(86_400),
                        ..Default::default()
                    }
                })
                .collect();
            let challenge = Challenge {
                id,
                name: new.name.clone(),
                status: new.status.clone(),
                type_id: Some(new.type_id.clone()),
                track_id: Some(new.track_id.clone()),
                phases,
                winners: Vec::new(),
            };
            s.challenge = Some(challenge.clone());
            challenge
        };
        respond(ctx, "POST", "/challenges".into(), Ok(challenge))
    }

    async fn update_challenge(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
        update: &ChallengeUpdate,
    ) -> Result<Challenge, ApiError> {
        ctx.check()?;
        let outcome = {
            let mut s = self.lock();
            s.calls.push("update_challenge".into());
            s.updates.push(update.clone());
            let activate = update.status.as_deref() == Some("Active");
            let known = s.challenge.as_ref().is_some_and(|c| c.id == challenge_id);
            if !known {
                not_found("challenge")
            } else {
                if let Some(status) = &update.status
                    && let Some(challenge) = s.challenge.as_mut()
                {
                    challenge.status = status.clone();
                }
                if activate && !s.stages.is_empty() {
                    s.enter_stage(0);
                }
                s.challenge.clone().ok_or((404, "challenge vanished".to_string()))
            }
        };
        respond(ctx, "PATCH", format!("/challenges/{challenge_id}"), outcome)
    }

    async fn get_challenge(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Challenge, ApiError> {
        ctx.check()?;
        let outcome = {
            let mut s = self.lock();
            s.calls.push("get_challenge".into());
            if s.get_failures > 0 {
                s.get_failures -= 1;
                Err((503, "Service Unavailable".to_string()))
            } else {
                if let Some(index) = s.stage
                    && index + 1 < s.stages.len()
                    && s.gate_met(index)
                {
                    s.enter_stage(index + 1);
                }
                s.polls_in_stage += 1;
                match s.challenge.clone().filter(|c| c.id == challenge_id) {
                    Some(challenge) => Ok(challenge),
                    None => not_found("challenge"),
                }
            }
        };
        respond(ctx, "GET", format!("/challenges/{challenge_id}"), outcome)
    }

    async fn list_resource_roles(&self, ctx: &StepContext) -> Result<Vec<ResourceRole>, ApiError> {
        ctx.check()?;
        let roles = {
            let mut s = self.lock();
            s.calls.push("list_resource_roles".into());
            s.roles.clone()
        };
        respond(ctx, "GET", "/resource-roles".into(), Ok(roles))
    }

    async fn add_resource(
        &self,
        ctx: &StepContext,
        new: &NewResource,
    ) -> Result<Resource, ApiError> {
        ctx.check()?;
        let outcome = {
            let mut s = self.lock();
            s.calls.push("add_resource".into());
            let id = s.next("resource");
            let resource = Resource {
                id,
                challenge_id: new.challenge_id.clone(),
                member_id: format!("m-{}", new.member_handle),
                member_handle: new.member_handle.clone(),
                role_id: new.role_id.clone(),
            };
            s.resources.push(resource.clone());
            if s.conflicts.contains(&new.member_handle) {
                Err((409, "Resource already exists".to_string()))
            } else {
                Ok(resource)
            }
        };
        respond(ctx, "POST", "/resources".into(), outcome)
    }

    async fn list_resources(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Vec<Resource>, ApiError> {
        ctx.check()?;
        let resources = {
            let mut s = self.lock();
            s.calls.push("list_resources".into());
            s.resources
                .iter()
                .filter(|r| r.challenge_id == challenge_id)
                .cloned()
                .collect()
        };
        respond(ctx, "GET", "/resources".into(), Ok(resources))
    }

    async fn create_submission(
        &self,
        ctx: &StepContext,
        new: &NewSubmission,
    ) -> Result<Submission, ApiError> {
        ctx.check()?;
        let submission = {
            let mut s = self.lock();
            s.calls.push("create_submission".into());
            let id = s.next("submission");
            let submission = Submission {
                id: id.clone(),
                challenge_id: new.challenge_id.clone(),
                member_id: new.member_id.clone(),
                kind: new.kind.clone(),
                url: Some(new.url.clone()),
            };
            s.submissions.push(submission.clone());
            let spawn = s
                .stage
                .and_then(|i| s.stages[i].reviews.clone())
                .filter(|spawn| spawn.on_submit && spawn.kind == new.kind);
            if let Some(spawn) = spawn {
                s.spawn_reviews(&spawn, Some(&id));
            }
            submission
        };
        respond(ctx, "POST", "/submissions".into(), Ok(submission))
    }

    async fn get_scorecard(
        &self,
        ctx: &StepContext,
        scorecard_id: &str,
    ) -> Result<Scorecard, ApiError> {
        ctx.check()?;
        self.lock().calls.push("get_scorecard".into());
        respond(
            ctx,
            "GET",
            format!("/scorecards/{scorecard_id}"),
            Ok(Self::scorecard(scorecard_id)),
        )
    }

    async fn create_review(&self, ctx: &StepContext, new: &NewReview) -> Result<Review, ApiError> {
        ctx.check()?;
        let review = {
            let mut s = self.lock();
            s.calls.push("create_review".into());
            let id = s.next("review");
            let items = s.build_items(&new.review_items);
            let review = Review {
                id,
                resource_id: new.resource_id.clone(),
                submission_id: new.submission_id.clone(),
                phase_id: new.phase_id.clone(),
                scorecard_id: Some(new.scorecard_id.clone()),
                status: new.status.clone(),
                committed: new.committed,
                final_score: None,
                review_items: items,
            };
            s.reviews.push(review.clone());
            review
        };
        respond(ctx, "POST", "/reviews".into(), Ok(review))
    }

    async fn patch_review(
        &self,
        ctx: &StepContext,
        review_id: &str,
        patch: &ReviewPatch,
    ) -> Result<Review, ApiError> {
        ctx.check()?;
        let outcome = {
            let mut s = self.lock();
            s.calls.push("patch_review".into());
            let items = s.build_items(&patch.review_items);
            match s.reviews.iter_mut().find(|r| r.id == review_id) {
                None => not_found("review"),
                Some(review) => {
                    review.scorecard_id = Some(patch.scorecard_id.clone());
                    review.status = patch.status.clone();
                    review.committed = patch.committed;
                    review.review_items = items;
                    Ok(review.clone())
                }
            }
        };
        respond(ctx, "PATCH", format!("/reviews/{review_id}"), outcome)
    }

    async fn list_reviews(
        &self,
        ctx: &StepContext,
        _challenge_id: &str,
    ) -> Result<Vec<Review>, ApiError> {
        ctx.check()?;
        let reviews = {
            let mut s = self.lock();
            s.calls.push("list_reviews".into());
            s.reviews.clone()
        };
        respond(ctx, "GET", "/reviews".into(), Ok(reviews))
    }

    async fn create_appeal(&self, ctx: &StepContext, new: &NewAppeal) -> Result<Appeal, ApiError> {
        ctx.check()?;
        let outcome = {
            let mut s = self.lock();
            s.calls.push("create_appeal".into());
            let id = s.next("appeal");
            let appeal = Appeal {
                id,
                resource_id: new.resource_id.clone(),
                review_item_comment_id: new.review_item_comment_id.clone(),
                content: new.content.clone(),
                appeal_response: None,
            };
            match s.comment_mut(&new.review_item_comment_id) {
                None => not_found("review item comment"),
                Some(comment) if comment.appeal.is_some() => {
                    Err((409, "Appeal already exists for this comment".to_string()))
                }
                Some(comment) => {
                    comment.appeal = Some(appeal.clone());
                    s.appeals.push(appeal.clone());
                    if s.appeal_conflicts > 0 {
                        s.appeal_conflicts -= 1;
                        Err((409, "Appeal already exists for this comment".to_string()))
                    } else {
                        Ok(appeal)
                    }
                }
            }
        };
        respond(ctx, "POST", "/appeals".into(), outcome)
    }

    async fn respond_to_appeal(
        &self,
        ctx: &StepContext,
        appeal_id: &str,
        response: &AppealResponse,
    ) -> Result<AppealResponseRecord, ApiError> {
        ctx.check()?;
        let outcome = {
            let mut s = self.lock();
            s.calls.push("respond_to_appeal".into());
            let id = s.next("response");
            let record = AppealResponseRecord {
                id: Some(id),
                content: response.content.clone(),
                success: response.success,
            };
            let appeal = s
                .reviews
                .iter_mut()
                .flat_map(|r| r.review_items.iter_mut())
                .flat_map(|i| i.review_item_comments.iter_mut())
                .filter_map(|c| c.appeal.as_mut())
                .find(|a| a.id == appeal_id);
            match appeal {
                None => not_found("appeal"),
                Some(appeal) => {
                    appeal.appeal_response = Some(record.clone());
                    s.responses.push((appeal_id.to_string(), response.clone()));
                    Ok(record)
                }
            }
        };
        respond(ctx, "POST", format!("/appeals/{appeal_id}/response"), outcome)
    }

    async fn patch_review_item(
        &self,
        ctx: &StepContext,
        item_id: &str,
        patch: &ReviewItemPatch,
    ) -> Result<ReviewItem, ApiError> {
        ctx.check()?;
        let outcome = {
            let mut s = self.lock();
            s.calls.push("patch_review_item".into());
            let item = s
                .reviews
                .iter_mut()
                .flat_map(|r| r.review_items.iter_mut())
                .find(|i| i.id == item_id);
            match item {
                None => not_found("review item"),
                Some(item) => {
                    item.final_answer = Some(patch.final_answer.clone());
                    let item = item.clone();
                    s.item_patches
                        .push((item_id.to_string(), patch.final_answer.clone()));
                    Ok(item)
                }
            }
        };
        respond(ctx, "PATCH", format!("/review-items/{item_id}"), outcome)
    }
}

/// Artifact store that hands out predictable URLs.
#[derive(Default)]
pub struct FakeArtifacts {
    uploads: Mutex<Vec<String>>,
}

impl FakeArtifacts {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<StoredArtifact, ApiError> {
        let mut uploads = self.uploads.lock().unwrap();
        let key = format!("fake/{}-{}-{}", uploads.len(), bytes.len(), file_name);
        uploads.push(key.clone());
        Ok(StoredArtifact {
            url: format!("https://artifacts.test/{key}"),
            key,
        })
    }
}

/// Flow environment wired to fakes, with zero poll intervals and a fixed seed.
pub fn flow_env(platform: Arc<FakePlatform>, flows: FlowsConfig) -> Arc<FlowEnv> {
    Arc::new(FlowEnv {
        api: platform,
        artifacts: Arc::new(FakeArtifacts::default()),
        tokens: Arc::new(StaticTokenSource::new("test-token")),
        engine: EngineConfig {
            poll_interval_secs: 0,
            review_discovery_attempts: 3,
            review_discovery_interval_secs: 0,
            seed: Some(7),
            ..Default::default()
        },
        flows,
    })
}
