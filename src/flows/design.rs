//! Design challenge: checkpoint screening and review ahead of the final
//! submission, screening, review and a two-round approval.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;

use super::answers::Verdict;
use super::{FlowRun, ReviewTarget};
use crate::config::DesignFlowConfig;
use crate::errors::FlowError;
use crate::names::{PhaseName, RoleName};
use crate::platform::{
    CHECKPOINT_SUBMISSION, CONTEST_SUBMISSION, Challenge, ChallengeUpdate, PhaseState, PrizeSet,
    ReviewerSlot,
};
use crate::step::StepContext;

pub async fn run(run: &FlowRun) -> Result<(), FlowError> {
    DesignFlow {
        run,
        config: &run.env().flows.design,
    }
    .execute()
    .await
}

/// One phase-gated review pass.
struct Pass<'a> {
    step: &'static str,
    phase: PhaseName,
    role: RoleName,
    handle: &'a str,
    scorecard: Option<&'a str>,
}

struct DesignFlow<'a> {
    run: &'a FlowRun,
    config: &'a DesignFlowConfig,
}

impl DesignFlow<'_> {
    async fn execute(&self) -> Result<(), FlowError> {
        let run = self.run;
        let config = self.config;
        let settings = &config.challenge;
        let interval = run.poll_interval(settings);

        run.token_step().await?;
        let created = run.create_challenge_step(settings).await?;
        self.update_draft(&created).await?;
        run.activate_step(&created.id).await?;
        let challenge_id = created.id.as_str();
        run.await_phases_step(
            "await-checkpoint-submission-open",
            challenge_id,
            interval,
            &[PhaseName::Registration, PhaseName::CheckpointSubmission],
            &[],
        )
        .await?;
        run.assign_resources_step(challenge_id, &self.assignments())
            .await?;
        let checkpoints = run
            .submissions_step(
                "create-checkpoint-submissions",
                challenge_id,
                settings,
                config.checkpoint_submissions_per_submitter,
                CHECKPOINT_SUBMISSION,
            )
            .await?;

        let challenge = run
            .await_phases_step(
                "await-checkpoint-screening-open",
                challenge_id,
                interval,
                &[PhaseName::CheckpointScreening],
                &[],
            )
            .await?;
        let failed = checkpoint_failures(&checkpoints);
        let screening = Pass {
            step: "checkpoint-screening",
            phase: PhaseName::CheckpointScreening,
            role: RoleName::CheckpointScreener,
            handle: config.checkpoint_screener(),
            scorecard: config.checkpoint_screening_scorecard(),
        };
        self.review_pass(&challenge, &screening, &checkpoints, |id| {
            if failed.contains(id) {
                Verdict::Fail
            } else {
                Verdict::Pass
            }
        })
        .await?;

        let challenge = run
            .await_phases_step(
                "await-checkpoint-review-open",
                challenge_id,
                interval,
                &[PhaseName::CheckpointReview],
                &[],
            )
            .await?;
        let survivors: Vec<(String, String)> = checkpoints
            .iter()
            .filter(|(_, id)| !failed.contains(id.as_str()))
            .cloned()
            .collect();
        let checkpoint_review = Pass {
            step: "checkpoint-review",
            phase: PhaseName::CheckpointReview,
            role: RoleName::CheckpointReviewer,
            handle: config.checkpoint_reviewer(),
            scorecard: config.checkpoint_review_scorecard(),
        };
        self.review_pass(&challenge, &checkpoint_review, &survivors, |_| Verdict::Pass)
            .await?;

        run.await_phases_step(
            "await-submission-open",
            challenge_id,
            interval,
            &[PhaseName::Submission],
            &[],
        )
        .await?;
        let finals = run
            .submissions_step(
                "create-submissions",
                challenge_id,
                settings,
                config.submissions_per_submitter,
                CONTEST_SUBMISSION,
            )
            .await?;

        let challenge = run
            .await_phases_step(
                "await-screening-open",
                challenge_id,
                interval,
                &[PhaseName::Screening],
                &[],
            )
            .await?;
        let screening = Pass {
            step: "screening",
            phase: PhaseName::Screening,
            role: RoleName::Screener,
            handle: config.screener(),
            scorecard: config.screening_scorecard(),
        };
        self.review_pass(&challenge, &screening, &finals, |_| Verdict::Pass)
            .await?;

        let challenge = run
            .await_phases_step(
                "await-review-open",
                challenge_id,
                interval,
                &[PhaseName::Review],
                &[],
            )
            .await?;
        let review = Pass {
            step: "review",
            phase: PhaseName::Review,
            role: RoleName::Reviewer,
            handle: &config.reviewer,
            scorecard: config.review_scorecard(),
        };
        self.review_pass(&challenge, &review, &finals, |_| Verdict::Random)
            .await?;

        let challenge = run
            .await_phases_step(
                "await-approval-open",
                challenge_id,
                interval,
                &[PhaseName::Approval],
                &[],
            )
            .await?;
        let reject = Pass {
            step: "approval-reject",
            phase: PhaseName::Approval,
            role: RoleName::Approver,
            handle: config.approver(),
            scorecard: config.approval_scorecard(),
        };
        self.review_pass(&challenge, &reject, &finals, |_| Verdict::Fail)
            .await?;

        let challenge = run
            .step("await-approval-reopen", |ctx| async move {
                self.await_approval_reopen(&ctx, &challenge, interval).await
            })
            .await?;
        let approve = Pass {
            step: "approval-pass",
            ..reject
        };
        self.review_pass(&challenge, &approve, &finals, |_| Verdict::Pass)
            .await?;

        run.await_all_closed_step(challenge_id, interval).await?;
        run.completion_step("await-completion", challenge_id, interval, &[])
            .await?;
        Ok(())
    }

    /// Wait for Approval to open again after the rejecting pass. A reopen
    /// counts once a poll has seen the phase closed, or when the open phase
    /// carries a new instance id or start date, since the platform may close
    /// and reopen it between two polls.
    async fn await_approval_reopen(
        &self,
        ctx: &StepContext,
        before: &Challenge,
        interval: Duration,
    ) -> Result<Challenge, FlowError> {
        let previous = before
            .phase(PhaseName::Approval)
            .map(|p| (p.id.clone(), p.actual_start_date));
        let mut seen_closed = false;
        self.run
            .poller(&before.id, interval)
            .await_condition(
                ctx,
                "Approval reopened",
                &[(PhaseName::Approval, PhaseState::Open)],
                |challenge| {
                    let Some(phase) = challenge.phase(PhaseName::Approval) else {
                        return false;
                    };
                    if phase.state() != PhaseState::Open {
                        if !seen_closed {
                            ctx.info("Approval closed after rejection; waiting for it to reopen");
                        }
                        seen_closed = true;
                        return false;
                    }
                    seen_closed
                        || previous.as_ref().is_some_and(|(id, started)| {
                            *id != phase.id
                                || (started.is_some() && *started != phase.actual_start_date)
                        })
                },
            )
            .await
    }

    fn assignments(&self) -> Vec<(String, RoleName)> {
        let config = self.config;
        let settings = &config.challenge;
        let mut seen = BTreeSet::new();
        [
            (settings.copilot.as_str(), RoleName::Copilot),
            (config.reviewer.as_str(), RoleName::Reviewer),
            (config.screener(), RoleName::Screener),
            (config.checkpoint_screener(), RoleName::CheckpointScreener),
            (config.checkpoint_reviewer(), RoleName::CheckpointReviewer),
            (config.approver(), RoleName::Approver),
        ]
        .into_iter()
        .chain(settings.submitters.iter().map(|h| (h.as_str(), RoleName::Submitter)))
        .filter(|(handle, role)| seen.insert((handle.to_string(), *role)))
        .map(|(handle, role)| (handle.to_string(), role))
        .collect()
    }

    async fn update_draft(&self, challenge: &Challenge) -> Result<(), FlowError> {
        let config = self.config;
        let slots = [
            (
                PhaseName::CheckpointScreening,
                config.checkpoint_screening_scorecard(),
                "CHECKPOINT_SCREENING",
            ),
            (
                PhaseName::CheckpointReview,
                config.checkpoint_review_scorecard(),
                "CHECKPOINT_REVIEW",
            ),
            (PhaseName::Screening, config.screening_scorecard(), "SCREENING"),
            (PhaseName::Review, config.review_scorecard(), "REGULAR_REVIEW"),
            (PhaseName::Approval, config.approval_scorecard(), "APPROVAL"),
        ];
        self.run
            .step("update-draft", |ctx| async move {
                let mut reviewers = Vec::new();
                for (phase, scorecard, kind) in slots {
                    let (Some(found), Some(scorecard)) = (challenge.phase(phase), scorecard) else {
                        ctx.warn(format!(
                            "No reviewer slot for {phase}: phase or scorecard missing"
                        ));
                        continue;
                    };
                    reviewers.push(ReviewerSlot {
                        scorecard_id: scorecard.to_string(),
                        is_member_review: true,
                        member_reviewer_count: 1,
                        phase_id: found.phase_id.clone(),
                        base_payment: 0.0,
                        incremental_payment: 0.0,
                        kind: kind.to_string(),
                        should_open_opportunity: false,
                    });
                }
                let update = ChallengeUpdate {
                    start_date: Some(Utc::now()),
                    prize_sets: Some(vec![
                        PrizeSet::usd("PLACEMENT", &config.challenge.prizes),
                        PrizeSet::usd("CHECKPOINT", &config.checkpoint_prizes),
                    ]),
                    reviewers: Some(reviewers),
                    ..Default::default()
                };
                self.run
                    .api()
                    .update_challenge(&ctx, &challenge.id, &update)
                    .await?;
                Ok(())
            })
            .await
    }

    /// Review every submission in `submissions` as the pass's handle, with the
    /// verdict chosen per submission id.
    async fn review_pass(
        &self,
        challenge: &Challenge,
        pass: &Pass<'_>,
        submissions: &[(String, String)],
        verdict: impl Fn(&str) -> Verdict,
    ) -> Result<(), FlowError> {
        self.run
            .step(pass.step, |ctx| async move {
                let scorecard = pass.scorecard.ok_or_else(|| {
                    FlowError::Config(format!("No scorecard configured for {}", pass.step))
                })?;
                let targets = self.targets(&ctx, pass, submissions, &verdict)?;
                let written = self
                    .run
                    .review_targets(
                        &ctx,
                        challenge,
                        pass.phase,
                        scorecard,
                        targets,
                        self.config.challenge.create_missing_reviews,
                    )
                    .await?;
                ctx.info(format!(
                    "{}: committed {} reviews as {}",
                    pass.step,
                    written.len(),
                    pass.handle
                ));
                Ok(())
            })
            .await
    }

    fn targets(
        &self,
        ctx: &StepContext,
        pass: &Pass<'_>,
        submissions: &[(String, String)],
        verdict: &impl Fn(&str) -> Verdict,
    ) -> Result<Vec<ReviewTarget>, FlowError> {
        let resource_id = self.run.resource_id(pass.handle, pass.role).ok_or_else(|| {
            FlowError::fatal(
                ctx.name(),
                format!("{} holds no {} resource", pass.handle, pass.role),
            )
        })?;
        Ok(submissions
            .iter()
            .map(|(submitter, submission_id)| ReviewTarget {
                reviewer: pass.handle.to_string(),
                resource_id: resource_id.clone(),
                submitter: submitter.clone(),
                submission_id: submission_id.clone(),
                verdict: verdict(submission_id),
                round: Some(pass.step),
            })
            .collect())
    }
}

/// The first checkpoint submission of every submitter is screened out.
fn checkpoint_failures(checkpoints: &[(String, String)]) -> BTreeSet<&str> {
    let mut seen = BTreeSet::new();
    checkpoints
        .iter()
        .filter(|(submitter, _)| seen.insert(submitter.as_str()))
        .map(|(_, id)| id.as_str())
        .collect()
}
