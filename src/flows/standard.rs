//! Standard challenge: submissions, one review per reviewer and submission,
//! appeals and appeal responses, then completion.

use chrono::Utc;

use super::answers::{Verdict, bump_answer};
use super::{FlowRun, ReviewTarget};
use crate::config::StandardFlowConfig;
use crate::errors::FlowError;
use crate::names::{PhaseName, RoleName};
use crate::platform::{
    AppealResponse, CONTEST_SUBMISSION, Challenge, ChallengeUpdate, NewAppeal, PrizeSet,
    ReviewItemPatch, ReviewerSlot,
};
use crate::step::StepContext;

pub async fn run(run: &FlowRun) -> Result<(), FlowError> {
    let flow = StandardFlow {
        run,
        config: &run.env().flows.standard,
    };
    flow.execute().await
}

struct StandardFlow<'a> {
    run: &'a FlowRun,
    config: &'a StandardFlowConfig,
}

impl StandardFlow<'_> {
    async fn execute(&self) -> Result<(), FlowError> {
        let run = self.run;
        let settings = &self.config.challenge;
        let interval = run.poll_interval(settings);

        run.token_step().await?;
        let challenge = run.create_challenge_step(settings).await?;
        let challenge_id = challenge.id.as_str();
        self.update_draft(&challenge).await?;
        run.activate_step(&challenge.id).await?;
        run.await_phases_step(
            "await-registration-submission-open",
            &challenge.id,
            interval,
            &[PhaseName::Registration, PhaseName::Submission],
            &[],
        )
        .await?;
        run.assign_resources_step(&challenge.id, &self.assignments())
            .await?;
        run.submissions_step(
            "create-submissions",
            &challenge.id,
            settings,
            self.config.submissions_per_submitter,
            CONTEST_SUBMISSION,
        )
        .await?;
        let in_review = run
            .await_phases_step(
                "await-review-open",
                &challenge.id,
                interval,
                &[PhaseName::Review],
                &[],
            )
            .await?;
        self.create_reviews(&in_review).await?;
        run.await_phases_step(
            "await-appeals-open",
            &challenge.id,
            interval,
            &[PhaseName::Appeals],
            &[],
        )
            .await?;
        run.step("create-appeals", |ctx| async move {
            self.create_appeals(&ctx, challenge_id).await.map(|_| ())
        })
        .await?;
        run.await_phases_step(
            "await-appeals-response-open",
            &challenge.id,
            interval,
            &[PhaseName::AppealsResponse],
            &[],
        )
        .await?;
        run.step("respond-to-appeals", |ctx| async move {
            self.respond_to_appeals(&ctx, challenge_id).await.map(|_| ())
        })
        .await?;
        run.await_all_closed_step(&challenge.id, interval).await?;
        run.completion_step("await-completion", &challenge.id, interval, &[])
            .await?;
        Ok(())
    }

    fn assignments(&self) -> Vec<(String, RoleName)> {
        let settings = &self.config.challenge;
        std::iter::once((settings.copilot.clone(), RoleName::Copilot))
            .chain(self.config.reviewers.iter().map(|h| (h.clone(), RoleName::Reviewer)))
            .chain(settings.submitters.iter().map(|h| (h.clone(), RoleName::Submitter)))
            .collect()
    }

    /// Prizes plus the review phase's scorecard and reviewer slot.
    async fn update_draft(&self, challenge: &Challenge) -> Result<(), FlowError> {
        self.run
            .step("update-draft", |ctx| async move {
                let mut reviewers = Vec::new();
                match challenge.phase(PhaseName::Review) {
                    Some(phase) => reviewers.push(ReviewerSlot {
                        scorecard_id: self.config.review_scorecard_id.clone(),
                        is_member_review: true,
                        member_reviewer_count: u32::try_from(self.config.reviewers.len().max(1))
                            .unwrap_or(1),
                        phase_id: phase.phase_id.clone(),
                        base_payment: 0.0,
                        incremental_payment: 0.0,
                        kind: "REGULAR_REVIEW".to_string(),
                        should_open_opportunity: false,
                    }),
                    None => ctx.warn("Challenge has no Review phase; no reviewer slot configured"),
                }
                let update = ChallengeUpdate {
                    start_date: Some(Utc::now()),
                    prize_sets: Some(vec![PrizeSet::usd(
                        "PLACEMENT",
                        &self.config.challenge.prizes,
                    )]),
                    reviewers: Some(reviewers),
                    ..Default::default()
                };
                self.run
                    .api()
                    .update_challenge(&ctx, &challenge.id, &update)
                    .await?;
                ctx.info("Draft updated with prizes and review wiring");
                Ok(())
            })
            .await
    }

    async fn create_reviews(&self, challenge: &Challenge) -> Result<(), FlowError> {
        self.run
            .step("create-reviews", |ctx| async move {
                let mut targets = Vec::new();
                let submissions = self.run.snapshot().read().all_submissions();
                for reviewer in &self.config.reviewers {
                    let resource_id = self
                        .run
                        .resource_id(reviewer, RoleName::Reviewer)
                        .ok_or_else(|| {
                            FlowError::fatal(
                                ctx.name(),
                                format!("{reviewer} holds no Reviewer resource"),
                            )
                        })?;
                    for (submitter, submission_id) in &submissions {
                        targets.push(ReviewTarget {
                            reviewer: reviewer.clone(),
                            resource_id: resource_id.clone(),
                            submitter: submitter.clone(),
                            submission_id: submission_id.clone(),
                            verdict: Verdict::Random,
                            round: None,
                        });
                    }
                }
                let written = self
                    .run
                    .review_targets(
                        &ctx,
                        challenge,
                        PhaseName::Review,
                        &self.config.review_scorecard_id,
                        targets,
                        self.config.challenge.create_missing_reviews,
                    )
                    .await?;
                ctx.info(format!("Committed {} reviews", written.len()));
                Ok(())
            })
            .await
    }

    /// Appeal review-item comments at random. Comments already appealed, in
    /// this run or on the platform, are skipped. Returns the appeals filed.
    async fn create_appeals(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<usize, FlowError> {
        let settings = &self.config.challenge;
        if settings.submitters.is_empty() {
            ctx.warn("No submitters configured; nobody can appeal");
            return Ok(0);
        }
        let reviews = self.run.api().list_reviews(ctx, challenge_id).await?;
        let mut filed = 0;

        for review in reviews.iter().filter(|r| r.committed) {
            for item in &review.review_items {
                for comment in &item.review_item_comments {
                    ctx.check()?;
                    if comment.appeal.is_some()
                        || self.run.snapshot().read().is_appealed(&comment.id)
                    {
                        continue;
                    }
                    if !self.run.chance(self.config.appeal_probability) {
                        continue;
                    }
                    let Some(submitter) = self.run.pick(&settings.submitters) else {
                        continue;
                    };
                    let Some(resource_id) = self.run.resource_id(&submitter, RoleName::Submitter)
                    else {
                        ctx.warn(format!(
                            "{submitter} holds no Submitter resource; skipping appeal"
                        ));
                        continue;
                    };
                    let request = NewAppeal {
                        resource_id,
                        review_item_comment_id: comment.id.clone(),
                        content: format!(
                            "{submitter} disagrees with the answer to {}",
                            item.scorecard_question_id
                        ),
                    };
                    match self.run.api().create_appeal(ctx, &request).await {
                        Ok(appeal) => {
                            self.run
                                .snapshot()
                                .update(|s| s.record_appeal(&comment.id, &appeal.id))?;
                            filed += 1;
                        }
                        // The failed call stays recorded; the comment is not tried again.
                        Err(err) if err.is_conflict() => {
                            ctx.warn(format!("Comment {} was already appealed: {err}", comment.id));
                            self.run.snapshot().update(|s| {
                                s.mark_appealed(&comment.id);
                            })?;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        ctx.info(format!("Filed {filed} appeals"));
        Ok(filed)
    }

    /// Accept or reject every unanswered appeal. An accepted appeal bumps the
    /// item's answer. Returns the responses sent.
    async fn respond_to_appeals(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<usize, FlowError> {
        let reviews = self.run.api().list_reviews(ctx, challenge_id).await?;
        let mut scorecard = None;
        let mut responded = 0;

        for review in &reviews {
            for item in &review.review_items {
                for comment in &item.review_item_comments {
                    let Some(appeal) = &comment.appeal else {
                        continue;
                    };
                    if appeal.appeal_response.is_some()
                        || self
                            .run
                            .snapshot()
                            .read()
                            .responded_appeal_ids
                            .contains(&appeal.id)
                    {
                        continue;
                    }
                    ctx.check()?;
                    let accepted = self.run.chance(self.config.appeal_accept_probability);
                    let response = AppealResponse {
                        resource_id: review.resource_id.clone(),
                        content: if accepted {
                            "Appeal accepted, answer revised".to_string()
                        } else {
                            "Appeal rejected, answer stands".to_string()
                        },
                        success: accepted,
                    };
                    self.run
                        .api()
                        .respond_to_appeal(ctx, &appeal.id, &response)
                        .await?;

                    if accepted {
                        if scorecard.is_none() {
                            let id = review
                                .scorecard_id
                                .clone()
                                .unwrap_or_else(|| self.config.review_scorecard_id.clone());
                            scorecard = Some(self.run.api().get_scorecard(ctx, &id).await?);
                        }
                        let question = scorecard
                            .as_ref()
                            .and_then(|s| s.question(&item.scorecard_question_id));
                        let final_answer = bump_answer(question, item.answer().unwrap_or_default());
                        self.run
                            .api()
                            .patch_review_item(ctx, &item.id, &ReviewItemPatch { final_answer })
                            .await?;
                    }
                    self.run
                        .snapshot()
                        .update(|s| s.mark_responded(&appeal.id))?;
                    responded += 1;
                }
            }
        }
        ctx.info(format!("Responded to {responded} appeals"));
        Ok(responded)
    }
}
