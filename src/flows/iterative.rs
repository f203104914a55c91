//! Iterative-review challenges (First2Finish, Topgear, Topgear late).
//!
//! Submissions are reviewed one at a time. The harness fails a configured
//! number of them, creating the next submission while the previous failing
//! review is being patched, then submits once more and passes that one.

use std::time::Duration;

use chrono::Utc;

use super::answers::Verdict;
use super::{FlowKind, FlowRun, ReviewTarget};
use crate::config::IterativeFlowConfig;
use crate::errors::FlowError;
use crate::names::{PhaseName, RoleName};
use crate::platform::{
    CONTEST_SUBMISSION, Challenge, ChallengeUpdate, PhaseUpdate, PrizeSet, ReviewerSlot,
};
use crate::step::StepContext;

pub async fn run(run: &FlowRun) -> Result<(), FlowError> {
    let config = match run.kind() {
        FlowKind::First2Finish => &run.env().flows.first2finish,
        _ => &run.env().flows.topgear,
    };
    IterativeFlow { run, config }.execute().await
}

/// The phase submissions go into for this flow kind.
pub fn submission_phase(kind: FlowKind) -> PhaseName {
    match kind {
        FlowKind::Topgear | FlowKind::TopgearLate => PhaseName::TopgearSubmission,
        _ => PhaseName::Submission,
    }
}

struct IterativeFlow<'a> {
    run: &'a FlowRun,
    config: &'a IterativeFlowConfig,
}

impl IterativeFlow<'_> {
    async fn execute(&self) -> Result<(), FlowError> {
        let run = self.run;
        let settings = &self.config.challenge;
        let interval = run.poll_interval(settings);
        let phase = submission_phase(run.kind());

        run.token_step().await?;
        let created = run.create_challenge_step(settings).await?;
        self.update_draft(&created, phase).await?;
        run.activate_step(&created.id).await?;
        let opened = run
            .await_phases_step(
                "await-registration-submission-open",
                &created.id,
                interval,
                &[PhaseName::Registration, phase],
                &[],
            )
            .await?;
        let challenge = &opened;
        run.assign_resources_step(&challenge.id, &self.assignments())
            .await?;

        let initial = run
            .step("create-initial-submissions", |ctx| async move {
                self.create_initial_submissions(&ctx, &challenge.id).await
            })
            .await?;
        run.step("fail-reviews", |ctx| async move {
            self.fail_reviews(&ctx, challenge, initial).await
        })
        .await?;
        let winning = run
            .step("create-winning-submission", |ctx| async move {
                let submitter = self.submitter(0)?;
                let url = run.upload_artifact(&ctx, settings).await?;
                let id = run
                    .submit(&ctx, &challenge.id, &submitter, CONTEST_SUBMISSION, &url)
                    .await?;
                Ok((submitter, id))
            })
            .await?;
        run.step("pass-review", |ctx| async move {
            let (submitter, submission_id) = winning;
            let target = self.target(&ctx, submitter, submission_id, Verdict::Pass)?;
            run.review_targets(
                &ctx,
                challenge,
                PhaseName::IterativeReview,
                &self.config.scorecard_id,
                vec![target],
                settings.create_missing_reviews,
            )
            .await?;
            Ok(())
        })
        .await?;
        run.completion_step("await-winner", &challenge.id, interval, &[phase])
            .await?;
        Ok(())
    }

    fn assignments(&self) -> Vec<(String, RoleName)> {
        let settings = &self.config.challenge;
        vec![
            (settings.copilot.clone(), RoleName::Copilot),
            (self.config.reviewer.clone(), RoleName::IterativeReviewer),
        ]
        .into_iter()
        .chain(settings.submitters.iter().map(|h| (h.clone(), RoleName::Submitter)))
        .collect()
    }

    fn submitter(&self, index: usize) -> Result<String, FlowError> {
        let submitters = &self.config.challenge.submitters;
        if submitters.is_empty() {
            return Err(FlowError::Config(format!(
                "Flow '{}' needs at least one submitter",
                self.run.kind()
            )));
        }
        Ok(submitters[index % submitters.len()].clone())
    }

    fn target(
        &self,
        ctx: &StepContext,
        submitter: String,
        submission_id: String,
        verdict: Verdict,
    ) -> Result<ReviewTarget, FlowError> {
        let reviewer = self.config.reviewer.clone();
        let resource_id = self
            .run
            .resource_id(&reviewer, RoleName::IterativeReviewer)
            .ok_or_else(|| {
                FlowError::fatal(ctx.name(), format!("{reviewer} holds no reviewer resource"))
            })?;
        Ok(ReviewTarget {
            reviewer,
            resource_id,
            submitter,
            submission_id,
            verdict,
            round: None,
        })
    }

    async fn update_draft(&self, challenge: &Challenge, phase: PhaseName) -> Result<(), FlowError> {
        self.run
            .step("update-draft", |ctx| async move {
                let mut update = ChallengeUpdate {
                    start_date: Some(Utc::now()),
                    prize_sets: Some(vec![PrizeSet::usd(
                        "PLACEMENT",
                        &self.config.challenge.prizes,
                    )]),
                    ..Default::default()
                };
                match challenge.phase(PhaseName::IterativeReview) {
                    Some(review) => {
                        update.reviewers = Some(vec![ReviewerSlot {
                            scorecard_id: self.config.scorecard_id.clone(),
                            is_member_review: true,
                            member_reviewer_count: 1,
                            phase_id: review.phase_id.clone(),
                            base_payment: 0.0,
                            incremental_payment: 0.0,
                            kind: "ITERATIVE_REVIEW".to_string(),
                            should_open_opportunity: false,
                        }]);
                    }
                    None => ctx.warn(
                        "Challenge has no Iterative Review phase; no reviewer slot configured",
                    ),
                }

                if self.run.kind() == FlowKind::TopgearLate {
                    match challenge.phase(phase) {
                        Some(submission) => {
                            update.phases = Some(vec![PhaseUpdate {
                                phase_id: submission.phase_id.clone(),
                                duration: submission.duration,
                                predecessor: Some(None),
                                scheduled_start_date: Some(Utc::now()),
                            }]);
                            ctx.info(format!("{phase} no longer waits for Registration"));
                        }
                        None => ctx.warn(format!(
                            "Challenge has no {phase} phase; dependency left in place"
                        )),
                    }
                }

                self.run
                    .api()
                    .update_challenge(&ctx, &challenge.id, &update)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn create_initial_submissions(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Vec<(String, String)>, FlowError> {
        let url = self.run.upload_artifact(ctx, &self.config.challenge).await?;
        let delay = Duration::from_millis(self.config.submission_delay_ms);
        let mut created = Vec::new();
        for i in 0..self.config.initial_submissions {
            if i > 0 {
                ctx.wait(delay).await?;
            }
            let submitter = self.submitter(i as usize)?;
            let id = self
                .run
                .submit(ctx, challenge_id, &submitter, CONTEST_SUBMISSION, &url)
                .await?;
            created.push((submitter, id));
        }
        Ok(created)
    }

    /// Fail the first `failures_before_pass` submissions. While one failing
    /// review is patched the next submission, if still needed, is created.
    /// Initial submissions beyond the failure rounds are failed afterwards so
    /// only the winning submission is left to review.
    async fn fail_reviews(
        &self,
        ctx: &StepContext,
        challenge: &Challenge,
        queue: Vec<(String, String)>,
    ) -> Result<(), FlowError> {
        let failures = self.config.failures_before_pass as usize;
        let queue = if failures > 0 {
            self.fail_rounds(ctx, challenge, queue, failures).await?
        } else {
            queue
        };

        let extra = queue
            .into_iter()
            .skip(failures)
            .map(|(submitter, id)| self.target(ctx, submitter, id, Verdict::Fail))
            .collect::<Result<Vec<_>, _>>()?;
        if extra.is_empty() {
            return Ok(());
        }
        let count = extra.len();
        self.run
            .review_targets(
                ctx,
                challenge,
                PhaseName::IterativeReview,
                &self.config.scorecard_id,
                extra,
                self.config.challenge.create_missing_reviews,
            )
            .await?;
        ctx.info(format!("Failed {count} extra initial submissions"));
        Ok(())
    }

    /// Returns every submission seen, in review order.
    async fn fail_rounds(
        &self,
        ctx: &StepContext,
        challenge: &Challenge,
        mut queue: Vec<(String, String)>,
        failures: usize,
    ) -> Result<Vec<(String, String)>, FlowError> {
        let url = self.run.upload_artifact(ctx, &self.config.challenge).await?;

        for i in 0..failures {
            if i >= queue.len() {
                let submitter = self.submitter(i)?;
                let id = self
                    .run
                    .submit(ctx, &challenge.id, &submitter, CONTEST_SUBMISSION, &url)
                    .await?;
                queue.push((submitter, id));
            }
            let (submitter, submission_id) = queue[i].clone();
            let target = self.target(ctx, submitter, submission_id, Verdict::Fail)?;
            let needs_next = i + 1 < failures && queue.len() <= i + 1;

            let review = self.run.review_targets(
                ctx,
                challenge,
                PhaseName::IterativeReview,
                &self.config.scorecard_id,
                vec![target],
                self.config.challenge.create_missing_reviews,
            );
            let next = async {
                if !needs_next {
                    return Ok::<_, FlowError>(None);
                }
                let submitter = self.submitter(i + 1)?;
                let id = self
                    .run
                    .submit(ctx, &challenge.id, &submitter, CONTEST_SUBMISSION, &url)
                    .await?;
                Ok(Some((submitter, id)))
            };
            let (reviewed, created) = tokio::join!(review, next);
            reviewed?;
            if let Some(entry) = created? {
                queue.push(entry);
            }
            ctx.info(format!("Failed review {} of {failures}", i + 1));
        }
        Ok(queue)
    }
}
