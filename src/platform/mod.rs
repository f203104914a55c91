//! Remote platform collaborators: the challenge API, token acquisition and
//! artifact storage.
//!
//! Flows only see the traits defined here. Every platform method takes the
//! current [`StepContext`] so the implementation can record the attempt into
//! the step that made it.

pub mod client;
pub mod models;
pub mod storage;
pub mod token;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;

use crate::errors::ApiError;
use crate::step::StepContext;

pub use client::HttpPlatformClient;
pub use models::*;
pub use storage::{ArtifactStore, HttpArtifactStore};
pub use token::{M2mTokenSource, StaticTokenSource, TokenSource};

#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn create_challenge(
        &self,
        ctx: &StepContext,
        challenge: &NewChallenge,
    ) -> Result<Challenge, ApiError>;

    async fn update_challenge(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
        update: &ChallengeUpdate,
    ) -> Result<Challenge, ApiError>;

    /// Move the challenge to `Active`.
    async fn activate_challenge(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Challenge, ApiError> {
        let update = ChallengeUpdate {
            status: Some("Active".to_string()),
            ..Default::default()
        };
        self.update_challenge(ctx, challenge_id, &update).await
    }

    async fn get_challenge(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Challenge, ApiError>;

    async fn list_resource_roles(&self, ctx: &StepContext) -> Result<Vec<ResourceRole>, ApiError>;

    async fn add_resource(
        &self,
        ctx: &StepContext,
        resource: &NewResource,
    ) -> Result<Resource, ApiError>;

    async fn list_resources(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Vec<Resource>, ApiError>;

    async fn create_submission(
        &self,
        ctx: &StepContext,
        submission: &NewSubmission,
    ) -> Result<Submission, ApiError>;

    async fn get_scorecard(
        &self,
        ctx: &StepContext,
        scorecard_id: &str,
    ) -> Result<Scorecard, ApiError>;

    async fn create_review(&self, ctx: &StepContext, review: &NewReview)
    -> Result<Review, ApiError>;

    async fn patch_review(
        &self,
        ctx: &StepContext,
        review_id: &str,
        patch: &ReviewPatch,
    ) -> Result<Review, ApiError>;

    async fn list_reviews(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Vec<Review>, ApiError>;

    async fn create_appeal(&self, ctx: &StepContext, appeal: &NewAppeal)
    -> Result<Appeal, ApiError>;

    async fn respond_to_appeal(
        &self,
        ctx: &StepContext,
        appeal_id: &str,
        response: &AppealResponse,
    ) -> Result<AppealResponseRecord, ApiError>;

    async fn patch_review_item(
        &self,
        ctx: &StepContext,
        item_id: &str,
        patch: &ReviewItemPatch,
    ) -> Result<ReviewItem, ApiError>;
}
