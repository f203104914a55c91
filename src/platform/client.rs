//! reqwest-backed [`PlatformApi`] implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::PlatformApi;
use super::models::*;
use super::token::TokenSource;
use crate::cancel::Cancelled;
use crate::errors::{ApiError, RequestContext};
use crate::recorder::{CallOutcome, CallRecord};
use crate::step::StepContext;

pub struct HttpPlatformClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpPlatformClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Shared reqwest client with the configured request timeout.
    pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ApiError> {
        reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("challenge-harness/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Auth(format!("failed to build HTTP client: {e}")))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        ctx: &StepContext,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        ctx.check()?;

        let mut request = RequestContext {
            call_id: ctx.call_id(),
            method: method.as_str().to_string(),
            endpoint: path.to_string(),
            request_body: body.clone(),
            ..Default::default()
        };

        let token = match self.tokens.token().await {
            Ok(token) => token,
            Err(err) => {
                record(ctx, &request, CallOutcome::Failure, Some(err.to_string()));
                return Err(err);
            }
        };

        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(token);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let sent = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => return Err(Cancelled.into()),
            sent = builder.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                request.duration_ms = Some(elapsed_ms(started));
                let err = ApiError::Transport {
                    request: Box::new(request.clone()),
                    message: e.to_string(),
                };
                record(ctx, &request, CallOutcome::Failure, Some(err.to_string()));
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        request.status = Some(status);
        let text = response.text().await.unwrap_or_default();
        request.duration_ms = Some(elapsed_ms(started));
        request.response_body = parse_body(&text);

        if !(200..300).contains(&status) {
            let err = ApiError::Status {
                request: Box::new(request.clone()),
                status,
                message: error_message(request.response_body.as_ref(), status),
            };
            record(ctx, &request, CallOutcome::Failure, Some(err.to_string()));
            return Err(err);
        }

        let value = request.response_body.clone().unwrap_or(Value::Null);
        let parsed = match serde_json::from_value::<T>(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                let err = ApiError::Decode {
                    request: Box::new(request.clone()),
                    message: e.to_string(),
                };
                record(ctx, &request, CallOutcome::Failure, Some(err.to_string()));
                return Err(err);
            }
        };

        record(ctx, &request, CallOutcome::Success, None);
        ctx.check()?;
        Ok(parsed)
    }

    async fn send_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        ctx: &StepContext,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body).map_err(|e| ApiError::Decode {
            request: Box::new(RequestContext {
                call_id: ctx.call_id(),
                method: method.as_str().to_string(),
                endpoint: path.to_string(),
                ..Default::default()
            }),
            message: format!("unserializable request body: {e}"),
        })?;
        self.send(ctx, method, path, &[], Some(body)).await
    }
}

fn record(
    ctx: &StepContext,
    request: &RequestContext,
    outcome: CallOutcome,
    message: Option<String>,
) {
    let mut record = CallRecord::from_context(request, outcome);
    record.message = message;
    ctx.record_request(record);
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn parse_body(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

/// Pull a human-readable message out of an error body.
fn error_message(body: Option<&Value>, status: u16) -> String {
    match body {
        Some(Value::Object(map)) => ["message", "error", "detail"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => format!("HTTP {status}"),
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformClient {
    async fn create_challenge(
        &self,
        ctx: &StepContext,
        challenge: &NewChallenge,
    ) -> Result<Challenge, ApiError> {
        self.send_json(ctx, Method::POST, "/challenges", challenge).await
    }

    async fn update_challenge(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
        update: &ChallengeUpdate,
    ) -> Result<Challenge, ApiError> {
        self.send_json(ctx, Method::PATCH, &format!("/challenges/{challenge_id}"), update)
            .await
    }

    async fn get_challenge(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Challenge, ApiError> {
        self.send(ctx, Method::GET, &format!("/challenges/{challenge_id}"), &[], None)
            .await
    }

    async fn list_resource_roles(&self, ctx: &StepContext) -> Result<Vec<ResourceRole>, ApiError> {
        self.send(ctx, Method::GET, "/resource-roles", &[], None).await
    }

    async fn add_resource(
        &self,
        ctx: &StepContext,
        resource: &NewResource,
    ) -> Result<Resource, ApiError> {
        self.send_json(ctx, Method::POST, "/resources", resource).await
    }

    async fn list_resources(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Vec<Resource>, ApiError> {
        self.send(
            ctx,
            Method::GET,
            "/resources",
            &[("challengeId", challenge_id)],
            None,
        )
        .await
    }

    async fn create_submission(
        &self,
        ctx: &StepContext,
        submission: &NewSubmission,
    ) -> Result<Submission, ApiError> {
        self.send_json(ctx, Method::POST, "/submissions", submission).await
    }

    async fn get_scorecard(
        &self,
        ctx: &StepContext,
        scorecard_id: &str,
    ) -> Result<Scorecard, ApiError> {
        self.send(ctx, Method::GET, &format!("/scorecards/{scorecard_id}"), &[], None)
            .await
    }

    async fn create_review(
        &self,
        ctx: &StepContext,
        review: &NewReview,
    ) -> Result<Review, ApiError> {
        self.send_json(ctx, Method::POST, "/reviews", review).await
    }

    async fn patch_review(
        &self,
        ctx: &StepContext,
        review_id: &str,
        patch: &ReviewPatch,
    ) -> Result<Review, ApiError> {
        self.send_json(ctx, Method::PATCH, &format!("/reviews/{review_id}"), patch)
            .await
    }

    async fn list_reviews(
        &self,
        ctx: &StepContext,
        challenge_id: &str,
    ) -> Result<Vec<Review>, ApiError> {
        self.send(
            ctx,
            Method::GET,
            "/reviews",
            &[("challengeId", challenge_id), ("perPage", "500")],
            None,
        )
        .await
    }

    async fn create_appeal(
        &self,
        ctx: &StepContext,
        appeal: &NewAppeal,
    ) -> Result<Appeal, ApiError> {
        self.send_json(ctx, Method::POST, "/appeals", appeal).await
    }

    async fn respond_to_appeal(
        &self,
        ctx: &StepContext,
        appeal_id: &str,
        response: &AppealResponse,
    ) -> Result<AppealResponseRecord, ApiError> {
        self.send_json(
            ctx,
            Method::POST,
            &format!("/appeals/{appeal_id}/response"),
            response,
        )
        .await
    }

    async fn patch_review_item(
        &self,
        ctx: &StepContext,
        item_id: &str,
        patch: &ReviewItemPatch,
    ) -> Result<ReviewItem, ApiError> {
        self.send_json(ctx, Method::PATCH, &format!("/review-items/{item_id}"), patch)
            .await
    }
}
