//! Records exchanged with the challenge platform.
//!
//! Only the fields the flows read or write are modelled; everything else in
//! the platform's payloads is ignored on the way in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::names::PhaseName;

/// Accept ids the platform sends either as strings or as numbers.
fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}

// ── Challenge ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub type_id: Option<String>,
    #[serde(default)]
    pub track_id: Option<String>,
    #[serde(default)]
    pub phases: Vec<ChallengePhase>,
    #[serde(default)]
    pub winners: Vec<Winner>,
}

impl Challenge {
    pub fn phase(&self, name: PhaseName) -> Option<&ChallengePhase> {
        self.phases.iter().find(|p| p.kind() == Some(name))
    }

    pub fn phase_state(&self, name: PhaseName) -> Option<PhaseState> {
        self.phase(name).map(ChallengePhase::state)
    }

    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }

    pub fn all_phases_closed(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(|p| p.state() == PhaseState::Closed)
    }
}

/// Lifecycle state of a phase derived from the platform's flags and dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseState {
    NotStarted,
    Open,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePhase {
    /// Id of this phase instance on the challenge.
    #[serde(default)]
    pub id: String,
    /// Id of the phase definition (shared across challenges).
    #[serde(default)]
    pub phase_id: String,
    pub name: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub predecessor: Option<String>,
    #[serde(default)]
    pub scheduled_start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_end_date: Option<DateTime<Utc>>,
}

impl ChallengePhase {
    pub fn kind(&self) -> Option<PhaseName> {
        PhaseName::from_remote(&self.name)
    }

    pub fn state(&self) -> PhaseState {
        if self.is_open {
            PhaseState::Open
        } else if self.actual_end_date.is_some() || self.actual_start_date.is_some() {
            PhaseState::Closed
        } else {
            PhaseState::NotStarted
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub handle: String,
    #[serde(default)]
    pub placement: u32,
    #[serde(default, deserialize_with = "lenient_id")]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChallenge {
    pub name: String,
    pub type_id: String,
    pub track_id: String,
    pub timeline_template_id: String,
    pub project_id: u64,
    pub status: String,
    pub description: String,
    pub tags: Vec<String>,
    pub start_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prize_sets: Option<Vec<PrizeSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewers: Option<Vec<ReviewerSlot>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<PhaseUpdate>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizeSet {
    #[serde(rename = "type")]
    pub kind: String,
    pub prizes: Vec<Prize>,
}

impl PrizeSet {
    pub fn usd(kind: &str, values: &[f64]) -> Self {
        Self {
            kind: kind.to_string(),
            prizes: values
                .iter()
                .map(|value| Prize {
                    kind: "USD".to_string(),
                    value: *value,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prize {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
}

/// Review-phase wiring: which scorecard and how many reviewers a phase uses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerSlot {
    pub scorecard_id: String,
    pub is_member_review: bool,
    pub member_reviewer_count: u32,
    pub phase_id: String,
    pub base_payment: f64,
    pub incremental_payment: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub should_open_opportunity: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseUpdate {
    pub phase_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// `Some(None)` serializes as `null` and clears the dependency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_start_date: Option<DateTime<Utc>>,
}

// ── Resources ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRole {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub challenge_id: String,
    #[serde(default, deserialize_with = "lenient_id")]
    pub member_id: String,
    #[serde(default)]
    pub member_handle: String,
    #[serde(default)]
    pub role_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewResource {
    pub challenge_id: String,
    pub member_handle: String,
    pub role_id: String,
}

// ── Submissions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    #[serde(default)]
    pub challenge_id: String,
    #[serde(default, deserialize_with = "lenient_id")]
    pub member_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub challenge_id: String,
    pub member_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub file_type: String,
}

pub const CONTEST_SUBMISSION: &str = "ContestSubmission";
pub const CHECKPOINT_SUBMISSION: &str = "CheckpointSubmission";

// ── Scorecards ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scorecard {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    #[serde(default)]
    pub scorecard_groups: Vec<ScorecardGroup>,
}

fn default_max_score() -> f64 {
    100.0
}

impl Scorecard {
    pub fn questions(&self) -> impl Iterator<Item = &ScorecardQuestion> {
        self.scorecard_groups
            .iter()
            .flat_map(|g| g.sections.iter())
            .flat_map(|s| s.questions.iter())
    }

    pub fn question(&self, id: &str) -> Option<&ScorecardQuestion> {
        self.questions().find(|q| q.id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorecardGroup {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sections: Vec<ScorecardSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorecardSection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub questions: Vec<ScorecardQuestion>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    #[serde(rename = "YES_NO")]
    YesNo,
    #[default]
    #[serde(rename = "SCALE")]
    Scale,
    #[serde(rename = "TEST_CASE")]
    TestCase,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorecardQuestion {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub kind: QuestionKind,
    #[serde(default)]
    pub scale_min: Option<i64>,
    #[serde(default)]
    pub scale_max: Option<i64>,
    #[serde(default)]
    pub weight: Option<f64>,
}

// ── Reviews & appeals ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub submission_id: String,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub scorecard_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub committed: bool,
    #[serde(default)]
    pub final_score: Option<f64>,
    #[serde(default)]
    pub review_items: Vec<ReviewItem>,
}

impl Review {
    pub fn is_pending(&self) -> bool {
        !self.committed && !self.status.eq_ignore_ascii_case("completed")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    #[serde(default)]
    pub scorecard_question_id: String,
    #[serde(default)]
    pub initial_answer: Option<String>,
    #[serde(default)]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub review_item_comments: Vec<ReviewItemComment>,
}

impl ReviewItem {
    pub fn answer(&self) -> Option<&str> {
        self.final_answer
            .as_deref()
            .or(self.initial_answer.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItemComment {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub appeal: Option<Appeal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appeal {
    pub id: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub review_item_comment_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub appeal_response: Option<AppealResponseRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppealResponseRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentInput {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sort_order: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItemInput {
    pub scorecard_question_id: String,
    pub initial_answer: String,
    pub review_item_comments: Vec<CommentInput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReview {
    pub resource_id: String,
    pub submission_id: String,
    pub scorecard_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    pub status: String,
    pub committed: bool,
    pub review_items: Vec<ReviewItemInput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPatch {
    pub scorecard_id: String,
    pub status: String,
    pub committed: bool,
    pub review_items: Vec<ReviewItemInput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItemPatch {
    pub final_answer: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAppeal {
    pub resource_id: String,
    pub review_item_comment_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppealResponse {
    pub resource_id: String,
    pub content: String,
    pub success: bool,
}

/// Location of an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub key: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn challenge_deserializes_platform_payload() {
        let challenge: Challenge = serde_json::from_value(json!({
            "id": "c1",
            "name": "Harness",
            "status": "Active",
            "legacyId": 123,
            "phases": [
                {"id": "p1", "phaseId": "def-reg", "name": "Registration", "isOpen": true,
                 "scheduledEndDate": "2026-01-01T00:00:00Z", "actualStartDate": "2025-12-31T00:00:00Z"},
                {"id": "p2", "phaseId": "def-rev", "name": "Review", "isOpen": false}
            ],
            "winners": [{"handle": "alice", "placement": 1, "userId": 42}]
        }))
        .unwrap();

        assert_eq!(challenge.phase_state(PhaseName::Registration), Some(PhaseState::Open));
        assert_eq!(challenge.phase_state(PhaseName::Review), Some(PhaseState::NotStarted));
        assert_eq!(challenge.phase_state(PhaseName::Appeals), None);
        assert_eq!(challenge.winners[0].user_id, "42");
        assert!(!challenge.is_completed());
    }

    #[test]
    fn phase_with_actual_dates_and_closed_flag_is_closed() {
        let phase = ChallengePhase {
            name: "Submission".into(),
            is_open: false,
            actual_end_date: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(phase.state(), PhaseState::Closed);
    }

    #[test]
    fn all_phases_closed_requires_phases() {
        let empty = Challenge::default();
        assert!(!empty.all_phases_closed());
    }

    #[test]
    fn scorecard_questions_flatten_groups_and_sections() {
        let scorecard: Scorecard = serde_json::from_value(json!({
            "id": "sc",
            "scorecardGroups": [
                {"sections": [
                    {"questions": [{"id": "q1", "type": "YES_NO"}, {"id": "q2", "type": "SCALE", "scaleMin": 1, "scaleMax": 10}]}
                ]},
                {"sections": [{"questions": [{"id": "q3", "type": "SOMETHING_NEW"}]}]}
            ]
        }))
        .unwrap();
        let kinds: Vec<_> = scorecard.questions().map(|q| q.kind).collect();
        assert_eq!(kinds, vec![QuestionKind::YesNo, QuestionKind::Scale, QuestionKind::Other]);
        assert_eq!(scorecard.question("q2").and_then(|q| q.scale_max), Some(10));
        assert_eq!(scorecard.max_score, 100.0);
    }

    #[test]
    fn review_pending_detection() {
        let mut review = Review {
            id: "r".into(),
            status: "PENDING".into(),
            ..Default::default()
        };
        assert!(review.is_pending());
        review.committed = true;
        assert!(!review.is_pending());
    }

    #[test]
    fn phase_update_can_clear_predecessor() {
        let update = PhaseUpdate {
            phase_id: "p".into(),
            predecessor: Some(None),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("predecessor").unwrap().is_null());
        assert!(json.get("duration").is_none());
    }

    #[test]
    fn resource_accepts_numeric_member_id() {
        let resource: Resource = serde_json::from_value(json!({
            "id": "res", "memberId": 8547899, "memberHandle": "alice", "roleId": "sub"
        }))
        .unwrap();
        assert_eq!(resource.member_id, "8547899");
    }
}
