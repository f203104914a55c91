//! Closed sets of the phase and role names the flows know about.
//!
//! Remote lists (resource roles, challenge phases) are scanned once into typed
//! maps keyed by these enums. Optional roles resolve through a fixed fallback
//! chain, see [`RoleName::fallbacks`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PhaseName {
    Registration,
    Submission,
    TopgearSubmission,
    CheckpointSubmission,
    CheckpointScreening,
    CheckpointReview,
    Screening,
    Review,
    IterativeReview,
    Appeals,
    AppealsResponse,
    Approval,
}

impl PhaseName {
    pub const ALL: [PhaseName; 12] = [
        PhaseName::Registration,
        PhaseName::Submission,
        PhaseName::TopgearSubmission,
        PhaseName::CheckpointSubmission,
        PhaseName::CheckpointScreening,
        PhaseName::CheckpointReview,
        PhaseName::Screening,
        PhaseName::Review,
        PhaseName::IterativeReview,
        PhaseName::Appeals,
        PhaseName::AppealsResponse,
        PhaseName::Approval,
    ];

    /// Name as the platform spells it.
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::Registration => "Registration",
            PhaseName::Submission => "Submission",
            PhaseName::TopgearSubmission => "Topgear Submission",
            PhaseName::CheckpointSubmission => "Checkpoint Submission",
            PhaseName::CheckpointScreening => "Checkpoint Screening",
            PhaseName::CheckpointReview => "Checkpoint Review",
            PhaseName::Screening => "Screening",
            PhaseName::Review => "Review",
            PhaseName::IterativeReview => "Iterative Review",
            PhaseName::Appeals => "Appeals",
            PhaseName::AppealsResponse => "Appeals Response",
            PhaseName::Approval => "Approval",
        }
    }

    /// Case- and whitespace-insensitive match against a remote phase name.
    pub fn from_remote(name: &str) -> Option<Self> {
        let wanted = normalize(name);
        Self::ALL
            .into_iter()
            .find(|phase| normalize(phase.as_str()) == wanted)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoleName {
    Copilot,
    Submitter,
    Reviewer,
    IterativeReviewer,
    Screener,
    PrimaryScreener,
    CheckpointScreener,
    CheckpointReviewer,
    Approver,
    Observer,
}

impl RoleName {
    pub const ALL: [RoleName; 10] = [
        RoleName::Copilot,
        RoleName::Submitter,
        RoleName::Reviewer,
        RoleName::IterativeReviewer,
        RoleName::Screener,
        RoleName::PrimaryScreener,
        RoleName::CheckpointScreener,
        RoleName::CheckpointReviewer,
        RoleName::Approver,
        RoleName::Observer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RoleName::Copilot => "Copilot",
            RoleName::Submitter => "Submitter",
            RoleName::Reviewer => "Reviewer",
            RoleName::IterativeReviewer => "Iterative Reviewer",
            RoleName::Screener => "Screener",
            RoleName::PrimaryScreener => "Primary Screener",
            RoleName::CheckpointScreener => "Checkpoint Screener",
            RoleName::CheckpointReviewer => "Checkpoint Reviewer",
            RoleName::Approver => "Approver",
            RoleName::Observer => "Observer",
        }
    }

    pub fn from_remote(name: &str) -> Option<Self> {
        let wanted = normalize(name);
        Self::ALL
            .into_iter()
            .find(|role| normalize(role.as_str()) == wanted)
    }

    /// Roles to try, in order, when this role is missing on the platform.
    pub fn fallbacks(self) -> &'static [RoleName] {
        match self {
            RoleName::IterativeReviewer => &[RoleName::Reviewer],
            RoleName::CheckpointScreener => &[
                RoleName::Screener,
                RoleName::PrimaryScreener,
                RoleName::Reviewer,
            ],
            RoleName::CheckpointReviewer => &[RoleName::Reviewer],
            RoleName::Screener => &[RoleName::PrimaryScreener, RoleName::Reviewer],
            RoleName::PrimaryScreener => &[RoleName::Screener, RoleName::Reviewer],
            RoleName::Approver => &[RoleName::Reviewer],
            _ => &[],
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Role ids discovered on the platform, keyed by known role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleIds {
    ids: BTreeMap<RoleName, String>,
}

impl RoleIds {
    /// Build from `(remote name, id)` pairs; unknown names are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let ids = pairs
            .into_iter()
            .filter_map(|(name, id)| RoleName::from_remote(name).map(|role| (role, id.to_string())))
            .collect();
        Self { ids }
    }

    pub fn insert(&mut self, role: RoleName, id: impl Into<String>) {
        self.ids.insert(role, id.into());
    }

    /// Exact lookup, no fallback.
    pub fn get(&self, role: RoleName) -> Option<&str> {
        self.ids.get(&role).map(String::as_str)
    }

    /// Lookup following the fallback chain. Returns the role actually used.
    pub fn resolve(&self, role: RoleName) -> Option<(RoleName, &str)> {
        std::iter::once(role)
            .chain(role.fallbacks().iter().copied())
            .find_map(|candidate| self.get(candidate).map(|id| (candidate, id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (RoleName, &str)> {
        self.ids.iter().map(|(role, id)| (*role, id.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_match_remote_spelling_loosely() {
        assert_eq!(PhaseName::from_remote("Appeals Response"), Some(PhaseName::AppealsResponse));
        assert_eq!(PhaseName::from_remote("appeals response"), Some(PhaseName::AppealsResponse));
        assert_eq!(PhaseName::from_remote("Iterative-Review"), Some(PhaseName::IterativeReview));
        assert_eq!(PhaseName::from_remote("Post-Mortem"), None);
    }

    #[test]
    fn phase_names_round_trip_through_display() {
        for phase in PhaseName::ALL {
            assert_eq!(PhaseName::from_remote(&phase.to_string()), Some(phase));
        }
    }

    #[test]
    fn role_ids_ignore_unknown_roles() {
        let ids = RoleIds::from_pairs([("Reviewer", "r1"), ("Manager", "m1"), ("Submitter", "s1")]);
        assert_eq!(ids.get(RoleName::Reviewer), Some("r1"));
        assert_eq!(ids.get(RoleName::Submitter), Some("s1"));
        assert_eq!(ids.iter().count(), 2);
    }

    #[test]
    fn resolve_prefers_exact_role() {
        let ids = RoleIds::from_pairs([("Iterative Reviewer", "ir"), ("Reviewer", "r")]);
        assert_eq!(
            ids.resolve(RoleName::IterativeReviewer),
            Some((RoleName::IterativeReviewer, "ir"))
        );
    }

    #[test]
    fn resolve_walks_fallback_chain() {
        let ids = RoleIds::from_pairs([("Primary Screener", "ps"), ("Reviewer", "r")]);
        assert_eq!(
            ids.resolve(RoleName::CheckpointScreener),
            Some((RoleName::PrimaryScreener, "ps"))
        );
        assert_eq!(ids.resolve(RoleName::Approver), Some((RoleName::Reviewer, "r")));
    }

    #[test]
    fn resolve_without_fallback_is_none() {
        let ids = RoleIds::from_pairs([("Reviewer", "r")]);
        assert_eq!(ids.resolve(RoleName::Copilot), None);
    }
}
