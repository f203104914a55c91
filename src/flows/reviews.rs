//! Locating the pending review the platform created for a submission.

use crate::platform::Review;

#[derive(Debug, PartialEq)]
pub enum ReviewMatch<'a> {
    /// Pending review for this reviewer resource and submission.
    Exact(&'a Review),
    /// No exact match, but exactly one pending review exists for the submission.
    OnlyPending(&'a Review),
    /// Several pending reviews for the submission and none is the reviewer's.
    Ambiguous(usize),
    Missing,
}

impl<'a> ReviewMatch<'a> {
    pub fn review(&self) -> Option<&'a Review> {
        match self {
            ReviewMatch::Exact(review) | ReviewMatch::OnlyPending(review) => Some(review),
            _ => None,
        }
    }
}

/// Match on (reviewer resource id, submission id), falling back to "the only
/// pending review for this submission". A phase id, when given, must match
/// the review's phase if the review carries one.
pub fn match_pending_review<'a>(
    reviews: &'a [Review],
    resource_id: &str,
    submission_id: &str,
    phase_id: Option<&str>,
) -> ReviewMatch<'a> {
    let candidates: Vec<&Review> = reviews
        .iter()
        .filter(|r| r.is_pending() && r.submission_id == submission_id)
        .filter(|r| match (phase_id, r.phase_id.as_deref()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        })
        .collect();

    if let Some(exact) = candidates.iter().find(|r| r.resource_id == resource_id) {
        return ReviewMatch::Exact(*exact);
    }
    match candidates.as_slice() {
        [] => ReviewMatch::Missing,
        [only] => ReviewMatch::OnlyPending(*only),
        many => ReviewMatch::Ambiguous(many.len()),
    }
}
