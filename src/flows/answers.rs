//! Scorecard answer generation.

use rand::Rng;

use crate::platform::{CommentInput, QuestionKind, ReviewItemInput, Scorecard, ScorecardQuestion};

/// How a generated review should come out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Random,
    Pass,
    Fail,
}

pub const YES: &str = "YES";
pub const NO: &str = "NO";

fn scale_bounds(question: &ScorecardQuestion) -> (i64, i64) {
    let min = question.scale_min.unwrap_or(0);
    let max = question.scale_max.unwrap_or(min.max(10));
    if max < min { (max, min) } else { (min, max) }
}

pub fn answer_for<R: Rng>(question: &ScorecardQuestion, verdict: Verdict, rng: &mut R) -> String {
    match question.kind {
        QuestionKind::YesNo => match verdict {
            Verdict::Pass => YES.to_string(),
            Verdict::Fail => NO.to_string(),
            Verdict::Random => (if rng.gen_bool(0.5) { YES } else { NO }).to_string(),
        },
        QuestionKind::Scale | QuestionKind::TestCase | QuestionKind::Other => {
            let (min, max) = scale_bounds(question);
            let value = match verdict {
                Verdict::Pass => max,
                Verdict::Fail => min,
                Verdict::Random => rng.gen_range(min..=max),
            };
            value.to_string()
        }
    }
}

/// One review item per scorecard question, each carrying a comment so the
/// review has appeal targets.
pub fn review_items<R: Rng>(
    scorecard: &Scorecard,
    verdict: Verdict,
    rng: &mut R,
) -> Vec<ReviewItemInput> {
    scorecard
        .questions()
        .map(|question| {
            let answer = answer_for(question, verdict, rng);
            ReviewItemInput {
                scorecard_question_id: question.id.clone(),
                review_item_comments: vec![CommentInput {
                    content: format!(
                        "Harness comment: answered {answer} for question {}",
                        question.id
                    ),
                    kind: "COMMENT".to_string(),
                    sort_order: 1,
                }],
                initial_answer: answer,
            }
        })
        .collect()
}

/// Improve an answer after an accepted appeal: yes/no becomes `YES`, a
/// numeric answer moves up one, capped at the scale maximum.
pub fn bump_answer(question: Option<&ScorecardQuestion>, current: &str) -> String {
    let yes_no = match question {
        Some(q) => q.kind == QuestionKind::YesNo,
        None => current.eq_ignore_ascii_case(YES) || current.eq_ignore_ascii_case(NO),
    };
    if yes_no {
        return YES.to_string();
    }
    match current.trim().parse::<i64>() {
        Ok(value) => {
            let max = question.map(|q| scale_bounds(q).1).unwrap_or(i64::MAX);
            value.saturating_add(1).min(max).to_string()
        }
        Err(_) => current.to_string(),
    }
}
