//! Scoring Engine
//!
//! Pure point computation for one answered question. No state.
//!
//! A correct answer earns a time bonus shaped by a square root so the
//! payoff for answering fast has diminishing returns: answering with
//! only the reduction window left (or less) earns the flat baseline,
//! answering instantly earns the maximum. The bonus is then scaled by
//! the question's marks and, for externally graded questions, by the
//! grader's mark.

use crate::game::question::Question;

/// Normalization ceiling for the time bonus.
pub const MAX_BONUS: f64 = 5000.0;

/// Grading outcome for a submitted answer, as fed to [`score`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Judgement {
    /// Multiple-choice: submitted index matched the correct one (or not).
    Binary(bool),
    /// Free text: numeric mark in `[0, 1]` from the grading service.
    Marked(f64),
}

impl Judgement {
    /// A mark of at least 0.5 counts as correct.
    pub fn is_correct(self) -> bool {
        match self {
            Judgement::Binary(c) => c,
            Judgement::Marked(m) => m >= 0.5,
        }
    }

    /// Factor applied to the final score. Binary outcomes score at full
    /// value; graded outcomes scale with the mark.
    fn scale(self) -> f64 {
        match self {
            Judgement::Binary(_) => 1.0,
            Judgement::Marked(m) => m.clamp(0.0, 1.0),
        }
    }
}

/// Compute the points awarded for an answer.
///
/// `elapsed_ms` is the time between the answer window opening and the
/// submission. Incorrect or unanswered questions score zero.
pub fn score(question: &Question, judgement: Judgement, elapsed_ms: u64) -> u32 {
    if !judgement.is_correct() {
        return 0;
    }

    let max_time = question.time_limit_secs as f64 * 1000.0;
    let reduced_time = question.reduction_time_limit_secs as f64 * 1000.0;
    let time_left = (max_time - elapsed_ms as f64).max(0.0);

    let delta = (time_left.sqrt() - reduced_time.sqrt()).max(0.0);
    let delta_max = max_time.sqrt() - reduced_time.sqrt();
    let norm = if delta_max <= 0.0 { 1.0 } else { delta / delta_max };

    let bonus = (norm * MAX_BONUS).round().max(1.0);
    (bonus.sqrt() * question.max_marks as f64 * judgement.scale()).round() as u32
}
