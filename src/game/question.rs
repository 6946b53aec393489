//! Question Types
//!
//! Externally supplied question data, immutable for a match's duration.
//! Multiple-choice questions mark the correct option either with an
//! explicit index or inline with a `*` in the choice text (legacy
//! question sets use the star markup; the explicit field wins).

use serde::{Deserialize, Serialize};

/// Kind of question, determining how answers are judged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    /// Pick one of the listed choices.
    #[serde(alias = "mcq", alias = "multiple choice")]
    MultipleChoice,
    /// Free text, a sentence or two. Graded externally.
    ShortAnswer,
    /// Free text, extended response. Graded externally.
    LongAnswer,
}

/// A single quiz question.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    /// Question kind.
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    /// Prompt shown to both players.
    pub prompt: String,
    /// Answer choices (multiple-choice only).
    #[serde(default)]
    pub choices: Vec<String>,
    /// Explicit index of the correct choice, if the set provides one.
    #[serde(default)]
    pub correct_choice: Option<usize>,
    /// Maximum marks awarded for a perfect answer.
    pub max_marks: u32,
    /// Answer window in seconds.
    pub time_limit_secs: u64,
    /// Portion of the window (in seconds) inside which no time bonus
    /// accrues. See [`crate::game::score`].
    pub reduction_time_limit_secs: u64,
    /// Grading rubric for free-text questions.
    #[serde(default)]
    pub rubric: Option<String>,
}

impl Question {
    /// Whether this question carries a choice list.
    pub fn has_choices(&self) -> bool {
        self.kind == QuestionKind::MultipleChoice
    }

    /// Resolve the correct choice index for a multiple-choice question.
    ///
    /// The explicit `correct_choice` field takes precedence; otherwise
    /// the first choice containing a `*` is taken as correct.
    pub fn correct_index(&self) -> Option<usize> {
        if !self.has_choices() {
            return None;
        }
        if let Some(idx) = self.correct_choice {
            if idx < self.choices.len() {
                return Some(idx);
            }
        }
        self.choices.iter().position(|c| c.contains('*'))
    }

    /// Human-readable correct answer for the results broadcast.
    ///
    /// `None` for free-text questions, where correctness comes from the
    /// grading service rather than the question data.
    pub fn correct_answer_text(&self) -> Option<String> {
        let idx = self.correct_index()?;
        self.choices.get(idx).map(|c| c.replace('*', "").trim().to_string())
    }

    /// Choice texts with the correctness markup stripped, for clients.
    pub fn display_choices(&self) -> Vec<String> {
        self.choices
            .iter()
            .map(|c| c.replace('*', "").trim().to_string())
            .collect()
    }
}

/// Client-facing view of a question.
///
/// Never carries the correct index, the star markup, or the rubric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionView {
    /// Question kind.
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    /// Prompt text.
    pub prompt: String,
    /// Sanitized choices (empty for free-text questions).
    pub choices: Vec<String>,
    /// Maximum marks on offer.
    pub max_marks: u32,
    /// Answer window in seconds.
    pub time_limit_secs: u64,
}

impl From<&Question> for QuestionView {
    fn from(q: &Question) -> Self {
        Self {
            kind: q.kind,
            prompt: q.prompt.clone(),
            choices: q.display_choices(),
            max_marks: q.max_marks,
            time_limit_secs: q.time_limit_secs,
        }
    }
}

/// An answer as submitted by a player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmittedAnswer {
    /// Choice index for multiple-choice questions.
    Choice(usize),
    /// Free text for short/long answers.
    Text(String),
    /// No answer (recorded on timeout).
    Blank,
}

impl SubmittedAnswer {
    /// Whether this is the blank (timed-out) answer.
    pub fn is_blank(&self) -> bool {
        matches!(self, SubmittedAnswer::Blank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn mcq(correct: usize) -> Question {
        Question {
            kind: QuestionKind::MultipleChoice,
            prompt: "2 + 2 = ?".to_string(),
            choices: vec!["3".into(), "4*".into(), "5".into()],
            correct_choice: Some(correct),
            max_marks: 10,
            time_limit_secs: 15,
            reduction_time_limit_secs: 5,
            rubric: None,
        }
    }

    #[test]
    fn explicit_index_wins_over_markup() {
        // Star marks index 1, but the explicit field says 2.
        let q = mcq(2);
        assert_eq!(q.correct_index(), Some(2));
    }

    #[test]
    fn star_markup_fallback() {
        let mut q = mcq(0);
        q.correct_choice = None;
        assert_eq!(q.correct_index(), Some(1));
        assert_eq!(q.correct_answer_text().as_deref(), Some("4"));
    }

    #[test]
    fn out_of_range_explicit_index_falls_back_to_markup() {
        let mut q = mcq(0);
        q.correct_choice = Some(99);
        assert_eq!(q.correct_index(), Some(1));
    }

    #[test]
    fn free_text_has_no_correct_index() {
        let q = Question {
            kind: QuestionKind::ShortAnswer,
            prompt: "Explain photosynthesis".to_string(),
            choices: vec![],
            correct_choice: None,
            max_marks: 5,
            time_limit_secs: 60,
            reduction_time_limit_secs: 20,
            rubric: Some("Mentions light and chlorophyll".to_string()),
        };
        assert!(!q.has_choices());
        assert_eq!(q.correct_index(), None);
        assert_eq!(q.correct_answer_text(), None);
    }

    #[test]
    fn view_strips_markup_and_secrets() {
        let q = mcq(1);
        let view = QuestionView::from(&q);
        assert_eq!(view.choices, vec!["3", "4", "5"]);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("correct"));
        assert!(!json.contains("rubric"));
    }

    #[test]
    fn legacy_type_aliases_parse() {
        let json = r#"{
            "type": "mcq",
            "prompt": "capital of France?",
            "choices": ["Paris*", "Lyon"],
            "max_marks": 3,
            "time_limit_secs": 10,
            "reduction_time_limit_secs": 4
        }"#;
        let q: Question = serde_json::from_str(json).unwrap();
        assert_eq!(q.kind, QuestionKind::MultipleChoice);
        assert_eq!(q.correct_index(), Some(0));
    }
}
