//! Game Logic Module
//!
//! Match state, questions, scoring and timers. Everything here is
//! independent of the network layer; the session coordinator in
//! `network/` drives these types.
//!
//! ## Module Structure
//!
//! - `question`: question data and correct-choice resolution
//! - `score`: pure point computation for answered questions
//! - `state`: match entity, phases, match store
//! - `timer`: countdown with cancel-safe handles

pub mod question;
pub mod score;
pub mod state;
pub mod timer;

// Re-export key types
pub use question::{Question, QuestionKind, QuestionView, SubmittedAnswer};
pub use score::{score, Judgement};
pub use state::{ChatEntry, Match, MatchError, MatchId, MatchPhase, MatchStore};
pub use timer::TimerHandle;
