//! Match State
//!
//! The central `Match` entity and the in-memory store of active
//! matches. The store itself carries no concurrency policy beyond the
//! per-entry lock; all phase rules are enforced by `Match` methods and
//! driven by the session coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::game::question::{Question, SubmittedAnswer};
use crate::game::timer::TimerHandle;

/// Opaque match identifier: a 6-char uppercase hex room code.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchId(String);

impl MatchId {
    /// Allocate a fresh id from UUID entropy.
    pub fn allocate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode_upper(&uuid.as_bytes()[..3]))
    }

    /// Wrap an existing code (client-supplied ids on inbound intents).
    pub fn from_code(code: &str) -> Self {
        Self(code.to_uppercase())
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle phase of a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Players pairing up / joining the room.
    Waiting,
    /// At least one player has readied; game not yet started.
    Ready,
    /// Question on display, answers not yet open.
    Question,
    /// Answer window open.
    Answer,
    /// Round closed, per-round scores broadcast, waiting on next-gate.
    Results,
    /// Final round complete.
    Ended,
}

/// One recorded answer for the current round.
#[derive(Clone, Debug)]
pub struct RecordedAnswer {
    /// The raw submission.
    pub answer: SubmittedAnswer,
    /// When it arrived.
    pub submitted_at: Instant,
}

/// One chat message within a match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatEntry {
    /// Sending player.
    pub username: String,
    /// Message text.
    pub text: String,
    /// Wall-clock send time.
    pub sent_at: DateTime<Utc>,
}

/// Errors from match state operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MatchError {
    /// Player is not a participant of this match.
    #[error("unknown player {0}")]
    UnknownPlayer(String),

    /// Operation not valid in the current phase.
    #[error("invalid in {0:?} phase")]
    InvalidPhase(MatchPhase),
}

/// One active two-player duel.
pub struct Match {
    /// Match identifier.
    pub id: MatchId,
    /// The two participants, in pairing order.
    players: [String; 2],
    /// Question sequence, fixed at creation.
    questions: Vec<Question>,
    /// Index of the current question.
    current: usize,
    /// Lifecycle phase.
    phase: MatchPhase,
    /// Pre-game ready flags.
    ready: BTreeMap<String, bool>,
    /// Per-round "next question" acknowledgments.
    next_ready: BTreeMap<String, bool>,
    /// Answers for the current round. At most one entry per player.
    answers: BTreeMap<String, RecordedAnswer>,
    /// Cumulative scores. Monotonically non-decreasing.
    scores: BTreeMap<String, u32>,
    /// When the current question went on display.
    displayed_at: Option<Instant>,
    /// When the answer window opened.
    answers_open_at: Option<Instant>,
    /// First submission this round, if any.
    first_answer_at: Option<Instant>,
    /// Append-only chat log, discarded at cleanup.
    chat_log: Vec<ChatEntry>,
    /// The one live countdown for this match.
    timer: Option<TimerHandle>,
}

impl Match {
    /// Create a match in the `Waiting` phase.
    pub fn new(id: MatchId, players: [String; 2], questions: Vec<Question>) -> Self {
        let ready = players.iter().map(|p| (p.clone(), false)).collect();
        let scores = players.iter().map(|p| (p.clone(), 0)).collect();
        Self {
            id,
            players,
            questions,
            current: 0,
            phase: MatchPhase::Waiting,
            ready,
            next_ready: BTreeMap::new(),
            answers: BTreeMap::new(),
            scores,
            displayed_at: None,
            answers_open_at: None,
            first_answer_at: None,
            chat_log: Vec::new(),
            timer: None,
        }
    }

    /// Participant usernames.
    pub fn players(&self) -> &[String; 2] {
        &self.players
    }

    /// Whether `username` is a participant.
    pub fn has_player(&self, username: &str) -> bool {
        self.players.iter().any(|p| p == username)
    }

    /// The other participant's username.
    pub fn opponent_of(&self, username: &str) -> Option<&str> {
        self.players
            .iter()
            .find(|p| *p != username)
            .map(String::as_str)
    }

    /// Current phase.
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Index of the current question.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Total question count.
    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// The question for the current round, if any remain.
    pub fn current_question(&self) -> Option<&Question> {
        self.questions.get(self.current)
    }

    /// Set a player's pre-game ready flag. Only meaningful before the
    /// game starts; once play has begun this is rejected.
    pub fn set_ready(&mut self, username: &str, ready: bool) -> Result<(), MatchError> {
        if !matches!(self.phase, MatchPhase::Waiting | MatchPhase::Ready) {
            return Err(MatchError::InvalidPhase(self.phase));
        }
        let flag = self
            .ready
            .get_mut(username)
            .ok_or_else(|| MatchError::UnknownPlayer(username.to_string()))?;
        *flag = ready;
        self.phase = if self.ready.values().any(|r| *r) {
            MatchPhase::Ready
        } else {
            MatchPhase::Waiting
        };
        Ok(())
    }

    /// Whether both players have readied up.
    pub fn all_ready(&self) -> bool {
        self.ready.values().all(|r| *r)
    }

    /// Begin the current round: clear per-round state and put the
    /// question on display. Returns the question, or `None` when the
    /// sequence is exhausted or a round is already live. Only the
    /// ready gate and a completed results phase can open a round, so
    /// racing duplicate triggers cannot restart one.
    pub fn begin_question(&mut self) -> Option<&Question> {
        if !matches!(self.phase, MatchPhase::Ready | MatchPhase::Results) {
            return None;
        }
        if self.current >= self.questions.len() {
            return None;
        }
        self.answers.clear();
        self.next_ready.clear();
        self.first_answer_at = None;
        self.answers_open_at = None;
        self.displayed_at = Some(Instant::now());
        self.phase = MatchPhase::Question;
        self.questions.get(self.current)
    }

    /// Open the answer window once the display timer has elapsed.
    pub fn open_answer_window(&mut self) -> Result<(), MatchError> {
        if self.phase != MatchPhase::Question {
            return Err(MatchError::InvalidPhase(self.phase));
        }
        self.phase = MatchPhase::Answer;
        self.answers_open_at = Some(Instant::now());
        Ok(())
    }

    /// Record a player's answer for the current round.
    ///
    /// Returns `Ok(true)` when the answer was recorded, `Ok(false)` for
    /// a duplicate submission (a no-op, not an error). Submissions
    /// outside the answer window are rejected.
    pub fn record_answer(
        &mut self,
        username: &str,
        answer: SubmittedAnswer,
    ) -> Result<bool, MatchError> {
        if self.phase != MatchPhase::Answer {
            return Err(MatchError::InvalidPhase(self.phase));
        }
        if !self.has_player(username) {
            return Err(MatchError::UnknownPlayer(username.to_string()));
        }
        if self.answers.contains_key(username) {
            return Ok(false);
        }
        let now = Instant::now();
        self.first_answer_at.get_or_insert(now);
        self.answers.insert(
            username.to_string(),
            RecordedAnswer {
                answer,
                submitted_at: now,
            },
        );
        Ok(true)
    }

    /// Record `Blank` for every player without an answer this round.
    pub fn fill_blank_answers(&mut self) {
        let now = Instant::now();
        for player in &self.players {
            self.answers
                .entry(player.clone())
                .or_insert_with(|| RecordedAnswer {
                    answer: SubmittedAnswer::Blank,
                    submitted_at: now,
                });
        }
    }

    /// Whether every player has an answer recorded.
    pub fn all_answered(&self) -> bool {
        self.players.iter().all(|p| self.answers.contains_key(p))
    }

    /// Latch the round closed: moves `Answer -> Results` and reports
    /// whether this call won the latch. Both round-close triggers (all
    /// answered, timer expiry) race through here; only one proceeds.
    pub fn latch_results(&mut self) -> bool {
        if self.phase == MatchPhase::Answer {
            self.phase = MatchPhase::Results;
            true
        } else {
            false
        }
    }

    /// Snapshot of this round's answers.
    pub fn answers(&self) -> &BTreeMap<String, RecordedAnswer> {
        &self.answers
    }

    /// When the current question went on display, if a round is live.
    pub fn displayed_at(&self) -> Option<Instant> {
        self.displayed_at
    }

    /// When the first answer of the round arrived, if any.
    pub fn first_answer_at(&self) -> Option<Instant> {
        self.first_answer_at
    }

    /// Milliseconds from the answer window opening to `at`.
    pub fn elapsed_ms(&self, at: Instant) -> u64 {
        self.answers_open_at
            .map(|open| at.saturating_duration_since(open).as_millis() as u64)
            .unwrap_or(0)
    }

    /// Add round points to a player's cumulative score.
    pub fn add_score(&mut self, username: &str, points: u32) {
        if let Some(total) = self.scores.get_mut(username) {
            *total += points;
        }
    }

    /// Cumulative scores by player.
    pub fn scores(&self) -> &BTreeMap<String, u32> {
        &self.scores
    }

    /// Acknowledge readiness for the next round. Returns whether both
    /// players have now acknowledged.
    pub fn mark_next_ready(&mut self, username: &str) -> Result<bool, MatchError> {
        if self.phase != MatchPhase::Results {
            return Err(MatchError::InvalidPhase(self.phase));
        }
        if !self.has_player(username) {
            return Err(MatchError::UnknownPlayer(username.to_string()));
        }
        self.next_ready.insert(username.to_string(), true);
        Ok(self
            .players
            .iter()
            .all(|p| self.next_ready.get(p) == Some(&true)))
    }

    /// Advance to the next question. Returns `false` when the sequence
    /// is exhausted. Clears the next-round acknowledgments, so a
    /// duplicated ack arriving after the gate completed cannot
    /// complete it a second time.
    pub fn advance(&mut self) -> bool {
        self.next_ready.clear();
        self.current += 1;
        self.current < self.questions.len()
    }

    /// Mark the match ended and release its timer.
    pub fn end(&mut self) {
        self.phase = MatchPhase::Ended;
        self.clear_timer();
    }

    /// Append a chat message.
    pub fn push_chat(&mut self, username: &str, text: String) {
        self.chat_log.push(ChatEntry {
            username: username.to_string(),
            text,
            sent_at: Utc::now(),
        });
    }

    /// The accumulated chat log.
    pub fn chat_log(&self) -> &[ChatEntry] {
        &self.chat_log
    }

    /// Arm the match's countdown, canceling any prior one.
    pub fn arm_timer(&mut self, handle: TimerHandle) {
        if let Some(old) = self.timer.replace(handle) {
            old.cancel();
        }
    }

    /// Cancel and drop the live countdown, if any.
    pub fn clear_timer(&mut self) {
        if let Some(old) = self.timer.take() {
            old.cancel();
        }
    }
}

/// In-memory table of active matches.
///
/// The outer lock guards the table; the per-entry `Mutex` is the
/// per-match critical section that serializes answer recording, phase
/// transitions and score updates.
#[derive(Default)]
pub struct MatchStore {
    matches: RwLock<BTreeMap<MatchId, Arc<Mutex<Match>>>>,
}

impl MatchStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly paired match.
    pub async fn insert(&self, m: Match) -> Arc<Mutex<Match>> {
        let id = m.id.clone();
        let entry = Arc::new(Mutex::new(m));
        self.matches.write().await.insert(id, entry.clone());
        entry
    }

    /// Look up a match by id.
    pub async fn get(&self, id: &MatchId) -> Option<Arc<Mutex<Match>>> {
        self.matches.read().await.get(id).cloned()
    }

    /// Remove a match. Idempotent; returns the entry if it was present.
    pub async fn remove(&self, id: &MatchId) -> Option<Arc<Mutex<Match>>> {
        self.matches.write().await.remove(id)
    }

    /// Number of active matches.
    pub async fn len(&self) -> usize {
        self.matches.read().await.len()
    }

    /// Whether the store holds no matches.
    pub async fn is_empty(&self) -> bool {
        self.matches.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::question::QuestionKind;

    fn sample_question() -> Question {
        Question {
            kind: QuestionKind::MultipleChoice,
            prompt: "q".to_string(),
            choices: vec!["a*".into(), "b".into()],
            correct_choice: None,
            max_marks: 10,
            time_limit_secs: 15,
            reduction_time_limit_secs: 5,
            rubric: None,
        }
    }

    fn sample_match(questions: usize) -> Match {
        Match::new(
            MatchId::from_code("ABC123"),
            ["alice".to_string(), "bob".to_string()],
            (0..questions).map(|_| sample_question()).collect(),
        )
    }

    fn to_answer_phase(m: &mut Match) {
        m.set_ready("alice", true).unwrap();
        m.set_ready("bob", true).unwrap();
        m.begin_question().unwrap();
        m.open_answer_window().unwrap();
    }

    #[test]
    fn allocate_produces_six_hex_chars() {
        let id = MatchId::allocate();
        assert_eq!(id.as_str().len(), 6);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ready_gate_tracks_both_players() {
        let mut m = sample_match(1);
        assert_eq!(m.phase(), MatchPhase::Waiting);

        m.set_ready("alice", true).unwrap();
        assert_eq!(m.phase(), MatchPhase::Ready);
        assert!(!m.all_ready());

        m.set_ready("bob", true).unwrap();
        assert!(m.all_ready());
    }

    #[test]
    fn unready_reverts_before_start_only() {
        let mut m = sample_match(1);
        m.set_ready("alice", true).unwrap();
        m.set_ready("alice", false).unwrap();
        assert_eq!(m.phase(), MatchPhase::Waiting);

        m.set_ready("alice", true).unwrap();
        m.set_ready("bob", true).unwrap();
        m.begin_question().unwrap();
        let err = m.set_ready("alice", false).unwrap_err();
        assert!(matches!(err, MatchError::InvalidPhase(MatchPhase::Question)));
    }

    #[test]
    fn answers_rejected_during_display() {
        let mut m = sample_match(1);
        m.set_ready("alice", true).unwrap();
        m.set_ready("bob", true).unwrap();
        m.begin_question().unwrap();

        let err = m
            .record_answer("alice", SubmittedAnswer::Choice(0))
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidPhase(MatchPhase::Question)));
    }

    #[test]
    fn duplicate_answer_is_noop() {
        let mut m = sample_match(1);
        to_answer_phase(&mut m);

        assert!(m.record_answer("alice", SubmittedAnswer::Choice(0)).unwrap());
        assert!(!m.record_answer("alice", SubmittedAnswer::Choice(1)).unwrap());
        assert_eq!(
            m.answers().get("alice").unwrap().answer,
            SubmittedAnswer::Choice(0)
        );
    }

    #[test]
    fn round_close_latch_wins_once() {
        let mut m = sample_match(1);
        to_answer_phase(&mut m);

        assert!(m.latch_results());
        assert!(!m.latch_results());
        assert_eq!(m.phase(), MatchPhase::Results);
    }

    #[test]
    fn blank_fill_covers_non_answerers() {
        let mut m = sample_match(1);
        to_answer_phase(&mut m);
        m.record_answer("alice", SubmittedAnswer::Choice(0)).unwrap();
        assert!(!m.all_answered());

        m.fill_blank_answers();
        assert!(m.all_answered());
        assert!(m.answers().get("bob").unwrap().answer.is_blank());
        // Existing answers are untouched.
        assert_eq!(
            m.answers().get("alice").unwrap().answer,
            SubmittedAnswer::Choice(0)
        );
    }

    #[test]
    fn scores_accumulate_monotonically() {
        let mut m = sample_match(2);
        m.add_score("alice", 612);
        m.add_score("alice", 0);
        m.add_score("bob", 11);
        m.add_score("bob", 700);
        assert_eq!(m.scores()["alice"], 612);
        assert_eq!(m.scores()["bob"], 711);
    }

    #[test]
    fn next_gate_requires_both_players() {
        let mut m = sample_match(2);
        to_answer_phase(&mut m);
        m.latch_results();

        assert!(!m.mark_next_ready("alice").unwrap());
        // Re-acking is harmless.
        assert!(!m.mark_next_ready("alice").unwrap());
        assert!(m.mark_next_ready("bob").unwrap());
    }

    #[test]
    fn advance_exhausts_question_sequence() {
        let mut m = sample_match(2);
        to_answer_phase(&mut m);
        m.latch_results();
        assert!(m.advance());

        m.begin_question().unwrap();
        m.open_answer_window().unwrap();
        m.latch_results();
        assert!(!m.advance());
        assert!(m.begin_question().is_none());
    }

    #[test]
    fn completed_next_gate_cannot_fire_twice() {
        let mut m = sample_match(3);
        to_answer_phase(&mut m);
        m.latch_results();

        assert!(!m.mark_next_ready("alice").unwrap());
        assert!(m.mark_next_ready("bob").unwrap());
        assert!(m.advance());

        // A duplicated ack landing before the next round opens must
        // not complete the gate again and skip a question.
        assert!(!m.mark_next_ready("alice").unwrap());
        assert_eq!(m.current_index(), 1);
    }

    #[test]
    fn round_cannot_begin_twice() {
        let mut m = sample_match(2);
        m.set_ready("alice", true).unwrap();
        m.set_ready("bob", true).unwrap();

        assert!(m.begin_question().is_some());
        // A racing duplicate trigger finds the round already live.
        assert!(m.begin_question().is_none());
        assert_eq!(m.phase(), MatchPhase::Question);
        assert_eq!(m.current_index(), 0);
    }

    #[test]
    fn begin_question_resets_round_state() {
        let mut m = sample_match(2);
        to_answer_phase(&mut m);
        m.record_answer("alice", SubmittedAnswer::Choice(0)).unwrap();
        m.latch_results();
        m.mark_next_ready("alice").unwrap();
        m.advance();

        m.begin_question().unwrap();
        assert!(m.answers().is_empty());
        assert_eq!(m.phase(), MatchPhase::Question);
        assert_eq!(m.current_index(), 1);
    }

    #[test]
    fn chat_log_appends_in_order() {
        let mut m = sample_match(1);
        m.push_chat("alice", "glhf".to_string());
        m.push_chat("bob", "you too".to_string());
        assert_eq!(m.chat_log().len(), 2);
        assert_eq!(m.chat_log()[0].username, "alice");
        assert_eq!(m.chat_log()[1].text, "you too");
    }

    #[tokio::test]
    async fn store_insert_get_remove() {
        let store = MatchStore::new();
        let id = MatchId::from_code("AB12CD");
        store
            .insert(Match::new(
                id.clone(),
                ["alice".to_string(), "bob".to_string()],
                vec![sample_question()],
            ))
            .await;

        assert_eq!(store.len().await, 1);
        assert!(store.get(&id).await.is_some());

        assert!(store.remove(&id).await.is_some());
        // Redundant removal is a no-op.
        assert!(store.remove(&id).await.is_none());
        assert!(store.is_empty().await);
    }
}
