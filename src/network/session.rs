//! Game Session Coordinator
//!
//! The state machine for one match's lifecycle: ready-up, question
//! delivery, answer collection, scoring, round advance and match end,
//! plus the debounced room-emptiness cleanup.
//!
//! All match mutation happens inside the per-match lock from the
//! [`MatchStore`]; timer callbacks re-enter through the same public
//! methods, so every transition funnels through a single dispatch
//! point per match. The grading call is the one piece of external I/O
//! here and runs *outside* the lock: the round is latched into the
//! results phase first, graded, then scores are applied.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::game::question::{Question, QuestionKind, QuestionView, SubmittedAnswer};
use crate::game::score::{score, Judgement};
use crate::game::state::{Match, MatchError, MatchId, MatchPhase, MatchStore};
use crate::game::timer;
use crate::network::protocol::ServerMessage;
use crate::network::rooms::{ConnId, Rooms};
use crate::services::Services;

/// Tuning for the coordinator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a question is displayed before answers open.
    pub display_duration: Duration,
    /// Grace period before an empty match room is reclaimed.
    pub cleanup_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_duration: Duration::from_secs(4),
            cleanup_grace: Duration::from_secs(10),
        }
    }
}

/// Coordinator errors, mapped to client error notices by the router.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The referenced match does not exist (stale client).
    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    /// The intent is not valid right now.
    #[error(transparent)]
    Match(#[from] MatchError),
}

/// Drives every active match. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct GameSession {
    store: Arc<MatchStore>,
    rooms: Arc<Rooms>,
    services: Services,
    config: SessionConfig,
    /// Pending debounced cleanup checks, one per match at most.
    cleanup_timers: Arc<Mutex<BTreeMap<MatchId, timer::TimerHandle>>>,
}

impl GameSession {
    /// Wire up a coordinator.
    pub fn new(
        store: Arc<MatchStore>,
        rooms: Arc<Rooms>,
        services: Services,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            rooms,
            services,
            config,
            cleanup_timers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// The match store backing this coordinator.
    pub fn store(&self) -> &Arc<MatchStore> {
        &self.store
    }

    async fn entry(&self, match_id: &MatchId) -> Result<Arc<Mutex<Match>>, SessionError> {
        self.store
            .get(match_id)
            .await
            .ok_or_else(|| SessionError::MatchNotFound(match_id.clone()))
    }

    // =========================================================================
    // ROOM JOIN / CHAT
    // =========================================================================

    /// Associate a connection with a match room: replay chat history,
    /// exchange opponent profiles, and cancel any pending cleanup.
    pub async fn join_room(
        &self,
        conn: ConnId,
        match_id: &MatchId,
        username: &str,
    ) -> Result<(), SessionError> {
        let entry = self.entry(match_id).await?;

        let (history, opponent) = {
            let m = entry.lock().await;
            if !m.has_player(username) {
                return Err(MatchError::UnknownPlayer(username.to_string()).into());
            }
            (
                m.chat_log().to_vec(),
                m.opponent_of(username).map(str::to_string),
            )
        };

        self.rooms.join(conn, match_id.clone()).await;
        self.cancel_room_check(match_id).await;

        if !history.is_empty() {
            self.rooms
                .unicast(conn, ServerMessage::ChatHistory { messages: history })
                .await;
        }

        // Both sides learn about each other: the joiner gets the
        // opponent's profile, the room gets the joiner's.
        if let Some(opponent) = opponent {
            match self.services.profiles.get_profile(&opponent).await {
                Ok(profile) => {
                    self.rooms
                        .unicast(conn, ServerMessage::OpponentInfo { profile })
                        .await;
                }
                Err(e) => warn!(%match_id, player = %opponent, "profile lookup failed: {e}"),
            }
            match self.services.profiles.get_profile(username).await {
                Ok(profile) => {
                    self.rooms
                        .broadcast(match_id, ServerMessage::OpponentInfo { profile })
                        .await;
                }
                Err(e) => warn!(%match_id, player = %username, "profile lookup failed: {e}"),
            }
        }

        self.rooms
            .broadcast(
                match_id,
                ServerMessage::PlayerJoined {
                    username: username.to_string(),
                },
            )
            .await;

        Ok(())
    }

    /// Append and broadcast a chat message.
    pub async fn handle_chat(
        &self,
        match_id: &MatchId,
        username: &str,
        text: String,
    ) -> Result<(), SessionError> {
        let entry = self.entry(match_id).await?;
        {
            let mut m = entry.lock().await;
            if !m.has_player(username) {
                return Err(MatchError::UnknownPlayer(username.to_string()).into());
            }
            m.push_chat(username, text.clone());
        }
        self.rooms
            .broadcast(
                match_id,
                ServerMessage::ChatMessage {
                    username: username.to_string(),
                    text,
                },
            )
            .await;
        Ok(())
    }

    // =========================================================================
    // READY GATE
    // =========================================================================

    /// A player signaled ready. Starts the game once both have.
    pub async fn handle_ready(
        &self,
        match_id: &MatchId,
        username: &str,
    ) -> Result<(), SessionError> {
        let entry = self.entry(match_id).await?;
        let all_ready = {
            let mut m = entry.lock().await;
            let was_ready = m.all_ready();
            m.set_ready(username, true)?;
            // Only the call that completes the gate starts the game.
            !was_ready && m.all_ready()
        };

        self.rooms
            .broadcast(
                match_id,
                ServerMessage::SystemLog {
                    text: format!("{username} is ready!"),
                },
            )
            .await;
        self.rooms
            .broadcast(
                match_id,
                ServerMessage::PlayerReadyState {
                    username: username.to_string(),
                    ready: true,
                },
            )
            .await;

        if all_ready {
            info!(%match_id, "both players ready, starting game");
            self.rooms
                .broadcast(match_id, ServerMessage::GameStarted)
                .await;
            self.start_question(match_id.clone()).await;
        }
        Ok(())
    }

    /// A player withdrew their ready signal. Only possible before the
    /// game starts; afterwards the intent is rejected.
    pub async fn handle_unready(
        &self,
        match_id: &MatchId,
        username: &str,
    ) -> Result<(), SessionError> {
        let entry = self.entry(match_id).await?;
        {
            let mut m = entry.lock().await;
            m.set_ready(username, false)?;
        }

        self.rooms
            .broadcast(
                match_id,
                ServerMessage::SystemLog {
                    text: format!("{username} is no longer ready!"),
                },
            )
            .await;
        self.rooms
            .broadcast(
                match_id,
                ServerMessage::PlayerReadyState {
                    username: username.to_string(),
                    ready: false,
                },
            )
            .await;
        Ok(())
    }

    // =========================================================================
    // ROUND LIFECYCLE
    // =========================================================================

    /// Begin the current round: broadcast the question and arm the
    /// display timer. Falls through to match end when the question
    /// sequence is exhausted.
    async fn start_question(&self, match_id: MatchId) {
        let entry = match self.store.get(&match_id).await {
            Some(e) => e,
            None => return,
        };

        let broadcast = {
            let mut m = entry.lock().await;
            if !matches!(m.phase(), MatchPhase::Ready | MatchPhase::Results) {
                // A racing duplicate trigger; the round is already live.
                return;
            }
            let view = m.begin_question().map(QuestionView::from);
            match view {
                Some(view) => {
                    let msg = ServerMessage::Question {
                        question: view,
                        index: m.current_index(),
                        total: m.question_count(),
                    };

                    let session = self.clone();
                    let tick_session = self.clone();
                    let tick_id = match_id.clone();
                    let expire_id = match_id.clone();
                    m.arm_timer(timer::schedule(
                        self.config.display_duration,
                        move |seconds_left| {
                            let session = tick_session.clone();
                            let match_id = tick_id.clone();
                            async move {
                                session
                                    .rooms
                                    .broadcast(&match_id, ServerMessage::DisplayTimer { seconds_left })
                                    .await;
                            }
                        },
                        move || async move { session.open_answer_window(expire_id).await },
                    ));
                    Some(msg)
                }
                None => None,
            }
        };

        match broadcast {
            Some(msg) => self.rooms.broadcast(&match_id, msg).await,
            None => self.end_match(&match_id).await,
        }
    }

    /// Display timer elapsed: open the answer window and arm the
    /// answer timer from the question's time limit.
    async fn open_answer_window(&self, match_id: MatchId) {
        let entry = match self.store.get(&match_id).await {
            Some(e) => e,
            None => return,
        };

        {
            let mut m = entry.lock().await;
            if let Err(e) = m.open_answer_window() {
                debug!(%match_id, "answer window not opened: {e}");
                return;
            }
            let limit = m
                .current_question()
                .map(|q| Duration::from_secs(q.time_limit_secs))
                .unwrap_or_default();

            let session = self.clone();
            let tick_session = self.clone();
            let tick_id = match_id.clone();
            let expire_id = match_id.clone();
            m.arm_timer(timer::schedule(
                limit,
                move |seconds_left| {
                    let session = tick_session.clone();
                    let match_id = tick_id.clone();
                    async move {
                        session
                            .rooms
                            .broadcast(&match_id, ServerMessage::AnswerTimer { seconds_left })
                            .await;
                    }
                },
                move || async move { session.close_round(expire_id, true).await },
            ));
        }
    }

    /// Record a player's answer. Duplicates are a silent no-op; the
    /// round closes early when both players have answered.
    pub async fn handle_answer(
        &self,
        match_id: &MatchId,
        username: &str,
        answer: SubmittedAnswer,
    ) -> Result<(), SessionError> {
        let entry = self.entry(match_id).await?;

        let (recorded, question_type, all_answered) = {
            let mut m = entry.lock().await;
            let recorded = m.record_answer(username, answer.clone())?;
            let kind = m.current_question().map(|q| q.kind);
            (recorded, kind, m.all_answered())
        };

        if !recorded {
            debug!(%match_id, player = %username, "duplicate answer ignored");
            return Ok(());
        }

        if let Some(question_type) = question_type {
            self.rooms
                .broadcast(
                    match_id,
                    ServerMessage::AnswerSubmitted {
                        username: username.to_string(),
                        answer,
                        question_type,
                    },
                )
                .await;
        }

        if all_answered {
            self.close_round(match_id.clone(), false).await;
        }
        Ok(())
    }

    /// Close the round: latch the results phase, grade, apply scores,
    /// broadcast results. Both triggers (everyone answered, answer
    /// timer expiry) funnel here; the latch lets only one through.
    async fn close_round(&self, match_id: MatchId, timed_out: bool) {
        let entry = match self.store.get(&match_id).await {
            Some(e) => e,
            None => return,
        };

        // Latch and snapshot under the match lock; grading runs outside it.
        let (question, graded_input) = {
            let mut m = entry.lock().await;
            if !m.latch_results() {
                return;
            }
            m.clear_timer();
            if timed_out {
                m.fill_blank_answers();
            }
            let question = match m.current_question() {
                Some(q) => q.clone(),
                None => return,
            };
            let snapshot: Vec<(String, SubmittedAnswer, u64)> = m
                .answers()
                .iter()
                .map(|(player, rec)| {
                    (player.clone(), rec.answer.clone(), m.elapsed_ms(rec.submitted_at))
                })
                .collect();
            (question, snapshot)
        };

        if timed_out {
            self.rooms
                .broadcast(
                    &match_id,
                    ServerMessage::SystemLog {
                        text: "Time up!".to_string(),
                    },
                )
                .await;
        }

        let mut round_scores: BTreeMap<String, u32> = BTreeMap::new();
        for (player, answer, elapsed_ms) in graded_input {
            let judgement = self.judge(&question, &answer).await;
            round_scores.insert(player, score(&question, judgement, elapsed_ms));
        }

        let total_scores = {
            let mut m = entry.lock().await;
            for (player, points) in &round_scores {
                m.add_score(player, *points);
            }
            m.scores().clone()
        };

        self.rooms
            .broadcast(
                &match_id,
                ServerMessage::QuestionResults {
                    correct_answer: question.correct_answer_text(),
                    scores: round_scores,
                    total_scores,
                },
            )
            .await;
    }

    /// Judge one answer against the question. Free-text answers go to
    /// the grading service; any grading failure degrades to incorrect.
    async fn judge(&self, question: &Question, answer: &SubmittedAnswer) -> Judgement {
        match (question.kind, answer) {
            (QuestionKind::MultipleChoice, SubmittedAnswer::Choice(idx)) => {
                Judgement::Binary(question.correct_index() == Some(*idx))
            }
            (QuestionKind::ShortAnswer | QuestionKind::LongAnswer, SubmittedAnswer::Text(text)) => {
                let rubric = question.rubric.as_deref().unwrap_or("");
                match self
                    .services
                    .grader
                    .grade(text, rubric, &question.prompt)
                    .await
                {
                    Ok(result) => Judgement::Marked(result.mark),
                    Err(e) => {
                        warn!("grading failed, counting as incorrect: {e}");
                        Judgement::Marked(0.0)
                    }
                }
            }
            // Blank or mismatched answer shape.
            _ => Judgement::Binary(false),
        }
    }

    /// A player acknowledged the next round. Advances (or ends the
    /// match) once both have.
    pub async fn handle_next(
        &self,
        match_id: &MatchId,
        username: &str,
    ) -> Result<(), SessionError> {
        let entry = self.entry(match_id).await?;
        let step = {
            let mut m = entry.lock().await;
            if !m.mark_next_ready(username)? {
                return Ok(());
            }
            m.advance()
        };

        if step {
            self.start_question(match_id.clone()).await;
        } else {
            self.end_match(match_id).await;
        }
        Ok(())
    }

    /// Broadcast final scores, release timers, and schedule the store
    /// cleanup (the match lingers until its room drains).
    async fn end_match(&self, match_id: &MatchId) {
        let entry = match self.store.get(match_id).await {
            Some(e) => e,
            None => return,
        };

        let scores = {
            let mut m = entry.lock().await;
            m.end();
            m.scores().clone()
        };

        info!(%match_id, ?scores, "match over");
        self.rooms
            .broadcast(match_id, ServerMessage::MatchOver { scores })
            .await;

        self.schedule_room_check(match_id.clone()).await;
    }

    // =========================================================================
    // DEBOUNCED CLEANUP
    // =========================================================================

    /// Schedule a room-emptiness check after the grace period. At most
    /// one pending check exists per match; scheduling while one is
    /// pending is a no-op.
    pub async fn schedule_room_check(&self, match_id: MatchId) {
        let mut timers = self.cleanup_timers.lock().await;
        if timers.contains_key(&match_id) {
            return;
        }
        debug!(%match_id, "scheduling room-emptiness check");

        let session = self.clone();
        let id = match_id.clone();
        // Boxed so the check can re-arm itself without the expiry
        // future's type becoming self-referential.
        let handle = timer::schedule(
            self.config.cleanup_grace,
            |_| async {},
            move || -> BoxFuture<'static, ()> {
                Box::pin(async move { session.run_room_check(id).await })
            },
        );
        timers.insert(match_id, handle);
    }

    /// Cancel a pending room check (a player came back).
    pub async fn cancel_room_check(&self, match_id: &MatchId) {
        if let Some(handle) = self.cleanup_timers.lock().await.remove(match_id) {
            debug!(%match_id, "room repopulated, canceling cleanup");
            handle.cancel();
        }
    }

    /// Grace period elapsed: destroy the match if its room is still
    /// empty, re-arm for an ended-but-occupied room, otherwise drop
    /// the pending check. Idempotent for already-removed matches.
    // Written as a manually-boxed future (rather than `async fn`) because
    // it recursively awaits `schedule_room_check`, which boxes this future;
    // the indirection lets the compiler resolve the `Send` bound.
    fn run_room_check(&self, match_id: MatchId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
        self.cleanup_timers.lock().await.remove(&match_id);

        let entry = match self.store.get(&match_id).await {
            Some(e) => e,
            None => return,
        };

        if self.rooms.room_size(&match_id).await == 0 {
            info!(%match_id, "room still empty after grace period, destroying match");
            if let Some(entry) = self.store.remove(&match_id).await {
                entry.lock().await.clear_timer();
            }
            self.rooms.drop_room(&match_id).await;
            return;
        }

        // Occupied. An ended match still needs eventual reclamation.
        let ended = entry.lock().await.phase() == MatchPhase::Ended;
        if ended {
            self.schedule_room_check(match_id).await;
        }
        })
    }
}
