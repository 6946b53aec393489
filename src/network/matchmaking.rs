//! Matchmaking Queue
//!
//! Pairs waiting connections into new matches. Admission is a single
//! critical section: one pairing attempt runs at a time system-wide,
//! so two concurrent attempts can never both dequeue the same waiting
//! opponent. Profile and question I/O happen inside the attempt, but
//! are bounded by a timeout so a stalled collaborator releases the
//! section promptly.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::game::state::{Match, MatchId, MatchStore};
use crate::network::rooms::{ConnId, Rooms};
use crate::services::{Profile, ServiceError, Services};

/// Bound on external I/O during one pairing attempt.
pub const PAIRING_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Pairing failures. Surfaced to the requester; no half-formed match
/// is ever admitted to the store.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// A profile lookup failed or timed out.
    #[error("profile lookup failed: {0}")]
    Profile(ServiceError),

    /// The question set could not be loaded.
    #[error("question load failed: {0}")]
    Questions(ServiceError),
}

/// A waiting connection.
#[derive(Clone, Debug)]
struct QueueEntry {
    conn: ConnId,
    username: String,
}

/// Result of one pairing attempt.
#[derive(Debug)]
pub enum PairOutcome {
    /// No opponent available; the requester now waits in the queue.
    Queued,
    /// The dequeued opponent was no longer live; the requester was
    /// put back in the queue rather than silently dropped.
    Requeued,
    /// Paired into a new match.
    Matched(Box<PairedMatch>),
}

/// Data handed back on a successful pairing.
#[derive(Debug)]
pub struct PairedMatch {
    /// The new match's id.
    pub match_id: MatchId,
    /// Profile of the requesting player.
    pub requester: Profile,
    /// Connection and profile of the paired opponent.
    pub opponent_conn: ConnId,
    /// The opponent's profile.
    pub opponent: Profile,
}

/// FIFO queue of waiting connections plus the pairing admission lock.
pub struct Matchmaking {
    queue: Mutex<VecDeque<QueueEntry>>,
    /// Held for the duration of one pairing attempt.
    admission: Mutex<()>,
    io_timeout: Duration,
}

impl Default for Matchmaking {
    fn default() -> Self {
        Self::new()
    }
}

impl Matchmaking {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::with_io_timeout(PAIRING_IO_TIMEOUT)
    }

    /// Create a queue with an explicit I/O bound (tests use short ones).
    pub fn with_io_timeout(io_timeout: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            admission: Mutex::new(()),
            io_timeout,
        }
    }

    /// Remove a connection from the queue (leave-queue or disconnect).
    /// Returns whether it was waiting.
    pub async fn remove(&self, conn: ConnId) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|e| e.conn != conn);
        queue.len() != before
    }

    /// Number of waiting connections.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Attempt to pair `conn` with the head of the queue.
    ///
    /// On success the new match is already in `store`; the caller is
    /// responsible for room joins and notifications. On failure nothing
    /// has been admitted and the requester is not queued.
    pub async fn try_pair(
        &self,
        conn: ConnId,
        username: &str,
        rooms: &Rooms,
        services: &Services,
        store: &MatchStore,
    ) -> Result<PairOutcome, PairingError> {
        let _admission = self.admission.lock().await;

        let opponent = {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|e| e.conn == conn) {
                // Duplicate join-queue from a waiting connection.
                return Ok(PairOutcome::Queued);
            }
            queue.pop_front()
        };

        let opponent = match opponent {
            Some(entry) => entry,
            None => {
                self.enqueue(conn, username).await;
                return Ok(PairOutcome::Queued);
            }
        };

        if !rooms.is_live(opponent.conn).await {
            // Opponent vanished between enqueue and pairing. Discard the
            // stale entry and keep the requester waiting.
            warn!(opponent = %opponent.username, "queued opponent no longer live");
            self.enqueue(conn, username).await;
            return Ok(PairOutcome::Requeued);
        }

        match self.create_match(username, &opponent, services, store).await {
            Ok(paired) => Ok(PairOutcome::Matched(Box::new(paired))),
            Err(e) => {
                // Put the blameless opponent back at the head.
                self.queue.lock().await.push_front(opponent);
                Err(e)
            }
        }
    }

    async fn enqueue(&self, conn: ConnId, username: &str) {
        self.queue.lock().await.push_back(QueueEntry {
            conn,
            username: username.to_string(),
        });
    }

    async fn create_match(
        &self,
        username: &str,
        opponent: &QueueEntry,
        services: &Services,
        store: &MatchStore,
    ) -> Result<PairedMatch, PairingError> {
        let requester_profile = self.fetch_profile(username, services).await?;
        let opponent_profile = self.fetch_profile(&opponent.username, services).await?;

        let questions = timeout(self.io_timeout, services.questions.load_question_set())
            .await
            .map_err(|_| PairingError::Questions(ServiceError::Unavailable("timeout".into())))?
            .map_err(PairingError::Questions)?;

        let match_id = MatchId::allocate();
        let m = Match::new(
            match_id.clone(),
            [username.to_string(), opponent.username.clone()],
            questions,
        );
        store.insert(m).await;

        info!(
            %match_id,
            requester = %username,
            opponent = %opponent.username,
            "paired match"
        );

        Ok(PairedMatch {
            match_id,
            requester: requester_profile,
            opponent_conn: opponent.conn,
            opponent: opponent_profile,
        })
    }

    async fn fetch_profile(
        &self,
        username: &str,
        services: &Services,
    ) -> Result<Profile, PairingError> {
        timeout(self.io_timeout, services.profiles.get_profile(username))
            .await
            .map_err(|_| PairingError::Profile(ServiceError::Unavailable("timeout".into())))?
            .map_err(PairingError::Profile)
    }
}
