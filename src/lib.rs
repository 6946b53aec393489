//! # Quiz Duel Server
//!
//! Real-time coordinator for two-player timed quiz duels.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    QUIZ DUEL SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/            - Match rules and state                    │
//! │  ├── question.rs  - Question data and answer shapes          │
//! │  ├── score.rs     - Time-bonus scoring                       │
//! │  ├── state.rs     - Match state machine and store            │
//! │  └── timer.rs     - Cancelable countdown timers              │
//! │                                                              │
//! │  network/         - Connections and intent routing           │
//! │  ├── server.rs    - WebSocket server and event router        │
//! │  ├── protocol.rs  - Message types                            │
//! │  ├── rooms.rs     - Connection registry and match rooms      │
//! │  ├── matchmaking.rs - FIFO pairing queue                     │
//! │  ├── session.rs   - Game session coordinator                 │
//! │  └── auth.rs      - JWT identity verification                │
//! │                                                              │
//! │  services/        - External collaborators                   │
//! │  ├── mod.rs       - Profile store and question supply        │
//! │  └── grading.rs   - Free-text grading service                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Every match lives behind its own async lock in the [`game::MatchStore`];
//! pairing admissions are serialized through a single queue-wide lock so
//! two simultaneous joiners cannot both dequeue the same opponent. Round
//! closing is latched: whichever of "everyone answered" and "answer timer
//! expired" arrives second finds the match already in the results phase
//! and backs off.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;
pub mod services;

pub use game::{Match, MatchId, MatchPhase, MatchStore, Question, SubmittedAnswer};
pub use network::{DuelServer, ServerConfig};
pub use services::Services;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
