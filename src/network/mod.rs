//! Network Layer
//!
//! WebSocket server for real-time duel communication. This layer owns
//! connections, rooms, and intent routing; match rules live in `game/`.

pub mod auth;
pub mod matchmaking;
pub mod protocol;
pub mod rooms;
pub mod server;
pub mod session;

pub use auth::{validate_token, verify_identity, AuthConfig, AuthError, TokenClaims};
pub use matchmaking::{Matchmaking, PairOutcome, PairedMatch, PairingError};
pub use protocol::{ClientMessage, ErrorCode, ServerMessage};
pub use rooms::{ConnId, Rooms};
pub use server::{DuelServer, ServerConfig, ServerError};
pub use session::{GameSession, SessionConfig, SessionError};
