//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON text frames; outbound events are tagged with
//! `event` and use the payload names the duel client listens for.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::game::question::{QuestionKind, QuestionView, SubmittedAnswer};
use crate::game::state::ChatEntry;
use crate::services::Profile;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Inbound intents from a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach a caller identity to the connection.
    Identify {
        /// Player username.
        username: String,
        /// Optional bearer token, validated when a secret is configured.
        #[serde(default)]
        token: Option<String>,
    },

    /// Enter the matchmaking queue.
    JoinQueue,

    /// Leave the matchmaking queue.
    LeaveQueue,

    /// Join (or rejoin) a match room.
    JoinMatch {
        /// Target match.
        match_id: String,
    },

    /// Signal ready for the game to start.
    Ready {
        /// Target match.
        match_id: String,
    },

    /// Withdraw a ready signal before the game starts.
    Unready {
        /// Target match.
        match_id: String,
    },

    /// Submit an answer for the current round.
    SubmitAnswer {
        /// Target match.
        match_id: String,
        /// The answer.
        answer: SubmittedAnswer,
    },

    /// Acknowledge readiness for the next round.
    NextQuestion {
        /// Target match.
        match_id: String,
    },

    /// Send a chat message to the match room.
    Chat {
        /// Target match.
        match_id: String,
        /// Message text.
        text: String,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Outbound events to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Identity accepted.
    Identified {
        /// The attached username.
        username: String,
    },

    /// Informational text for the client's log pane.
    SystemLog {
        /// Log line.
        text: String,
    },

    /// Waiting in the matchmaking queue.
    Queued,

    /// Paired into a match.
    Matched {
        /// New match id.
        match_id: String,
        /// The opponent's public profile.
        opponent: Profile,
    },

    /// A player joined the match room.
    PlayerJoined {
        /// Joining player.
        username: String,
    },

    /// Opponent profile, sent on room join.
    OpponentInfo {
        /// The opponent's public profile.
        profile: Profile,
    },

    /// A ready flag changed.
    PlayerReadyState {
        /// Player whose flag changed.
        username: String,
        /// New flag value.
        ready: bool,
    },

    /// Both players ready; the game begins.
    GameStarted,

    /// Seconds left to read the question.
    DisplayTimer {
        /// Whole seconds remaining.
        seconds_left: u64,
    },

    /// A question, with its position in the set.
    Question {
        /// Sanitized question data.
        question: QuestionView,
        /// Zero-based question index.
        index: usize,
        /// Total question count.
        total: usize,
    },

    /// Seconds left to answer.
    AnswerTimer {
        /// Whole seconds remaining.
        seconds_left: u64,
    },

    /// Echo of a recorded submission.
    AnswerSubmitted {
        /// Submitting player.
        username: String,
        /// The recorded answer.
        answer: SubmittedAnswer,
        /// Kind of the current question, for client rendering.
        question_type: QuestionKind,
    },

    /// Round results.
    QuestionResults {
        /// The correct answer text (multiple-choice only).
        correct_answer: Option<String>,
        /// Points earned this round, by player.
        scores: BTreeMap<String, u32>,
        /// Running totals, by player.
        total_scores: BTreeMap<String, u32>,
    },

    /// Final scores; the match is over.
    MatchOver {
        /// Cumulative scores, by player.
        scores: BTreeMap<String, u32>,
    },

    /// A chat message in the match room.
    ChatMessage {
        /// Sending player.
        username: String,
        /// Message text.
        text: String,
    },

    /// Accumulated chat history, sent on room join.
    ChatHistory {
        /// Messages in send order.
        messages: Vec<ChatEntry>,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
    },

    /// Error notice.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Intent arrived before `identify`.
    NotIdentified,
    /// Identity token rejected.
    InvalidToken,
    /// Malformed message.
    InvalidMessage,
    /// Referenced match does not exist (or was cleaned up).
    MatchNotFound,
    /// Intent not valid in the match's current phase.
    InvalidState,
    /// Caller is not a participant of the match.
    NotInMatch,
    /// Pairing failed; the caller should retry.
    PairingFailed,
    /// Unexpected server-side failure.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_json_roundtrip() {
        let msg = ClientMessage::SubmitAnswer {
            match_id: "A1B2C3".to_string(),
            answer: SubmittedAnswer::Choice(2),
        };

        let json = msg.to_json().unwrap();
        let parsed = ClientMessage::from_json(&json).unwrap();

        if let ClientMessage::SubmitAnswer { match_id, answer } = parsed {
            assert_eq!(match_id, "A1B2C3");
            assert_eq!(answer, SubmittedAnswer::Choice(2));
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn text_answer_parses_from_string() {
        let json = r#"{"type":"submit_answer","match_id":"A1B2C3","answer":"the mitochondria"}"#;
        let parsed = ClientMessage::from_json(json).unwrap();
        if let ClientMessage::SubmitAnswer { answer, .. } = parsed {
            assert_eq!(answer, SubmittedAnswer::Text("the mitochondria".to_string()));
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn server_message_json_roundtrip() {
        let mut scores = BTreeMap::new();
        scores.insert("alice".to_string(), 612);
        scores.insert("bob".to_string(), 0);

        let msg = ServerMessage::QuestionResults {
            correct_answer: Some("4".to_string()),
            scores: scores.clone(),
            total_scores: scores,
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("questionResults"));

        let parsed = ServerMessage::from_json(&json).unwrap();
        if let ServerMessage::QuestionResults { total_scores, .. } = parsed {
            assert_eq!(total_scores["alice"], 612);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn event_tags_are_camel_case() {
        let msg = ServerMessage::PlayerReadyState {
            username: "alice".to_string(),
            ready: true,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""event":"playerReadyState""#));
    }

    #[test]
    fn error_codes_serialize_snake_case() {
        let msg = ServerMessage::Error {
            code: ErrorCode::MatchNotFound,
            message: "no such match".to_string(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("match_not_found"));
    }

    #[test]
    fn identify_token_is_optional() {
        let json = r#"{"type":"identify","username":"alice"}"#;
        let parsed = ClientMessage::from_json(json).unwrap();
        if let ClientMessage::Identify { username, token } = parsed {
            assert_eq!(username, "alice");
            assert!(token.is_none());
        } else {
            panic!("Wrong message type");
        }
    }
}
