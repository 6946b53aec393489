//! External Collaborators
//!
//! The quiz duel coordinator treats credential/profile storage, question
//! supply and grading as external services reached through narrow
//! interfaces. Traits here use boxed futures so the server can hold
//! them behind `Arc<dyn ...>` without pinning a concrete backend.

pub mod grading;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::game::question::Question;

pub use grading::{GradeResult, HttpGrader, NullGrader};

/// Errors surfaced by external collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The requested record does not exist.
    #[error("profile not found for {0}")]
    ProfileNotFound(String),

    /// No question set is available.
    #[error("no question set available")]
    NoQuestions,

    /// The collaborator failed or timed out.
    #[error("external call failed: {0}")]
    Unavailable(String),
}

/// Public player profile shared with the opponent at pairing time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Display name; doubles as the player identity in matches.
    pub username: String,
    /// Ladder rating.
    pub rating: i32,
}

/// Read access to player profiles.
pub trait ProfileStore: Send + Sync + 'static {
    /// Fetch the public profile for a player.
    fn get_profile(&self, username: &str) -> BoxFuture<'_, Result<Profile, ServiceError>>;
}

/// Supplies the question sequence for a new match.
pub trait QuestionSupply: Send + Sync + 'static {
    /// Load the question set, in play order.
    fn load_question_set(&self) -> BoxFuture<'_, Result<Vec<Question>, ServiceError>>;
}

/// Grades free-text answers against a rubric.
pub trait Grader: Send + Sync + 'static {
    /// Grade `answer` for `prompt` under `rubric`, returning a mark in
    /// `[0, 1]`. Callers degrade failures to an incorrect answer.
    fn grade<'a>(
        &'a self,
        answer: &'a str,
        rubric: &'a str,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<GradeResult, ServiceError>>;
}

/// In-memory profile store.
///
/// Unknown players get a default-rating profile so a duel never aborts
/// on a missing profile row unless strict mode is requested.
#[derive(Default)]
pub struct MemoryProfiles {
    profiles: RwLock<BTreeMap<String, Profile>>,
    strict: bool,
}

impl MemoryProfiles {
    /// Default rating for unknown players.
    pub const DEFAULT_RATING: i32 = 1000;

    /// Create an empty, lenient store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that errors on unknown players.
    pub fn strict() -> Self {
        Self {
            profiles: RwLock::new(BTreeMap::new()),
            strict: true,
        }
    }

    /// Insert or replace a profile.
    pub async fn put(&self, profile: Profile) {
        self.profiles
            .write()
            .await
            .insert(profile.username.clone(), profile);
    }
}

impl ProfileStore for MemoryProfiles {
    fn get_profile(&self, username: &str) -> BoxFuture<'_, Result<Profile, ServiceError>> {
        let username = username.to_string();
        Box::pin(async move {
            if let Some(p) = self.profiles.read().await.get(&username) {
                return Ok(p.clone());
            }
            if self.strict {
                return Err(ServiceError::ProfileNotFound(username));
            }
            Ok(Profile {
                username,
                rating: Self::DEFAULT_RATING,
            })
        })
    }
}

/// Question supply backed by a fixed, pre-loaded set.
pub struct FixedQuestions {
    questions: Vec<Question>,
}

impl FixedQuestions {
    /// Wrap a pre-loaded question sequence.
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    /// Load the set from a JSON file (an array of questions).
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Unavailable(format!("read {}: {e}", path.display())))?;
        let questions: Vec<Question> = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Unavailable(format!("parse {}: {e}", path.display())))?;
        Ok(Self::new(questions))
    }
}

impl QuestionSupply for FixedQuestions {
    fn load_question_set(&self) -> BoxFuture<'_, Result<Vec<Question>, ServiceError>> {
        Box::pin(async move {
            if self.questions.is_empty() {
                return Err(ServiceError::NoQuestions);
            }
            Ok(self.questions.clone())
        })
    }
}

/// Shared handles to all collaborators, as wired into the server.
#[derive(Clone)]
pub struct Services {
    /// Player profiles.
    pub profiles: Arc<dyn ProfileStore>,
    /// Question sets.
    pub questions: Arc<dyn QuestionSupply>,
    /// Free-text grading.
    pub grader: Arc<dyn Grader>,
}
