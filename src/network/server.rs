//! WebSocket Duel Server
//!
//! Accept loop, per-connection tasks, and the event router that maps
//! inbound client messages to matchmaking and match intents. Every
//! intent except identification and ping requires an attached
//! username; unidentified intents are rejected without dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::state::{MatchId, MatchStore};
use crate::network::auth::{self, AuthConfig};
use crate::network::matchmaking::{Matchmaking, PairOutcome};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::rooms::{ConnId, Rooms};
use crate::network::session::{GameSession, SessionConfig, SessionError};
use crate::services::Services;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Authentication settings.
    pub auth: AuthConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            auth: AuthConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            auth: AuthConfig::from_env(),
            version: defaults.version,
        }
    }
}

/// Duel server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Per-connection router state, owned by the connection task.
struct ConnState {
    conn: ConnId,
    /// Attached identity, set by a successful `identify`.
    username: Option<String>,
}

/// The duel server.
pub struct DuelServer {
    config: ServerConfig,
    store: Arc<MatchStore>,
    rooms: Arc<Rooms>,
    matchmaking: Arc<Matchmaking>,
    session: GameSession,
    services: Services,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DuelServer {
    /// Create a new duel server wired to the given collaborators.
    pub fn new(config: ServerConfig, services: Services) -> Self {
        Self::with_session_config(config, services, SessionConfig::default())
    }

    /// Create a server with explicit coordinator tuning.
    pub fn with_session_config(
        config: ServerConfig,
        services: Services,
        session_config: SessionConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let store = Arc::new(MatchStore::new());
        let rooms = Arc::new(Rooms::new());
        let session = GameSession::new(
            store.clone(),
            rooms.clone(),
            services.clone(),
            session_config,
        );

        Self {
            config,
            store,
            rooms,
            matchmaking: Arc::new(Matchmaking::new()),
            session,
            services,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Run the accept loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("duel server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::SeqCst) >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {addr}");
                                continue;
                            }
                            debug!("new connection from {addr}");
                            self.clone().spawn_connection(stream, addr);
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Matches currently held in the store.
    pub async fn match_count(&self) -> usize {
        self.store.len().await
    }

    /// Connections waiting in the matchmaking queue.
    pub async fn queue_size(&self) -> usize {
        self.matchmaking.len().await
    }

    fn spawn_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("websocket handshake failed for {addr}: {e}");
                    return;
                }
            };
            self.connections.fetch_add(1, Ordering::SeqCst);

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            let conn = ConnId::allocate();
            self.rooms.register(conn, msg_tx.clone()).await;

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("failed to serialize message: {e}");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut state = ConnState {
                conn,
                username: None,
            };
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!(%conn, "invalid message: {e}");
                                        let _ = msg_tx.send(ServerMessage::Error {
                                            code: ErrorCode::InvalidMessage,
                                            message: "invalid message format".to_string(),
                                        }).await;
                                        continue;
                                    }
                                };
                                self.dispatch(&mut state, client_msg, &msg_tx).await;
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                // Handled by tungstenite; nothing to route.
                                let _ = payload;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(%conn, "client disconnected");
                                break;
                            }
                            Some(Err(e)) => {
                                debug!(%conn, "websocket error: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::SystemLog {
                            text: "server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            sender_task.abort();
            self.cleanup_connection(conn).await;
            self.connections.fetch_sub(1, Ordering::SeqCst);
            debug!(%conn, "connection cleaned up");
        });
    }

    /// Tear down one connection: leave the queue, leave the room, and
    /// schedule the room-emptiness check for any match left behind.
    async fn cleanup_connection(&self, conn: ConnId) {
        self.matchmaking.remove(conn).await;
        if let Some(match_id) = self.rooms.unregister(conn).await {
            self.session.schedule_room_check(match_id).await;
        }
    }

    // =========================================================================
    // EVENT ROUTER
    // =========================================================================

    async fn dispatch(
        &self,
        state: &mut ConnState,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        // Pre-identity surface.
        let msg = match msg {
            ClientMessage::Identify { username, token } => {
                self.handle_identify(state, username, token.as_deref(), sender)
                    .await;
                return;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender.send(ServerMessage::Pong { timestamp }).await;
                return;
            }
            other => other,
        };

        let username = match state.username.clone() {
            Some(u) => u,
            None => {
                let _ = sender
                    .send(ServerMessage::Error {
                        code: ErrorCode::NotIdentified,
                        message: "identify before sending match intents".to_string(),
                    })
                    .await;
                return;
            }
        };

        let result = match msg {
            ClientMessage::JoinQueue => {
                self.handle_join_queue(state.conn, &username, sender).await;
                Ok(())
            }
            ClientMessage::LeaveQueue => {
                self.matchmaking.remove(state.conn).await;
                let _ = sender
                    .send(ServerMessage::SystemLog {
                        text: "left the queue".to_string(),
                    })
                    .await;
                Ok(())
            }
            ClientMessage::JoinMatch { match_id } => {
                self.session
                    .join_room(state.conn, &MatchId::from_code(&match_id), &username)
                    .await
            }
            ClientMessage::Ready { match_id } => {
                self.session
                    .handle_ready(&MatchId::from_code(&match_id), &username)
                    .await
            }
            ClientMessage::Unready { match_id } => {
                self.session
                    .handle_unready(&MatchId::from_code(&match_id), &username)
                    .await
            }
            ClientMessage::SubmitAnswer { match_id, answer } => {
                self.session
                    .handle_answer(&MatchId::from_code(&match_id), &username, answer)
                    .await
            }
            ClientMessage::NextQuestion { match_id } => {
                self.session
                    .handle_next(&MatchId::from_code(&match_id), &username)
                    .await
            }
            ClientMessage::Chat { match_id, text } => {
                self.session
                    .handle_chat(&MatchId::from_code(&match_id), &username, text)
                    .await
            }
            // Identify and Ping returned above.
            ClientMessage::Identify { .. } | ClientMessage::Ping { .. } => Ok(()),
        };

        if let Err(e) = result {
            debug!(player = %username, "intent rejected: {e}");
            let _ = sender.send(session_error_notice(&e)).await;
        }
    }

    async fn handle_identify(
        &self,
        state: &mut ConnState,
        username: String,
        token: Option<&str>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match auth::verify_identity(&username, token, &self.config.auth) {
            Ok(()) => {
                debug!(conn = %state.conn, player = %username, "identified");
                state.username = Some(username.clone());
                let _ = sender.send(ServerMessage::Identified { username }).await;
            }
            Err(e) => {
                let _ = sender
                    .send(ServerMessage::Error {
                        code: ErrorCode::InvalidToken,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn handle_join_queue(
        &self,
        conn: ConnId,
        username: &str,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let outcome = self
            .matchmaking
            .try_pair(conn, username, &self.rooms, &self.services, &self.store)
            .await;

        match outcome {
            Ok(PairOutcome::Queued) | Ok(PairOutcome::Requeued) => {
                let _ = sender.send(ServerMessage::Queued).await;
            }
            Ok(PairOutcome::Matched(paired)) => {
                info!(
                    match_id = %paired.match_id,
                    players = ?[&paired.requester.username, &paired.opponent.username],
                    "match created"
                );
                let _ = sender
                    .send(ServerMessage::Matched {
                        match_id: paired.match_id.as_str().to_string(),
                        opponent: paired.opponent,
                    })
                    .await;
                self.rooms
                    .unicast(
                        paired.opponent_conn,
                        ServerMessage::Matched {
                            match_id: paired.match_id.as_str().to_string(),
                            opponent: paired.requester,
                        },
                    )
                    .await;
                // Reclaims the match if nobody joins its room within
                // the grace period; a join cancels the check.
                self.session.schedule_room_check(paired.match_id).await;
            }
            Err(e) => {
                warn!(player = %username, "pairing failed: {e}");
                let _ = sender
                    .send(ServerMessage::Error {
                        code: ErrorCode::PairingFailed,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

/// Map a coordinator error to a client error notice.
fn session_error_notice(err: &SessionError) -> ServerMessage {
    use crate::game::state::MatchError;
    let code = match err {
        SessionError::MatchNotFound(_) => ErrorCode::MatchNotFound,
        SessionError::Match(MatchError::UnknownPlayer(_)) => ErrorCode::NotInMatch,
        SessionError::Match(MatchError::InvalidPhase(_)) => ErrorCode::InvalidState,
    };
    ServerMessage::Error {
        code,
        message: err.to_string(),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::game::state::{MatchError, MatchPhase};
    use crate::services::{FixedQuestions, MemoryProfiles, NullGrader, Profile};

    fn test_services() -> Services {
        Services {
            profiles: Arc::new(MemoryProfiles::new()),
            questions: Arc::new(FixedQuestions::new(Vec::new())),
            grader: Arc::new(NullGrader),
        }
    }

    #[test]
    fn config_default_binds_all_interfaces() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 1000);
        assert!(!config.auth.is_configured());
    }

    #[tokio::test]
    async fn server_starts_empty() {
        let server = DuelServer::new(ServerConfig::default(), test_services());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.match_count().await, 0);
        assert_eq!(server.queue_size().await, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_accept_loop() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let server = Arc::new(DuelServer::new(config, test_services()));
        let handle = tokio::spawn(server.clone().run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn unidentified_intents_are_rejected() {
        let server = DuelServer::new(ServerConfig::default(), test_services());
        let (tx, mut rx) = mpsc::channel(8);
        let mut state = ConnState {
            conn: ConnId::allocate(),
            username: None,
        };

        server
            .dispatch(&mut state, ClientMessage::JoinQueue, &tx)
            .await;

        match rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::NotIdentified);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn identify_attaches_username() {
        let server = DuelServer::new(ServerConfig::default(), test_services());
        let (tx, mut rx) = mpsc::channel(8);
        let mut state = ConnState {
            conn: ConnId::allocate(),
            username: None,
        };

        server
            .dispatch(
                &mut state,
                ClientMessage::Identify {
                    username: "alice".to_string(),
                    token: None,
                },
                &tx,
            )
            .await;

        assert_eq!(state.username.as_deref(), Some("alice"));
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Identified { .. })
        ));
    }

    #[tokio::test]
    async fn stale_match_intent_reports_not_found() {
        let server = DuelServer::new(ServerConfig::default(), test_services());
        let (tx, mut rx) = mpsc::channel(8);
        let mut state = ConnState {
            conn: ConnId::allocate(),
            username: Some("alice".to_string()),
        };

        server
            .dispatch(
                &mut state,
                ClientMessage::Ready {
                    match_id: "FFFFFF".to_string(),
                },
                &tx,
            )
            .await;

        match rx.recv().await {
            Some(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::MatchNotFound);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn session_errors_map_to_notice_codes() {
        let not_found = SessionError::MatchNotFound(MatchId::from_code("AAAAAA"));
        assert!(matches!(
            session_error_notice(&not_found),
            ServerMessage::Error {
                code: ErrorCode::MatchNotFound,
                ..
            }
        ));

        let unknown = SessionError::Match(MatchError::UnknownPlayer("mallory".into()));
        assert!(matches!(
            session_error_notice(&unknown),
            ServerMessage::Error {
                code: ErrorCode::NotInMatch,
                ..
            }
        ));

        let phase = SessionError::Match(MatchError::InvalidPhase(MatchPhase::Waiting));
        assert!(matches!(
            session_error_notice(&phase),
            ServerMessage::Error {
                code: ErrorCode::InvalidState,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn join_queue_pairs_two_identified_players() {
        let profiles = MemoryProfiles::new();
        let services = Services {
            profiles: Arc::new(profiles),
            questions: Arc::new(FixedQuestions::new(vec![crate::game::Question {
                kind: crate::game::QuestionKind::MultipleChoice,
                prompt: "?".into(),
                choices: vec!["a*".into(), "b".into()],
                correct_choice: None,
                max_marks: 10,
                time_limit_secs: 15,
                reduction_time_limit_secs: 5,
                rubric: None,
            }])),
            grader: Arc::new(NullGrader),
        };
        let server = DuelServer::new(ServerConfig::default(), services);

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let conn_a = ConnId::allocate();
        let conn_b = ConnId::allocate();
        server.rooms.register(conn_a, tx_a.clone()).await;
        server.rooms.register(conn_b, tx_b.clone()).await;

        server.handle_join_queue(conn_a, "alice", &tx_a).await;
        assert!(matches!(rx_a.recv().await, Some(ServerMessage::Queued)));

        server.handle_join_queue(conn_b, "bob", &tx_b).await;

        let matched_b = rx_b.recv().await;
        let matched_a = rx_a.recv().await;
        match (matched_a, matched_b) {
            (
                Some(ServerMessage::Matched {
                    match_id: id_a,
                    opponent: opp_a,
                }),
                Some(ServerMessage::Matched {
                    match_id: id_b,
                    opponent: opp_b,
                }),
            ) => {
                assert_eq!(id_a, id_b);
                assert_eq!(opp_a.username, "bob");
                assert_eq!(opp_b.username, "alice");
            }
            other => panic!("expected both matched: {other:?}"),
        }
        assert_eq!(server.match_count().await, 1);
    }

    #[tokio::test]
    async fn unjoined_match_is_reclaimed_after_grace() {
        let services = Services {
            profiles: Arc::new(MemoryProfiles::new()),
            questions: Arc::new(FixedQuestions::new(vec![crate::game::Question {
                kind: crate::game::QuestionKind::MultipleChoice,
                prompt: "?".into(),
                choices: vec!["a*".into(), "b".into()],
                correct_choice: None,
                max_marks: 10,
                time_limit_secs: 15,
                reduction_time_limit_secs: 5,
                rubric: None,
            }])),
            grader: Arc::new(NullGrader),
        };
        let session_config = SessionConfig {
            display_duration: Duration::from_millis(50),
            cleanup_grace: Duration::from_millis(100),
        };
        let server =
            DuelServer::with_session_config(ServerConfig::default(), services, session_config);

        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let conn_a = ConnId::allocate();
        let conn_b = ConnId::allocate();
        server.rooms.register(conn_a, tx_a.clone()).await;
        server.rooms.register(conn_b, tx_b.clone()).await;

        server.handle_join_queue(conn_a, "alice", &tx_a).await;
        server.handle_join_queue(conn_b, "bob", &tx_b).await;
        assert_eq!(server.match_count().await, 1);

        // Both players vanish without ever joining the match room.
        server.cleanup_connection(conn_a).await;
        server.cleanup_connection(conn_b).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.match_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_leaves_queue_and_schedules_cleanup() {
        let server = DuelServer::new(ServerConfig::default(), test_services());
        let (tx, _rx) = mpsc::channel(8);
        let conn = ConnId::allocate();
        server.rooms.register(conn, tx.clone()).await;

        server.handle_join_queue(conn, "alice", &tx).await;
        assert_eq!(server.queue_size().await, 1);

        server.cleanup_connection(conn).await;
        assert_eq!(server.queue_size().await, 0);
        assert!(!server.rooms.is_live(conn).await);
    }

    #[test]
    fn profile_is_cloneable_into_notices() {
        let profile = Profile {
            username: "alice".to_string(),
            rating: 1200,
        };
        let msg = ServerMessage::Matched {
            match_id: "ABC123".to_string(),
            opponent: profile.clone(),
        };
        assert!(msg.to_json().is_ok());
        assert_eq!(profile.rating, 1200);
    }
}
