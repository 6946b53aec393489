//! Connection Rooms
//!
//! Registry of live connections and their match-room membership. This
//! is the crate's view of the connection layer: the event router keeps
//! it current, and the coordinator only consumes `broadcast`, `unicast`
//! and `room_size`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::game::state::MatchId;
use crate::network::protocol::ServerMessage;

/// Unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(uuid::Uuid);

impl ConnId {
    /// Allocate a fresh id.
    pub fn allocate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.as_simple().to_string()[..8])
    }
}

#[derive(Default)]
struct RoomTable {
    /// Outbound channel per live connection.
    senders: BTreeMap<ConnId, mpsc::Sender<ServerMessage>>,
    /// Room membership by match id.
    rooms: BTreeMap<MatchId, BTreeSet<ConnId>>,
    /// Reverse index: which room each connection sits in.
    membership: BTreeMap<ConnId, MatchId>,
}

/// Live connections and room membership.
#[derive(Default)]
pub struct Rooms {
    table: RwLock<RoomTable>,
}

impl Rooms {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound channel.
    pub async fn register(&self, conn: ConnId, sender: mpsc::Sender<ServerMessage>) {
        self.table.write().await.senders.insert(conn, sender);
    }

    /// Drop a connection entirely: channel and any room membership.
    /// Returns the room the connection was in, if any.
    pub async fn unregister(&self, conn: ConnId) -> Option<MatchId> {
        let mut table = self.table.write().await;
        table.senders.remove(&conn);
        let room = table.membership.remove(&conn);
        if let Some(ref match_id) = room {
            if let Some(members) = table.rooms.get_mut(match_id) {
                members.remove(&conn);
                if members.is_empty() {
                    table.rooms.remove(match_id);
                }
            }
        }
        room
    }

    /// Whether the connection is still live.
    pub async fn is_live(&self, conn: ConnId) -> bool {
        self.table.read().await.senders.contains_key(&conn)
    }

    /// Put a connection into a match room, leaving any previous room.
    pub async fn join(&self, conn: ConnId, match_id: MatchId) {
        let mut table = self.table.write().await;
        if let Some(prev) = table.membership.remove(&conn) {
            if let Some(members) = table.rooms.get_mut(&prev) {
                members.remove(&conn);
                if members.is_empty() {
                    table.rooms.remove(&prev);
                }
            }
        }
        table.rooms.entry(match_id.clone()).or_default().insert(conn);
        table.membership.insert(conn, match_id);
    }

    /// Number of connections currently in a match room.
    pub async fn room_size(&self, match_id: &MatchId) -> usize {
        self.table
            .read()
            .await
            .rooms
            .get(match_id)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    /// Send an event to every connection in a match room.
    pub async fn broadcast(&self, match_id: &MatchId, message: ServerMessage) {
        let senders: Vec<_> = {
            let table = self.table.read().await;
            match table.rooms.get(match_id) {
                Some(members) => members
                    .iter()
                    .filter_map(|c| table.senders.get(c).cloned())
                    .collect(),
                None => return,
            }
        };
        for sender in senders {
            // A full or closed channel means a dying connection; the
            // disconnect path will reap it.
            let _ = sender.send(message.clone()).await;
        }
    }

    /// Send an event to one connection.
    pub async fn unicast(&self, conn: ConnId, message: ServerMessage) {
        let sender = self.table.read().await.senders.get(&conn).cloned();
        match sender {
            Some(s) => {
                let _ = s.send(message).await;
            }
            None => debug!(%conn, "unicast to unknown connection"),
        }
    }

    /// Tear down an entire room (match cleanup).
    pub async fn drop_room(&self, match_id: &MatchId) {
        let mut table = self.table.write().await;
        if let Some(members) = table.rooms.remove(match_id) {
            for conn in members {
                table.membership.remove(&conn);
            }
        }
    }
}
