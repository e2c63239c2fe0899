//! The table of open connections: per-identity limits, rooms, fan-out.
//!
//! Connection tasks own their sockets. The hub only holds a handle to
//! each task's outbound queue and close signal, so anything (a message
//! handler, the revocation watcher, an admin call) can reach a connection
//! without touching its socket.
//!
//! Lock order is `connections` → `rooms`, and `by_identity` →
//! `connections`. No method holds a map guard across an `.await`.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gatehouse_protocol::{Identity, SystemMessage, TokenId};
use gatehouse_transport::ConnectionId;
use tokio::sync::mpsc;

use crate::CloseReason;

/// A message queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Application bytes, wrapped in an `App` envelope on the way out.
    App(Vec<u8>),
    /// A session-level message.
    System(SystemMessage),
}

/// What the hub keeps for one open connection.
#[derive(Debug)]
pub(crate) struct HubEntry {
    pub(crate) identity: Identity,
    pub(crate) token_id: TokenId,
    pub(crate) outbox: mpsc::Sender<Outbound>,
    /// Capacity 1: the first close reason wins.
    pub(crate) close: mpsc::Sender<CloseReason>,
    rooms: HashSet<String>,
}

impl HubEntry {
    pub(crate) fn new(
        identity: Identity,
        token_id: TokenId,
        outbox: mpsc::Sender<Outbound>,
        close: mpsc::Sender<CloseReason>,
    ) -> Self {
        Self {
            identity,
            token_id,
            outbox,
            close,
            rooms: HashSet::new(),
        }
    }
}

/// Every open connection, indexed by id, by identity, and by room.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    connections: DashMap<ConnectionId, HubEntry>,
    by_identity: DashMap<Identity, HashSet<ConnectionId>>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection unless its identity already holds `limit` open
    /// connections. The count and the insert happen under one lock, so two
    /// racing admissions can't both squeeze past the limit.
    ///
    /// Returns the identity's connection count on refusal.
    pub(crate) fn admit(
        &self,
        id: ConnectionId,
        entry: HubEntry,
        limit: usize,
    ) -> Result<(), usize> {
        let mut held = self.by_identity.entry(entry.identity.clone()).or_default();
        if held.len() >= limit {
            return Err(held.len());
        }
        held.insert(id);
        self.connections.insert(id, entry);
        Ok(())
    }

    /// Forgets a connection and removes it from every room. Returns
    /// `false` if it was already gone (evicted, or never admitted).
    pub fn remove(&self, id: ConnectionId) -> bool {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return false;
        };
        self.forget(id, &entry);
        true
    }

    /// Removes a connection from the hub right away and tells its task to
    /// close with `reason`. Its slot counts against the identity limit no
    /// longer, even before the task finishes closing.
    pub fn evict(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return false;
        };
        // Full means a reason is already pending; that one wins.
        let _ = entry.close.try_send(reason);
        self.forget(id, &entry);
        true
    }

    /// Asks a connection to close. Returns `false` if it isn't open here.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        match self.connections.get(&id) {
            Some(entry) => {
                let _ = entry.close.try_send(reason);
                true
            }
            None => false,
        }
    }

    /// Asks every connection of `identity` to close. Returns how many
    /// were asked.
    pub fn close_identity(&self, identity: &Identity, reason: CloseReason) -> usize {
        self.connections_of(identity)
            .into_iter()
            .filter(|id| self.close(*id, reason.clone()))
            .count()
    }

    /// Queues application bytes for one connection. `false` if the
    /// connection is gone or its queue is full.
    pub fn send_to(&self, id: ConnectionId, data: Vec<u8>) -> bool {
        self.enqueue(id, Outbound::App(data))
    }

    /// Queues a message for one connection.
    pub fn enqueue(&self, id: ConnectionId, message: Outbound) -> bool {
        let Some(entry) = self.connections.get(&id) else {
            return false;
        };
        match entry.outbox.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(connection_id = %id, "outbound queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queues application bytes for every open connection of `identity`.
    /// Returns how many accepted it.
    pub fn send_to_identity(&self, identity: &Identity, data: &[u8]) -> usize {
        self.connections_of(identity)
            .into_iter()
            .filter(|id| self.send_to(*id, data.to_vec()))
            .count()
    }

    /// Subscribes a connection to `room`. `false` if the connection isn't
    /// open here.
    pub fn join_room(&self, id: ConnectionId, room: &str) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        entry.rooms.insert(room.to_string());
        self.rooms.entry(room.to_string()).or_default().insert(id);
        true
    }

    /// Unsubscribes a connection from `room`. `false` if it wasn't a member.
    pub fn leave_room(&self, id: ConnectionId, room: &str) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if !entry.rooms.remove(room) {
            return false;
        }
        self.drop_member(room, id);
        true
    }

    /// Queues `data` for every member of `room` except `except`. Returns
    /// how many connections accepted it.
    pub fn broadcast_room(&self, room: &str, data: &[u8], except: Option<ConnectionId>) -> usize {
        self.room_members(room)
            .into_iter()
            .filter(|id| Some(*id) != except)
            .filter(|id| self.send_to(*id, data.to_vec()))
            .count()
    }

    /// The connections currently in `room`.
    pub fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The open connections of `identity`.
    pub fn connections_of(&self, identity: &Identity) -> Vec<ConnectionId> {
        self.by_identity
            .get(identity)
            .map(|held| held.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The token a connection authenticated with.
    pub fn token_of(&self, id: ConnectionId) -> Option<TokenId> {
        self.connections.get(&id).map(|entry| entry.token_id.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn forget(&self, id: ConnectionId, entry: &HubEntry) {
        if let Entry::Occupied(mut held) = self.by_identity.entry(entry.identity.clone()) {
            held.get_mut().remove(&id);
            if held.get().is_empty() {
                held.remove();
            }
        }
        for room in &entry.rooms {
            self.drop_member(room, id);
        }
    }

    fn drop_member(&self, room: &str, id: ConnectionId) {
        if let Entry::Occupied(mut members) = self.rooms.entry(room.to_string()) {
            members.get_mut().remove(&id);
            if members.get().is_empty() {
                members.remove();
            }
        }
    }
}
