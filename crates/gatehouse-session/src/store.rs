//! Storage behind the session registry.
//!
//! The registry never touches a map directly; it goes through the
//! [`SessionStore`] trait. Every method is a single atomic step on one
//! record (or a batch of independent single-record steps), which is what
//! makes `revoke` and `bind` linearizable with respect to each other.
//!
//! [`MemoryStore`] is the default backend: a sharded [`DashMap`]. A write
//! to a record holds only that record's shard lock, so unrelated tokens
//! never contend.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gatehouse_protocol::{Identity, TokenId};
use gatehouse_transport::ConnectionId;

use crate::{BindOutcome, BindPolicy, SessionError, SessionRecord};

/// Atomic operations on session records, keyed by token id.
///
/// Implementations report an unreachable backend as
/// [`SessionError::StoreUnavailable`]. They must never report a token as
/// live when they can't tell.
pub trait SessionStore: Send + Sync + 'static {
    /// Inserts a new record. Fails with `DuplicateToken` if the id exists.
    fn insert(&self, record: SessionRecord) -> Result<(), SessionError>;

    /// Returns a copy of the record, if present.
    fn get(&self, token_id: &TokenId) -> Result<Option<SessionRecord>, SessionError>;

    /// Sets `revoked` and returns the record as it was before, or `None`
    /// if the id is unknown.
    fn revoke(&self, token_id: &TokenId) -> Result<Option<SessionRecord>, SessionError>;

    /// Binds `connection` to the record if it is live at `now`.
    ///
    /// Rebinding the connection that is already bound returns `Bound`.
    fn bind(
        &self,
        token_id: &TokenId,
        connection: ConnectionId,
        policy: BindPolicy,
        now: i64,
    ) -> Result<BindOutcome, SessionError>;

    /// Clears the binding, but only if `connection` is the one bound.
    /// Returns whether anything changed.
    fn unbind(&self, token_id: &TokenId, connection: ConnectionId) -> Result<bool, SessionError>;

    /// Removes the record if its expiry is at or before `now` and returns
    /// it. A live or unknown record yields `None`.
    fn remove_if_expired(
        &self,
        token_id: &TokenId,
        now: i64,
    ) -> Result<Option<SessionRecord>, SessionError>;

    /// Removes every record whose expiry is at or before `now` and
    /// returns them.
    fn remove_expired(&self, now: i64) -> Result<Vec<SessionRecord>, SessionError>;

    /// Ids of every record belonging to `identity`.
    fn tokens_of(&self, identity: &Identity) -> Result<Vec<TokenId>, SessionError>;

    /// Number of stored records, expired ones included.
    fn count(&self) -> Result<usize, SessionError>;
}

/// In-process [`SessionStore`] on a sharded concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<TokenId, SessionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn insert(&self, record: SessionRecord) -> Result<(), SessionError> {
        match self.records.entry(record.token_id.clone()) {
            Entry::Occupied(_) => Err(SessionError::DuplicateToken(record.token_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn get(&self, token_id: &TokenId) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.records.get(token_id).map(|r| r.value().clone()))
    }

    fn revoke(&self, token_id: &TokenId) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.records.get_mut(token_id).map(|mut record| {
            let before = record.clone();
            record.revoked = true;
            before
        }))
    }

    fn bind(
        &self,
        token_id: &TokenId,
        connection: ConnectionId,
        policy: BindPolicy,
        now: i64,
    ) -> Result<BindOutcome, SessionError> {
        // `get_mut` holds the shard's write lock until `record` drops, so
        // the revoked/expired checks and the write are one atomic step.
        let mut record = self
            .records
            .get_mut(token_id)
            .ok_or_else(|| SessionError::UnknownToken(token_id.clone()))?;

        if record.revoked {
            return Err(SessionError::Revoked(token_id.clone()));
        }
        if record.is_expired_at(now) {
            return Err(SessionError::Expired(token_id.clone()));
        }

        match (record.connection, policy) {
            (None, _) => {
                record.connection = Some(connection);
                Ok(BindOutcome::Bound)
            }
            (Some(current), _) if current == connection => Ok(BindOutcome::Bound),
            (Some(current), BindPolicy::Reject) => Err(SessionError::BindConflict {
                token_id: token_id.clone(),
                connection: current,
            }),
            (Some(previous), BindPolicy::Evict) => {
                record.connection = Some(connection);
                Ok(BindOutcome::Evicted(previous))
            }
        }
    }

    fn unbind(&self, token_id: &TokenId, connection: ConnectionId) -> Result<bool, SessionError> {
        Ok(match self.records.get_mut(token_id) {
            Some(mut record) if record.connection == Some(connection) => {
                record.connection = None;
                true
            }
            _ => false,
        })
    }

    fn remove_if_expired(
        &self,
        token_id: &TokenId,
        now: i64,
    ) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self
            .records
            .remove_if(token_id, |_, record| record.is_expired_at(now))
            .map(|(_, record)| record))
    }

    fn remove_expired(&self, now: i64) -> Result<Vec<SessionRecord>, SessionError> {
        // Collect ids first: removing while iterating would deadlock on
        // the shard the iterator is holding.
        let expired: Vec<TokenId> = self
            .records
            .iter()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.key().clone())
            .collect();

        Ok(expired
            .into_iter()
            .filter_map(|id| {
                self.records
                    .remove_if(&id, |_, record| record.is_expired_at(now))
                    .map(|(_, record)| record)
            })
            .collect())
    }

    fn tokens_of(&self, identity: &Identity) -> Result<Vec<TokenId>, SessionError> {
        Ok(self
            .records
            .iter()
            .filter(|r| &r.identity == identity)
            .map(|r| r.key().clone())
            .collect())
    }

    fn count(&self) -> Result<usize, SessionError> {
        Ok(self.records.len())
    }
}
