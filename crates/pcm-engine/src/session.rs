//! Listener session registry.
//!
//! The playback engine does not depend on it; a server front end uses it to track which
//! authenticated listeners are connected. [`InMemorySessionRegistry`] is owned by its
//! caller, so separate engines never share sessions.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use uuid::Uuid;

pub type UserId = u32;

/// Opaque id of the client connection a session is bound to.
pub type ConnectionId = u64;

/// Who is connecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: UserId,
    pub name: String,
}

/// One connected, authenticated listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    /// Issued on every `add`; a reconnect gets a fresh token.
    pub token: Uuid,
    pub connection: ConnectionId,
    pub opened_at: SystemTime,
}

pub trait SessionRegistry {
    /// Whether `credential` matches the account registered for `id`.
    fn authenticate(&self, id: UserId, credential: &str) -> bool;

    fn find_active(&self, id: UserId) -> Option<Session>;

    /// Open a session for `identity`, replacing any session it already has.
    fn add(&self, identity: Identity, connection: ConnectionId) -> Session;

    /// Close the session for `id`. Returns `false` when none was active.
    fn remove(&self, id: UserId) -> bool;

    /// Active sessions ordered by user id.
    fn enumerate(&self) -> Vec<Session>;
}

#[derive(Default)]
struct RegistryInner {
    accounts: BTreeMap<UserId, String>,
    sessions: BTreeMap<UserId, Session>,
}

#[derive(Default)]
pub struct InMemorySessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the credential for `id`.
    pub fn register_account(&self, id: UserId, credential: impl Into<String>) {
        self.lock().accounts.insert(id, credential.into());
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl SessionRegistry for InMemorySessionRegistry {
    fn authenticate(&self, id: UserId, credential: &str) -> bool {
        let ok = self
            .lock()
            .accounts
            .get(&id)
            .is_some_and(|stored| stored == credential);
        if !ok {
            tracing::debug!(user_id = id, "authentication rejected");
        }
        ok
    }

    fn find_active(&self, id: UserId) -> Option<Session> {
        self.lock().sessions.get(&id).cloned()
    }

    fn add(&self, identity: Identity, connection: ConnectionId) -> Session {
        let session = Session {
            identity,
            token: Uuid::new_v4(),
            connection,
            opened_at: SystemTime::now(),
        };
        let replaced = self
            .lock()
            .sessions
            .insert(session.identity.id, session.clone());
        tracing::info!(
            user_id = session.identity.id,
            name = %session.identity.name,
            connection,
            replaced = replaced.is_some(),
            "session opened"
        );
        session
    }

    fn remove(&self, id: UserId) -> bool {
        let removed = self.lock().sessions.remove(&id).is_some();
        if removed {
            tracing::info!(user_id = id, "session closed");
        }
        removed
    }

    fn enumerate(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }
}
