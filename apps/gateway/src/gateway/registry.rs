//! Process-wide mapping of user identifier to session.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ApiError;

use super::session::Session;

/// Registry of all open sessions, keyed by `User::identifier()`.
///
/// Insertion is conditional so that at most one session per identifier can
/// exist; removal happens exactly once from the session teardown path.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the session unless the identifier is already taken.
    pub fn insert(&self, identifier: &str, session: Arc<Session>) -> Result<(), ApiError> {
        match self.sessions.entry(identifier.to_string()) {
            Entry::Occupied(_) => Err(ApiError::user_already_exists()),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Remove the entry, but only if it still belongs to the given session.
    /// A losing session of an admission race must not evict the winner.
    pub fn remove(&self, identifier: &str, session: &Arc<Session>) {
        self.sessions
            .remove_if(identifier, |_, existing| Arc::ptr_eq(existing, session));
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<Session>> {
        self.sessions.get(identifier).map(|e| e.value().clone())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.sessions.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
