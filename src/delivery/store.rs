// src/delivery/store.rs

//! Session store
//!
//! Holds one `DeliverySession` per module. Entries live in a sharded
//! concurrent map, so work on different modules proceeds in parallel while
//! each entry is only ever read or written under its shard lock. Readers
//! always get a cloned snapshot, never a reference into a session that is
//! being mutated.

use super::{DeliverySession, ModuleId};
use dashmap::DashMap;

/// Session records keyed by module id
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<ModuleId, DeliverySession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one session
    pub fn get(&self, module_id: &ModuleId) -> Option<DeliverySession> {
        self.sessions.get(module_id).map(|entry| entry.value().clone())
    }

    /// Insert or replace a session
    pub fn upsert(&self, session: DeliverySession) {
        self.sessions.insert(session.module_id.clone(), session);
    }

    /// Remove a session, returning its last state
    pub fn remove(&self, module_id: &ModuleId) -> Option<DeliverySession> {
        self.sessions.remove(module_id).map(|(_, session)| session)
    }

    /// Remove a session only if `predicate` holds for it
    pub fn remove_if(
        &self,
        module_id: &ModuleId,
        predicate: impl FnOnce(&DeliverySession) -> bool,
    ) -> Option<DeliverySession> {
        self.sessions
            .remove_if(module_id, |_, session| predicate(session))
            .map(|(_, session)| session)
    }

    /// Mutate an existing session atomically
    ///
    /// Returns `None` when no session exists. The closure runs under the
    /// entry's lock and must not call back into the store.
    pub fn update<R>(
        &self,
        module_id: &ModuleId,
        f: impl FnOnce(&mut DeliverySession) -> R,
    ) -> Option<R> {
        self.sessions
            .get_mut(module_id)
            .map(|mut entry| f(entry.value_mut()))
    }

    /// Mutate a session atomically, creating it in the `None` state first
    pub fn update_or_insert<R>(
        &self,
        module_id: &ModuleId,
        f: impl FnOnce(&mut DeliverySession) -> R,
    ) -> R {
        let mut entry = self
            .sessions
            .entry(module_id.clone())
            .or_insert_with(|| DeliverySession::new(module_id.clone()));
        f(entry.value_mut())
    }

    /// Snapshots of all sessions, ordered by module id
    pub fn snapshot(&self) -> Vec<DeliverySession> {
        let mut sessions: Vec<DeliverySession> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
