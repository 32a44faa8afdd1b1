//! Semaphores
//!
//! Named, capacity-bounded rendezvous points independent of any stage. A
//! semaphore gates how many sessions may hold a slot at once (for example a
//! raid attempt) and tracks one host for control operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::network::session::{Session, SessionId};

/// Semaphore errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    /// No semaphore with this name.
    #[error("Semaphore not found")]
    NotFound,

    /// A semaphore with this name already exists.
    #[error("Semaphore already exists")]
    AlreadyExists,

    /// Every slot is taken.
    #[error("Semaphore is full ({max_players} slots)")]
    Full {
        /// Capacity that was hit.
        max_players: u16,
    },
}

/// Result of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// Whether the session held a slot.
    pub removed: bool,
    /// Whether the session was host.
    pub was_host: bool,
    /// Slots still held.
    pub remaining: usize,
}

#[derive(Debug)]
struct SemaphoreState {
    clients: BTreeMap<SessionId, Arc<Session>>,
    max_players: u16,
    host: Option<SessionId>,
}

/// A named capacity gate.
#[derive(Debug)]
pub struct Semaphore {
    id: u32,
    name: String,
    state: RwLock<SemaphoreState>,
}

impl Semaphore {
    /// Create a semaphore with `host` already holding a slot. Capacity is
    /// raised to 1 if lower.
    pub fn new(id: u32, name: impl Into<String>, max_players: u16, host: &Arc<Session>) -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(host.id(), host.clone());
        Self {
            id,
            name: name.into(),
            state: RwLock::new(SemaphoreState {
                clients,
                max_players: max_players.max(1),
                host: Some(host.id()),
            }),
        }
    }

    /// Numeric ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity.
    pub fn max_players(&self) -> u16 {
        self.state.read().max_players
    }

    /// Take a slot.
    ///
    /// Check and insert happen under one exclusive lock, so concurrent
    /// acquirers can never push the count past capacity. A session that
    /// already holds a slot succeeds without change.
    pub fn acquire(&self, session: &Arc<Session>) -> Result<(), SemaphoreError> {
        let mut state = self.state.write();
        if state.clients.contains_key(&session.id()) {
            return Ok(());
        }
        if state.clients.len() >= state.max_players as usize {
            return Err(SemaphoreError::Full {
                max_players: state.max_players,
            });
        }
        state.clients.insert(session.id(), session.clone());
        Ok(())
    }

    /// Give up a slot.
    ///
    /// Host reassignment is left to the caller; a released host leaves the
    /// semaphore hostless until `set_host` is called.
    pub fn release(&self, session_id: SessionId) -> Release {
        let mut state = self.state.write();
        let removed = state.clients.remove(&session_id).is_some();
        let was_host = state.host == Some(session_id);
        if was_host {
            state.host = None;
        }
        Release {
            removed,
            was_host,
            remaining: state.clients.len(),
        }
    }

    /// Hand control to a member. Returns false if it holds no slot.
    pub fn set_host(&self, session_id: SessionId) -> bool {
        let mut state = self.state.write();
        if !state.clients.contains_key(&session_id) {
            return false;
        }
        state.host = Some(session_id);
        true
    }

    /// Current host.
    pub fn host(&self) -> Option<SessionId> {
        self.state.read().host
    }

    /// Longest-connected member.
    pub fn first_member(&self) -> Option<SessionId> {
        self.state.read().clients.keys().next().copied()
    }

    /// Whether the session holds a slot.
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.state.read().clients.contains_key(&session_id)
    }

    /// Slots held.
    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// True when no slot is held.
    pub fn is_empty(&self) -> bool {
        self.state.read().clients.is_empty()
    }

    /// Queue a message for every member except `exclude` (non-blocking).
    pub fn broadcast<F>(&self, build: F, exclude: Option<SessionId>) -> usize
    where
        F: Fn(&Session) -> Vec<u8>,
    {
        let state = self.state.write();
        let mut delivered = 0;
        for (id, session) in state.clients.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if session.queue_send_non_blocking(build(session)) {
                delivered += 1;
            }
        }
        delivered
    }
}

impl crate::lobby::registry::Membership for Semaphore {
    fn has_members(&self) -> bool {
        !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::network::session::OutboundQueue;

    fn test_session(id: u64) -> (Arc<Session>, OutboundQueue) {
        Session::new(SessionId(id), &ServerConfig::default())
    }

    #[test]
    fn test_creator_is_host_and_member() {
        let (a, _q) = test_session(1);
        let sem = Semaphore::new(1, "quest_lock", 4, &a);
        assert_eq!(sem.host(), Some(a.id()));
        assert!(sem.contains(a.id()));
        assert_eq!(sem.client_count(), 1);
    }

    #[test]
    fn test_acquire_beyond_capacity_fails_without_mutation() {
        let (a, _qa) = test_session(1);
        let (b, _qb) = test_session(2);
        let sem = Semaphore::new(1, "solo", 1, &a);

        assert_eq!(sem.acquire(&a), Ok(()));
        assert_eq!(sem.client_count(), 1);
        assert_eq!(sem.acquire(&b), Err(SemaphoreError::Full { max_players: 1 }));
        assert_eq!(sem.client_count(), 1);
        assert!(!sem.contains(b.id()));
    }

    #[test]
    fn test_concurrent_acquire_respects_capacity() {
        let (host, _q) = test_session(0);
        let sem = Arc::new(Semaphore::new(1, "party", 4, &host));
        let sessions: Vec<_> = (1..=32).map(test_session).collect();

        let handles: Vec<_> = sessions
            .iter()
            .map(|(session, _)| {
                let sem = sem.clone();
                let session = session.clone();
                std::thread::spawn(move || sem.acquire(&session).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 3);
        assert_eq!(sem.client_count(), 4);
    }

    #[test]
    fn test_release_and_host_handoff() {
        let (a, _qa) = test_session(1);
        let (b, _qb) = test_session(2);
        let sem = Semaphore::new(1, "party", 4, &a);
        sem.acquire(&b).unwrap();

        let release = sem.release(a.id());
        assert_eq!(
            release,
            Release {
                removed: true,
                was_host: true,
                remaining: 1
            }
        );
        assert_eq!(sem.host(), None);

        assert!(!sem.set_host(a.id()));
        assert_eq!(sem.first_member(), Some(b.id()));
        assert!(sem.set_host(b.id()));
        assert_eq!(sem.host(), Some(b.id()));

        let release = sem.release(b.id());
        assert_eq!(release.remaining, 0);
        assert!(sem.is_empty());
        assert!(!sem.release(b.id()).removed);
    }

    #[test]
    fn test_broadcast_reaches_members() {
        let (a, mut qa) = test_session(1);
        let (b, mut qb) = test_session(2);
        let sem = Semaphore::new(1, "party", 4, &a);
        sem.acquire(&b).unwrap();

        assert_eq!(sem.broadcast(|_| vec![0xAB], Some(a.id())), 1);
        assert!(qa.try_recv().is_none());
        assert_eq!(qb.try_recv(), Some(vec![0xAB]));
    }
}
