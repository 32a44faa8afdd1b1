//! Stage State
//!
//! Shared state for one lobby: present sessions, reserved slots, spawned
//! objects and the echo cache of client-authored blobs.
//!
//! All fields sit behind one reader/writer lock. Operations that touch several
//! fields (`leave` removes the client and its objects) therefore happen as a
//! single transition for any concurrent reader.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::lobby::object::{Position, StageObject};
use crate::network::protocol::ClientFilter;
use crate::network::session::{Session, SessionId};

/// Key of a cached stage blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryKey {
    /// Primary blob type.
    pub id0: u8,
    /// Secondary blob type.
    pub id1: u8,
}

/// Stage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// No stage with this ID.
    #[error("Stage not found")]
    NotFound,

    /// Stage already exists.
    #[error("Stage already exists")]
    AlreadyExists,

    /// Stage is full.
    #[error("Stage is full")]
    Full,

    /// Stage is locked.
    #[error("Stage is locked")]
    Locked,

    /// Password mismatch.
    #[error("Wrong stage password")]
    WrongPassword,

    /// Caller is not the stage host.
    #[error("Not the stage host")]
    NotHost,

    /// Caller is not in a stage.
    #[error("Not in a stage")]
    NotInStage,
}

/// A session present in the stage.
#[derive(Debug)]
struct StageClient {
    session: Arc<Session>,
    char_id: u32,
}

/// Result of removing a session from a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Character that left.
    pub char_id: u32,
    /// Objects removed along with it.
    pub removed_objects: Vec<u32>,
    /// Session that became host, if the leaver was host.
    pub new_host: Option<SessionId>,
}

/// Snapshot used for stage listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    /// Stage ID.
    pub id: String,
    /// Present clients.
    pub client_count: usize,
    /// Reserved slots.
    pub reserved_count: usize,
    /// Capacity.
    pub max_players: u16,
    /// Lock flag.
    pub locked: bool,
    /// Whether a password is set.
    pub has_password: bool,
}

#[derive(Debug)]
struct StageState {
    clients: BTreeMap<SessionId, StageClient>,
    reserved_slots: HashMap<u32, bool>,
    objects: HashMap<u32, Arc<StageObject>>,
    raw_binary: HashMap<BinaryKey, Vec<u8>>,
    host: Option<SessionId>,
    max_players: u16,
    password: String,
    locked: bool,
    /// Creator keeping a never-entered stage alive.
    held_by: Option<SessionId>,
    next_object_id: u32,
}

impl StageState {
    fn is_full(&self) -> bool {
        self.clients.len() >= self.max_players as usize
    }

    fn admit(&self, char_id: u32) -> Result<(), StageError> {
        if self.reserved_slots.contains_key(&char_id) {
            return Ok(());
        }
        if self.locked {
            return Err(StageError::Locked);
        }
        if self.is_full() {
            return Err(StageError::Full);
        }
        Ok(())
    }

    fn insert_client(&mut self, session: &Arc<Session>, char_id: u32) {
        self.clients.insert(
            session.id(),
            StageClient {
                session: session.clone(),
                char_id,
            },
        );
        self.held_by = None;
    }
}

/// One lobby or instance.
#[derive(Debug)]
pub struct Stage {
    id: String,
    state: RwLock<StageState>,
}

impl Stage {
    /// Create an empty stage.
    pub fn new(id: impl Into<String>, max_players: u16) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(StageState {
                clients: BTreeMap::new(),
                reserved_slots: HashMap::new(),
                objects: HashMap::new(),
                raw_binary: HashMap::new(),
                host: None,
                max_players,
                password: String::new(),
                locked: false,
                held_by: None,
                next_object_id: 0,
            }),
        }
    }

    /// Create a stage that `creator` hosts before anyone has entered.
    ///
    /// Sweeps skip it until the first client joins or the creator releases
    /// the hold.
    pub fn created_by(id: impl Into<String>, max_players: u16, creator: SessionId) -> Self {
        let stage = Self::new(id, max_players);
        {
            let mut state = stage.state.write();
            state.host = Some(creator);
            state.held_by = Some(creator);
        }
        stage
    }

    /// Stage ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Insert a session into `clients` without admission checks.
    ///
    /// Returns false if the session was already present.
    pub fn join(&self, session: &Arc<Session>, char_id: u32) -> bool {
        let mut state = self.state.write();
        if state.clients.contains_key(&session.id()) {
            return false;
        }
        state.insert_client(session, char_id);
        true
    }

    /// Check admission and join in one step.
    ///
    /// A character holding a reservation bypasses the lock and capacity
    /// checks; the slot was already counted when it reserved.
    pub fn try_join(&self, session: &Arc<Session>, char_id: u32) -> Result<(), StageError> {
        let mut state = self.state.write();
        if state.clients.contains_key(&session.id()) {
            return Ok(());
        }
        state.admit(char_id)?;
        state.insert_client(session, char_id);
        Ok(())
    }

    /// Whether `try_join` would currently admit `char_id`.
    ///
    /// Advisory only: the answer can change before the join happens.
    pub fn check_admission(&self, char_id: u32) -> Result<(), StageError> {
        self.state.read().admit(char_id)
    }

    /// Remove a session and every object it owns.
    ///
    /// Returns `None` if the session was not present. If the leaver was host,
    /// the longest-connected remaining session becomes host.
    pub fn leave(&self, session_id: SessionId) -> Option<Departure> {
        let mut state = self.state.write();
        let client = state.clients.remove(&session_id)?;

        let mut removed_objects: Vec<u32> = state
            .objects
            .iter()
            .filter(|(_, object)| object.owner() == session_id)
            .map(|(id, _)| *id)
            .collect();
        removed_objects.sort_unstable();
        for id in &removed_objects {
            state.objects.remove(id);
        }

        let mut new_host = None;
        if state.host == Some(session_id) {
            state.host = state.clients.keys().next().copied();
            new_host = state.host;
        }

        Some(Departure {
            char_id: client.char_id,
            removed_objects,
            new_host,
        })
    }

    /// Whether the session is present.
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.state.read().clients.contains_key(&session_id)
    }

    /// Present client count.
    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Drop the creator's hold if `session_id` holds it.
    pub fn release_hold(&self, session_id: SessionId) -> bool {
        let mut state = self.state.write();
        if state.held_by == Some(session_id) {
            state.held_by = None;
            true
        } else {
            false
        }
    }

    /// Whether the creator's hold is still in place.
    pub fn is_held(&self) -> bool {
        self.state.read().held_by.is_some()
    }

    /// True when no session is present. Reservations do not count.
    pub fn is_empty(&self) -> bool {
        self.state.read().clients.is_empty()
    }

    /// `client_count() >= max_players()`.
    pub fn is_full(&self) -> bool {
        self.state.read().is_full()
    }

    /// Capacity.
    pub fn max_players(&self) -> u16 {
        self.state.read().max_players
    }

    /// Change capacity.
    pub fn set_max_players(&self, max_players: u16) {
        self.state.write().max_players = max_players;
    }

    // =========================================================================
    // RESERVATIONS
    // =========================================================================

    /// Reserve (or update) a slot for `char_id`.
    pub fn reserve(&self, char_id: u32, ready: bool) {
        self.state.write().reserved_slots.insert(char_id, ready);
    }

    /// Reserve after checking lock, password and reservation capacity.
    ///
    /// Updating an existing reservation only rechecks the password.
    pub fn try_reserve(&self, char_id: u32, ready: bool, password: &str) -> Result<(), StageError> {
        let mut state = self.state.write();
        if !state.password.is_empty() && state.password != password {
            return Err(StageError::WrongPassword);
        }
        if !state.reserved_slots.contains_key(&char_id) {
            if state.locked {
                return Err(StageError::Locked);
            }
            if state.reserved_slots.len() >= state.max_players as usize {
                return Err(StageError::Full);
            }
        }
        state.reserved_slots.insert(char_id, ready);
        Ok(())
    }

    /// Drop a reservation. Returns false if none existed.
    pub fn unreserve(&self, char_id: u32) -> bool {
        self.state.write().reserved_slots.remove(&char_id).is_some()
    }

    /// Reservation state for `char_id`, if any.
    pub fn reservation(&self, char_id: u32) -> Option<bool> {
        self.state.read().reserved_slots.get(&char_id).copied()
    }

    /// Number of reserved slots.
    pub fn reserved_count(&self) -> usize {
        self.state.read().reserved_slots.len()
    }

    /// Character IDs of present clients matching `filter`, ascending.
    ///
    /// `NotReady` and `Ready` only match present clients that also hold a
    /// reservation in that state.
    pub fn enumerate(&self, filter: ClientFilter) -> Vec<u32> {
        let state = self.state.read();
        let mut ids: Vec<u32> = state
            .clients
            .values()
            .map(|c| c.char_id)
            .filter(|char_id| match filter {
                ClientFilter::All => true,
                ClientFilter::NotReady => state.reserved_slots.get(char_id) == Some(&false),
                ClientFilter::Ready => state.reserved_slots.get(char_id) == Some(&true),
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    // =========================================================================
    // OBJECTS
    // =========================================================================

    /// Register an object under its own ID. Returns false, leaving the stage
    /// unchanged, if the ID is taken.
    pub fn add_object(&self, object: Arc<StageObject>) -> bool {
        let mut state = self.state.write();
        if state.objects.contains_key(&object.id()) {
            return false;
        }
        state.objects.insert(object.id(), object);
        true
    }

    /// Create an object with the next free stage-local ID.
    ///
    /// IDs are allocated under the write lock, so objects from different
    /// sessions never share one. Zero is never handed out.
    pub fn spawn_object(&self, owner: SessionId, owner_char_id: u32, position: Position) -> Arc<StageObject> {
        let mut state = self.state.write();
        let id = loop {
            state.next_object_id = state.next_object_id.wrapping_add(1);
            let id = state.next_object_id;
            if id != 0 && !state.objects.contains_key(&id) {
                break id;
            }
        };
        let object = Arc::new(StageObject::new(id, owner, owner_char_id, position));
        state.objects.insert(id, Arc::clone(&object));
        object
    }

    /// Look up an object.
    pub fn object(&self, id: u32) -> Option<Arc<StageObject>> {
        self.state.read().objects.get(&id).cloned()
    }

    /// All objects, ordered by ID.
    pub fn objects(&self) -> Vec<Arc<StageObject>> {
        let state = self.state.read();
        let mut objects: Vec<_> = state.objects.values().cloned().collect();
        objects.sort_by_key(|o| o.id());
        objects
    }

    /// Object count.
    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    // =========================================================================
    // ECHO CACHE
    // =========================================================================

    /// Store a blob; last writer wins.
    pub fn set_raw_binary(&self, key: BinaryKey, data: Vec<u8>) {
        self.state.write().raw_binary.insert(key, data);
    }

    /// Fetch a blob.
    pub fn get_raw_binary(&self, key: BinaryKey) -> Option<Vec<u8>> {
        self.state.read().raw_binary.get(&key).cloned()
    }

    // =========================================================================
    // HOST, LOCK, PASSWORD
    // =========================================================================
    //
    // Authorization is the caller's job: check `is_host` before mutating.

    /// Current host.
    pub fn host(&self) -> Option<SessionId> {
        self.state.read().host
    }

    /// Whether `session_id` is the host.
    pub fn is_host(&self, session_id: SessionId) -> bool {
        self.state.read().host == Some(session_id)
    }

    /// Replace the host.
    pub fn set_host(&self, host: Option<SessionId>) {
        self.state.write().host = host;
    }

    /// Make `session_id` host if there is none yet. Returns true if it is host
    /// afterwards.
    pub fn claim_host(&self, session_id: SessionId) -> bool {
        let mut state = self.state.write();
        let host = *state.host.get_or_insert(session_id);
        host == session_id
    }

    /// Lock flag.
    pub fn is_locked(&self) -> bool {
        self.state.read().locked
    }

    /// Set the lock flag.
    pub fn set_locked(&self, locked: bool) {
        self.state.write().locked = locked;
    }

    /// Set the password; empty clears it.
    pub fn set_password(&self, password: impl Into<String>) {
        self.state.write().password = password.into();
    }

    /// Whether a password is set.
    pub fn has_password(&self) -> bool {
        !self.state.read().password.is_empty()
    }

    /// Listing snapshot.
    pub fn summary(&self) -> StageSummary {
        let state = self.state.read();
        StageSummary {
            id: self.id.clone(),
            client_count: state.clients.len(),
            reserved_count: state.reserved_slots.len(),
            max_players: state.max_players,
            locked: state.locked,
            has_password: !state.password.is_empty(),
        }
    }

    // =========================================================================
    // BROADCAST
    // =========================================================================

    /// Queue a message for every present client except `exclude`.
    ///
    /// `build` runs once per recipient. The exclusive lock is held for the
    /// whole loop, which is sound only because the non-blocking enqueue never
    /// waits; a full queue drops the message for that recipient.
    pub fn broadcast<F>(&self, build: F, exclude: Option<SessionId>) -> usize
    where
        F: Fn(&Session) -> Vec<u8>,
    {
        let state = self.state.write();
        let mut delivered = 0;
        for (id, client) in state.clients.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if client.session.queue_send_non_blocking(build(&client.session)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Broadcast the same bytes to everyone except `exclude`.
    pub fn broadcast_message(&self, message: &[u8], exclude: Option<SessionId>) -> usize {
        self.broadcast(|_| message.to_vec(), exclude)
    }
}

impl crate::lobby::registry::Membership for Stage {
    fn has_members(&self) -> bool {
        let state = self.state.read();
        !state.clients.is_empty() || state.held_by.is_some()
    }
}
