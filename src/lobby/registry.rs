//! Registries
//!
//! String-keyed concurrent maps that own stages and semaphores. Lookups of
//! different IDs land on different shards and never contend; operations on
//! the same ID serialize on its shard.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::lobby::semaphore::{Semaphore, SemaphoreError};
use crate::lobby::stage::Stage;
use crate::network::session::Session;

/// Values that a sweep may delete once nobody is inside.
pub trait Membership {
    /// True while at least one session is a member.
    fn has_members(&self) -> bool;
}

/// Concurrent `id -> Arc<V>` map with atomic get-or-create.
#[derive(Debug)]
pub struct Registry<V> {
    entries: DashMap<String, Arc<V>>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V: Membership> Registry<V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point lookup.
    pub fn get(&self, id: &str) -> Option<Arc<V>> {
        self.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the entry for `id`, creating it with `create` if absent.
    ///
    /// The flag is true when this call created the entry. `create` runs at
    /// most once and only while the shard is locked.
    pub fn get_or_create<F>(&self, id: &str, create: F) -> (Arc<V>, bool)
    where
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.get(id) {
            return (existing, false);
        }
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let value = Arc::new(create());
                entry.insert(Arc::clone(&value));
                (value, true)
            }
        }
    }

    /// Insert unless present. `Err` carries the existing entry.
    pub fn store_if_absent(&self, id: &str, value: V) -> Result<Arc<V>, Arc<V>> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(entry) => Err(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let value = Arc::new(value);
                entry.insert(Arc::clone(&value));
                Ok(value)
            }
        }
    }

    /// Insert or replace, returning the previous entry.
    pub fn store(&self, id: &str, value: Arc<V>) -> Option<Arc<V>> {
        self.entries.insert(id.to_string(), value)
    }

    /// Remove an entry.
    pub fn delete(&self, id: &str) -> Option<Arc<V>> {
        self.entries.remove(id).map(|(_, value)| value)
    }

    /// Whether `id` still maps to exactly `value`.
    pub fn is_current(&self, id: &str, value: &Arc<V>) -> bool {
        self.entries
            .get(id)
            .map(|entry| Arc::ptr_eq(entry.value(), value))
            .unwrap_or(false)
    }

    /// Visit every entry until `f` returns false.
    ///
    /// Iterates over a snapshot taken up front with no shard lock held during
    /// the callback, so `f` may delete the current entry or any other.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<V>) -> bool,
    {
        let snapshot: Vec<(String, Arc<V>)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for (id, value) in &snapshot {
            if !f(id, value) {
                break;
            }
        }
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the registry holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete every entry without members; returns the removed IDs.
    ///
    /// Membership is rechecked under the shard lock, so an entry that gained a
    /// member after the snapshot survives. Running it twice is a no-op.
    pub fn destruct_empty(&self) -> Vec<String> {
        let mut removed = Vec::new();
        self.range(|id, _| {
            if self
                .entries
                .remove_if(id, |_, value| !value.has_members())
                .is_some()
            {
                removed.push(id.to_string());
            }
            true
        });
        removed
    }
}

/// Stage registry.
pub type StageMap = Registry<Stage>;

impl StageMap {
    /// Delete stages with no present clients. Reservations do not keep a
    /// stage alive; a creator's hold on a never-entered stage does.
    pub fn destruct_empty_stages(&self) -> Vec<String> {
        let removed = self.destruct_empty();
        for id in &removed {
            debug!(stage = %id, "Destructed empty stage");
        }
        removed
    }
}

/// Semaphore registry with creation policy.
#[derive(Debug)]
pub struct SemaphoreRegistry {
    semaphores: Registry<Semaphore>,
    next_id: AtomicU32,
    raid_prefix: String,
    raid_capacity: u16,
}

impl SemaphoreRegistry {
    /// Create an empty registry. Names starting with `raid_prefix` are
    /// always created with `raid_capacity`.
    pub fn new(raid_prefix: impl Into<String>, raid_capacity: u16) -> Self {
        Self {
            semaphores: Registry::new(),
            next_id: AtomicU32::new(1),
            raid_prefix: raid_prefix.into(),
            raid_capacity,
        }
    }

    /// Capacity a new semaphore named `name` would get.
    ///
    /// Never below 1: the creator takes the first slot.
    pub fn effective_capacity(&self, name: &str, requested: u16) -> u16 {
        let capacity = if !self.raid_prefix.is_empty() && name.starts_with(&self.raid_prefix) {
            self.raid_capacity
        } else {
            requested
        };
        capacity.max(1)
    }

    fn build(&self, host: &Arc<Session>, name: &str, max_players: u16) -> Semaphore {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Semaphore::new(id, name, self.effective_capacity(name, max_players), host)
    }

    /// Register a new semaphore; `host` becomes host and first member.
    pub fn create(
        &self,
        host: &Arc<Session>,
        name: &str,
        max_players: u16,
    ) -> Result<Arc<Semaphore>, SemaphoreError> {
        match self.semaphores.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(SemaphoreError::AlreadyExists),
            Entry::Vacant(entry) => {
                let semaphore = Arc::new(self.build(host, name, max_players));
                entry.insert(Arc::clone(&semaphore));
                Ok(semaphore)
            }
        }
    }

    /// Acquire `name`, creating it with `session` as host if absent.
    ///
    /// The flag is true when this call created the semaphore.
    pub fn acquire_or_create(
        &self,
        session: &Arc<Session>,
        name: &str,
        max_players: u16,
    ) -> Result<(Arc<Semaphore>, bool), SemaphoreError> {
        loop {
            let (semaphore, created) = self
                .semaphores
                .get_or_create(name, || self.build(session, name, max_players));
            if !created {
                semaphore.acquire(session)?;
            }
            // A sweep may have unlinked it between lookup and acquire.
            if self.semaphores.is_current(name, &semaphore) {
                return Ok((semaphore, created));
            }
            semaphore.release(session.id());
        }
    }

    /// Acquire an existing semaphore.
    pub fn acquire(&self, session: &Arc<Session>, name: &str) -> Result<Arc<Semaphore>, SemaphoreError> {
        loop {
            let semaphore = self.semaphores.get(name).ok_or(SemaphoreError::NotFound)?;
            semaphore.acquire(session)?;
            if self.semaphores.is_current(name, &semaphore) {
                return Ok(semaphore);
            }
            semaphore.release(session.id());
        }
    }

    /// Point lookup.
    pub fn get(&self, name: &str) -> Option<Arc<Semaphore>> {
        self.semaphores.get(name)
    }

    /// Remove an entry.
    pub fn delete(&self, name: &str) -> Option<Arc<Semaphore>> {
        self.semaphores.delete(name)
    }

    /// Snapshot iteration, see [`Registry::range`].
    pub fn range<F>(&self, f: F)
    where
        F: FnMut(&str, &Arc<Semaphore>) -> bool,
    {
        self.semaphores.range(f)
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    /// True when the registry holds nothing.
    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    /// Delete semaphores nobody holds.
    pub fn destruct_empty_semaphores(&self) -> Vec<String> {
        let removed = self.semaphores.destruct_empty();
        for name in &removed {
            debug!(semaphore = %name, "Destructed empty semaphore");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::network::session::{OutboundQueue, SessionId};

    fn test_session(id: u64) -> (Arc<Session>, OutboundQueue) {
        Session::new(SessionId(id), &ServerConfig::default())
    }

    #[test]
    fn test_get_or_create_reports_creation() {
        let stages = StageMap::new();
        let (first, created) = stages.get_or_create("town", || Stage::new("town", 127));
        assert!(created);
        let (second, created) = stages.get_or_create("town", || Stage::new("town", 4));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.max_players(), 127);
    }

    #[test]
    fn test_concurrent_get_or_create_creates_once() {
        let stages = Arc::new(StageMap::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let stages = stages.clone();
                std::thread::spawn(move || stages.get_or_create("quest", || Stage::new("quest", 4)).1)
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c)
            .count();
        assert_eq!(created, 1);
        assert_eq!(stages.len(), 1);
    }

    #[test]
    fn test_store_if_absent() {
        let stages = StageMap::new();
        assert!(stages.store_if_absent("a", Stage::new("a", 4)).is_ok());
        let existing = stages.store_if_absent("a", Stage::new("a", 8)).unwrap_err();
        assert_eq!(existing.max_players(), 4);
    }

    #[test]
    fn test_range_tolerates_deletion() {
        let stages = StageMap::new();
        for id in ["a", "b", "c", "d"] {
            stages.store(id, Arc::new(Stage::new(id, 4)));
        }
        let mut visited = 0;
        stages.range(|id, _| {
            visited += 1;
            stages.delete(id);
            stages.delete("d");
            true
        });
        assert!(visited >= 3);
        assert!(stages.is_empty());
    }

    #[test]
    fn test_destruct_empty_stages_is_idempotent() {
        let stages = StageMap::new();
        let (a, _qa) = test_session(1);
        let (occupied, _) = stages.get_or_create("occupied", || Stage::new("occupied", 4));
        occupied.join(&a, 1);
        let (reserved, _) = stages.get_or_create("reserved", || Stage::new("reserved", 4));
        reserved.reserve(7, true);
        stages.get_or_create("empty", || Stage::new("empty", 4));
        let (created, _) = stages.get_or_create("created", || Stage::created_by("created", 4, SessionId(9)));

        let mut removed = stages.destruct_empty_stages();
        removed.sort();
        assert_eq!(removed, vec!["empty".to_string(), "reserved".to_string()]);
        assert!(stages.destruct_empty_stages().is_empty());
        assert_eq!(stages.len(), 2);
        assert!(stages.is_current("occupied", &occupied));

        // The creator's hold keeps an unentered stage until released.
        created.release_hold(SessionId(9));
        assert_eq!(stages.destruct_empty_stages(), vec!["created".to_string()]);
    }

    #[test]
    fn test_raid_prefix_override() {
        let registry = SemaphoreRegistry::new("raid_", 127);
        let (a, _q) = test_session(1);
        let raid = registry.create(&a, "raid_tower_3", 32).unwrap();
        assert_eq!(raid.max_players(), 127);
        let normal = registry.create(&a, "quest_3", 32).unwrap();
        assert_eq!(normal.max_players(), 32);
        assert!(normal.id() > raid.id());
    }

    #[test]
    fn test_zero_capacity_still_holds_creator() {
        let registry = SemaphoreRegistry::new("raid_", 127);
        let (a, _qa) = test_session(1);
        let (b, _qb) = test_session(2);
        assert_eq!(registry.effective_capacity("q", 0), 1);

        let (sem, created) = registry.acquire_or_create(&a, "q", 0).unwrap();
        assert!(created);
        assert_eq!(sem.max_players(), 1);
        assert!(sem.client_count() <= sem.max_players() as usize);
        assert_eq!(
            registry.acquire(&b, "q").unwrap_err(),
            SemaphoreError::Full { max_players: 1 }
        );
    }

    #[test]
    fn test_create_duplicate_name() {
        let registry = SemaphoreRegistry::new("raid_", 127);
        let (a, _q) = test_session(1);
        registry.create(&a, "quest", 4).unwrap();
        assert_eq!(
            registry.create(&a, "quest", 4).unwrap_err(),
            SemaphoreError::AlreadyExists
        );
    }

    #[test]
    fn test_acquire_or_create_capacity() {
        let registry = SemaphoreRegistry::new("raid_", 127);
        let (a, _qa) = test_session(1);
        let (b, _qb) = test_session(2);

        let (sem, created) = registry.acquire_or_create(&a, "solo", 1).unwrap();
        assert!(created);
        assert_eq!(sem.client_count(), 1);

        let err = registry.acquire_or_create(&b, "solo", 1).unwrap_err();
        assert_eq!(err, SemaphoreError::Full { max_players: 1 });
        assert_eq!(sem.client_count(), 1);

        assert_eq!(
            registry.acquire(&b, "missing").unwrap_err(),
            SemaphoreError::NotFound
        );
    }

    #[test]
    fn test_destruct_empty_semaphores() {
        let registry = SemaphoreRegistry::new("raid_", 127);
        let (a, _qa) = test_session(1);
        let (b, _qb) = test_session(2);
        let held = registry.create(&a, "held", 4).unwrap();
        let released = registry.create(&b, "released", 4).unwrap();
        released.release(b.id());

        assert_eq!(registry.destruct_empty_semaphores(), vec!["released".to_string()]);
        assert!(registry.destruct_empty_semaphores().is_empty());
        assert!(registry.get("held").is_some());
        held.release(a.id());
        assert_eq!(registry.destruct_empty_semaphores(), vec!["held".to_string()]);
        assert!(registry.is_empty());
    }
}
