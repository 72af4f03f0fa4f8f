//! Bounded identity map shared by all queries of a store session.
//!
//! Entries are kept in least-recently-used order on an index-linked list stored
//! in a slab, so lookups, touches, inserts and evictions are all O(1). The list
//! and the key index sit behind one `std::sync::Mutex`. Critical sections never
//! span I/O and the statistics counters are lock-free.
//!
//! There are no per-bucket locks. Eviction must pick the exact least recently
//! used entry across all keys, and that order lives in a single list, so it
//! cannot be split between independently locked shards.

use crate::error::{DbError, DbResult};
use crate::models::{CacheKey, EntityData};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Hit/miss counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

struct Node {
    key: CacheKey,
    value: Arc<EntityData>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU list: `head` is the most recently used entry, `tail` the eviction candidate.
struct LruState {
    index: HashMap<CacheKey, usize>,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruState {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, idx: usize) -> DbResult<&Node> {
        self.slots
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| DbError::cache_invariant(format!("dangling slot {}", idx)))
    }

    fn node_mut(&mut self, idx: usize) -> DbResult<&mut Node> {
        self.slots
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| DbError::cache_invariant(format!("dangling slot {}", idx)))
    }

    fn unlink(&mut self, idx: usize) -> DbResult<()> {
        let (prev, next) = {
            let node = self.node(idx)?;
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p)?.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n)?.prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx)?;
        node.prev = None;
        node.next = None;
        Ok(())
    }

    fn push_front(&mut self, idx: usize) -> DbResult<()> {
        let old_head = self.head;
        {
            let node = self.node_mut(idx)?;
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h)?.prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        Ok(())
    }

    fn touch(&mut self, idx: usize) -> DbResult<()> {
        if self.head == Some(idx) {
            return Ok(());
        }
        self.unlink(idx)?;
        self.push_front(idx)
    }

    fn get(&mut self, key: &CacheKey) -> DbResult<Option<Arc<EntityData>>> {
        let Some(&idx) = self.index.get(key) else {
            return Ok(None);
        };
        self.touch(idx)?;
        Ok(Some(Arc::clone(&self.node(idx)?.value)))
    }

    fn remove(&mut self, key: &CacheKey) -> DbResult<Option<Arc<EntityData>>> {
        let Some(idx) = self.index.remove(key) else {
            return Ok(None);
        };
        self.unlink(idx)?;
        let node = self
            .slots
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or_else(|| DbError::cache_invariant(format!("dangling slot {}", idx)))?;
        self.free.push(idx);
        Ok(Some(node.value))
    }

    fn evict_tail(&mut self) -> DbResult<Option<CacheKey>> {
        let Some(tail) = self.tail else {
            return Ok(None);
        };
        let key = self.node(tail)?.key.clone();
        self.remove(&key)?;
        Ok(Some(key))
    }

    /// Insert a key known to be absent.
    fn insert_new(&mut self, key: CacheKey, value: Arc<EntityData>) -> DbResult<()> {
        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx)
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }
}

/// Bounded LRU identity map from [`CacheKey`] to entity data.
pub struct EntityCache {
    capacity: usize,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl EntityCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> DbResult<Self> {
        if capacity == 0 {
            return Err(DbError::invalid_input(
                "cache capacity must be greater than 0",
            ));
        }
        Ok(Self {
            capacity,
            state: Mutex::new(LruState::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, LruState>> {
        self.state
            .lock()
            .map_err(|_| DbError::cache_invariant("cache lock poisoned"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Membership test. Does not refresh recency.
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.lock()
            .map(|state| state.index.contains_key(key))
            .unwrap_or(false)
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&self, key: &CacheKey) -> DbResult<Option<Arc<EntityData>>> {
        let found = self.lock()?.get(key)?;
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    /// Insert or overwrite an entry, evicting the least recently used one
    /// when the cache is full. Returns the evicted key.
    pub fn put(&self, key: CacheKey, value: Arc<EntityData>) -> DbResult<Option<CacheKey>> {
        let mut state = self.lock()?;
        if let Some(&idx) = state.index.get(&key) {
            state.node_mut(idx)?.value = value;
            state.touch(idx)?;
            return Ok(None);
        }
        let evicted = self.make_room(&mut state)?;
        state.insert_new(key, value)?;
        self.check_invariants(&state)?;
        Ok(evicted)
    }

    /// Insert unless present and return the canonical entry.
    ///
    /// Concurrent hydrations of the same entity converge on whichever value
    /// was inserted first.
    pub fn put_if_absent(&self, key: CacheKey, value: Arc<EntityData>) -> DbResult<Arc<EntityData>> {
        let mut state = self.lock()?;
        if let Some(existing) = state.get(&key)? {
            return Ok(existing);
        }
        self.make_room(&mut state)?;
        state.insert_new(key, Arc::clone(&value))?;
        self.check_invariants(&state)?;
        Ok(value)
    }

    /// Remove one entry. Returns true if it was present.
    pub fn invalidate(&self, key: &CacheKey) -> DbResult<bool> {
        let removed = self.lock()?.remove(key)?;
        if removed.is_some() {
            debug!(key = %key, "Cache entry invalidated");
        }
        Ok(removed.is_some())
    }

    /// Remove every entry.
    pub fn clear(&self) -> DbResult<()> {
        self.lock()?.clear();
        debug!("Cache cleared");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }

    fn make_room(&self, state: &mut LruState) -> DbResult<Option<CacheKey>> {
        if state.len() < self.capacity {
            return Ok(None);
        }
        let evicted = state.evict_tail()?;
        if let Some(key) = &evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Evicted least recently used entry");
        }
        Ok(evicted)
    }

    fn check_invariants(&self, state: &LruState) -> DbResult<()> {
        let len = state.len();
        if len > self.capacity {
            return Err(DbError::cache_invariant(format!(
                "entry count {} exceeds capacity {}",
                len, self.capacity
            )));
        }
        let occupied = state.slots.len() - state.free.len();
        if occupied != len {
            return Err(DbError::cache_invariant(format!(
                "index holds {} keys but {} slots are occupied",
                len, occupied
            )));
        }
        Ok(())
    }
}
