//! Distributed reference counting for object liveness
//!
//! The `ReferenceCounter` is the single source of truth for whether an
//! object handle is still alive. It tracks two kinds of holds per ID:
//! explicit local references (paired add/remove calls from callers) and
//! implicit pending-task holds (added for every by-reference task argument
//! for the duration of the task's execution window).
//!
//! Increments and decrements are linearizable per ID via a fixed array of
//! mutex-guarded shards keyed by the ID's hash.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::trace;

use super::error::{RefCountError, RefCountResult};
use super::ident::ObjectId;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Default, Clone, Copy)]
struct RefEntry {
    local: u64,
    pending_tasks: u64,
}

impl RefEntry {
    fn total(&self) -> u64 {
        self.local + self.pending_tasks
    }
}

/// Liveness bookkeeping for all object handles issued by a runtime
///
/// Counts never go negative: removing a hold that was never added is a
/// contract violation surfaced as [`RefCountError::DanglingReference`], and
/// crashes loudly in debug builds.
pub struct ReferenceCounter {
    shards: Vec<Mutex<HashMap<ObjectId, RefEntry>>>,
}

impl ReferenceCounter {
    /// Create an empty counter table
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, id: &ObjectId) -> &Mutex<HashMap<ObjectId, RefEntry>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Start tracking a freshly issued ID with the caller's implicit local
    /// reference
    pub fn register(&self, id: &ObjectId) {
        let mut shard = self.shard(id).lock();
        let entry = shard.entry(id.clone()).or_default();
        entry.local += 1;
        trace!(object = %id, local = entry.local, "registered object reference");
    }

    /// Increment the local hold count for `id`
    ///
    /// Each call must be paired with exactly one matching
    /// [`remove_local`](Self::remove_local); the count is additive.
    pub fn add_local(&self, id: &ObjectId) -> RefCountResult<()> {
        let mut shard = self.shard(id).lock();
        match shard.get_mut(id) {
            Some(entry) => {
                entry.local += 1;
                Ok(())
            }
            None => Err(RefCountError::UnknownObject(id.clone())),
        }
    }

    /// Decrement the local hold count for `id`
    ///
    /// Returns `true` when the total count reached zero and the object is
    /// now eviction-eligible.
    pub fn remove_local(&self, id: &ObjectId) -> RefCountResult<bool> {
        let mut shard = self.shard(id).lock();
        let Some(entry) = shard.get_mut(id) else {
            debug_assert!(false, "dangling local reference removal for {id}");
            return Err(RefCountError::DanglingReference(id.clone()));
        };
        if entry.local == 0 {
            debug_assert!(false, "dangling local reference removal for {id}");
            return Err(RefCountError::DanglingReference(id.clone()));
        }
        entry.local -= 1;
        if entry.total() == 0 {
            shard.remove(id);
            trace!(object = %id, "object is eviction-eligible");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Add an implicit pending-task hold for a by-reference task argument
    pub fn add_task_hold(&self, id: &ObjectId) -> RefCountResult<()> {
        let mut shard = self.shard(id).lock();
        match shard.get_mut(id) {
            Some(entry) => {
                entry.pending_tasks += 1;
                Ok(())
            }
            None => Err(RefCountError::UnknownObject(id.clone())),
        }
    }

    /// Release a pending-task hold
    ///
    /// Returns `true` when the total count reached zero. Task completion and
    /// task failure both release the hold; failure must not leak references.
    pub fn remove_task_hold(&self, id: &ObjectId) -> RefCountResult<bool> {
        let mut shard = self.shard(id).lock();
        let Some(entry) = shard.get_mut(id) else {
            debug_assert!(false, "dangling task hold removal for {id}");
            return Err(RefCountError::DanglingReference(id.clone()));
        };
        if entry.pending_tasks == 0 {
            debug_assert!(false, "dangling task hold removal for {id}");
            return Err(RefCountError::DanglingReference(id.clone()));
        }
        entry.pending_tasks -= 1;
        if entry.total() == 0 {
            shard.remove(id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Total hold count across local and pending-task references
    pub fn total(&self, id: &ObjectId) -> u64 {
        self.shard(id)
            .lock()
            .get(id)
            .map(|entry| entry.total())
            .unwrap_or(0)
    }

    /// Whether any holder still references `id`
    pub fn is_live(&self, id: &ObjectId) -> bool {
        self.total(id) > 0
    }

    /// Number of IDs currently tracked
    pub fn tracked(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}

impl Default for ReferenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped holder for the implicit task-argument references of one task
///
/// Acquired before a task is scheduled and released on drop, on every exit
/// path: completion, application failure, worker death, and abandonment all
/// run the same release.
pub struct ArgRefGuard {
    counter: Arc<ReferenceCounter>,
    held: Vec<ObjectId>,
}

impl ArgRefGuard {
    /// Acquire task holds for every ID, rolling back on partial failure
    pub fn acquire(
        counter: Arc<ReferenceCounter>,
        ids: impl IntoIterator<Item = ObjectId>,
    ) -> RefCountResult<Self> {
        let mut held = Vec::new();
        for id in ids {
            if let Err(err) = counter.add_task_hold(&id) {
                for acquired in &held {
                    let _ = counter.remove_task_hold(acquired);
                }
                return Err(err);
            }
            held.push(id);
        }
        Ok(Self { counter, held })
    }

    /// The IDs held by this guard
    pub fn ids(&self) -> &[ObjectId] {
        &self.held
    }
}

impl Drop for ArgRefGuard {
    fn drop(&mut self) {
        for id in &self.held {
            let _ = self.counter.remove_task_hold(id);
        }
    }
}
