//! Write-once object storage with blocking-wait retrieval
//!
//! The store maps opaque string handles to immutable byte payloads. A
//! handle is issued either by `put` (payload known immediately) or by the
//! task dispatcher (`register_pending`, payload materializes when the task
//! completes). Materialization happens exactly once per handle, possibly as
//! a failure marker, and unblocks every suspended `get`/`wait`.
//!
//! Capacity pressure is relieved in two stages: eviction of refcount-zero
//! objects, then spilling of cold referenced payloads to the runtime root's
//! spill directory. Retrieval never interprets payload bytes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use futures::StreamExt;
use futures::stream::FuturesUnordered;

use super::error::{ObjectError, ObjectResult, TaskFailure};
use super::ident::ObjectId;
use super::refcount::ReferenceCounter;
use super::storage::Storage;

/// Opaque payload bytes
pub type Payload = Vec<u8>;

/// The terminal content of a handle: a value or a captured task failure
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    /// The task (or `put` caller) produced a payload
    Value(Payload),
    /// The task failed; retrieval surfaces this marker
    Failed(TaskFailure),
}

#[derive(Debug)]
enum SlotValue {
    Pending,
    InMemory(Payload),
    Spilled { len: usize },
    Failed(TaskFailure),
}

#[derive(Debug)]
struct Slot {
    value: SlotValue,
    last_touch: u64,
    ready_tx: watch::Sender<bool>,
}

impl Slot {
    fn pending() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            value: SlotValue::Pending,
            last_touch: 0,
            ready_tx,
        }
    }

    fn is_ready(&self) -> bool {
        !matches!(self.value, SlotValue::Pending)
    }

    fn in_memory_len(&self) -> usize {
        match &self.value {
            SlotValue::InMemory(payload) => payload.len(),
            _ => 0,
        }
    }
}

struct StoreState {
    slots: HashMap<ObjectId, Slot>,
    used_bytes: usize,
}

/// Counters describing the store's current occupancy
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    /// Handles currently tracked (pending and materialized)
    pub objects: usize,
    /// Handles not yet materialized
    pub pending: usize,
    /// Bytes held in memory
    pub in_memory_bytes: usize,
    /// Handles whose payloads live in the spill directory
    pub spilled: usize,
}

/// Content store for all object handles issued by a runtime
pub struct ObjectStore {
    state: RwLock<StoreState>,
    refs: Arc<ReferenceCounter>,
    storage: Option<Storage>,
    capacity_bytes: usize,
    clock: AtomicU64,
}

impl ObjectStore {
    /// Create a store with the given memory capacity
    ///
    /// When `storage` is provided, cold referenced payloads spill to disk
    /// under capacity pressure instead of failing `put`.
    pub fn new(
        capacity_bytes: usize,
        refs: Arc<ReferenceCounter>,
        storage: Option<Storage>,
    ) -> Self {
        Self {
            state: RwLock::new(StoreState {
                slots: HashMap::new(),
                used_bytes: 0,
            }),
            refs,
            storage,
            capacity_bytes,
            clock: AtomicU64::new(1),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Store a payload under a fresh handle and register the caller's
    /// implicit local reference
    pub fn put(&self, payload: Payload) -> ObjectResult<ObjectId> {
        let id = ObjectId::fresh();
        let len = payload.len();
        let mut state = self.state.write();
        self.make_room(&mut state, len)?;

        let mut slot = Slot::pending();
        slot.value = SlotValue::InMemory(payload);
        slot.last_touch = self.tick();
        slot.ready_tx.send_replace(true);

        state.used_bytes += len;
        state.slots.insert(id.clone(), slot);
        self.refs.register(&id);
        debug!(object = %id, bytes = len, "stored object");
        Ok(id)
    }

    /// Issue an unmaterialized handle for a future task result
    pub fn register_pending(&self, id: &ObjectId) {
        let mut state = self.state.write();
        state.slots.insert(id.clone(), Slot::pending());
        self.refs.register(id);
    }

    /// Materialize a pending handle exactly once
    ///
    /// Fails with `AlreadyMaterialized` on a second materialization and
    /// `NotFound` if the handle was dropped (e.g. abandoned after its
    /// reference count reached zero).
    pub fn materialize(&self, id: &ObjectId, outcome: Materialized) -> ObjectResult<()> {
        let mut state = self.state.write();
        {
            let slot = state
                .slots
                .get(id)
                .ok_or_else(|| ObjectError::NotFound(id.clone()))?;
            if slot.is_ready() {
                return Err(ObjectError::AlreadyMaterialized(id.clone()));
            }
        }

        let value = match outcome {
            Materialized::Failed(failure) => {
                debug!(object = %id, %failure, "materialized failure marker");
                SlotValue::Failed(failure)
            }
            Materialized::Value(payload) => {
                let len = payload.len();
                self.make_room(&mut state, len)?;
                state.used_bytes += len;
                SlotValue::InMemory(payload)
            }
        };

        let slot = state
            .slots
            .get_mut(id)
            .ok_or_else(|| ObjectError::NotFound(id.clone()))?;
        slot.value = value;
        slot.last_touch = self.tick();
        slot.ready_tx.send_replace(true);
        Ok(())
    }

    /// Drop a pending handle whose computation was abandoned
    ///
    /// Suspended getters (if any) observe the handle as lost.
    pub(crate) fn abandon(&self, id: &ObjectId) {
        let mut state = self.state.write();
        if let Some(slot) = state.slots.remove(id) {
            state.used_bytes -= slot.in_memory_len();
        }
    }

    /// Retrieve a payload, suspending the calling logical task until the
    /// handle is materialized
    pub async fn get(&self, id: &ObjectId) -> ObjectResult<Payload> {
        loop {
            let mut rx = {
                let mut state = self.state.write();
                let tick = self.tick();
                let slot = state
                    .slots
                    .get_mut(id)
                    .ok_or_else(|| ObjectError::NotFound(id.clone()))?;
                slot.last_touch = tick;
                match &slot.value {
                    SlotValue::InMemory(payload) => return Ok(payload.clone()),
                    SlotValue::Failed(failure) => {
                        return Err(ObjectError::TaskFailed(failure.clone()));
                    }
                    SlotValue::Spilled { .. } => {
                        drop(state);
                        return self.read_spilled(id);
                    }
                    SlotValue::Pending => slot.ready_tx.subscribe(),
                }
            };

            // Suspend until materialized. A dropped sender means the handle
            // vanished before materialization: the object is lost.
            if rx.wait_for(|ready| *ready).await.is_err() {
                return Err(ObjectError::Lost(id.clone()));
            }
        }
    }

    fn read_spilled(&self, id: &ObjectId) -> ObjectResult<Payload> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| ObjectError::Lost(id.clone()))?;
        Ok(storage.read_spill(id)?)
    }

    /// Batched retrieval preserving input order, with per-element failures
    pub async fn get_many(&self, ids: &[ObjectId]) -> Vec<ObjectResult<Payload>> {
        futures::future::join_all(ids.iter().map(|id| self.get(id))).await
    }

    /// Report which of `ids` materialize within the timeout
    ///
    /// Returns as soon as `num_objects` are ready or the timeout elapses,
    /// whichever comes first. Already-ready objects are counted without
    /// suspending. Failure markers count as materialized.
    pub async fn wait(
        &self,
        ids: &[ObjectId],
        num_objects: usize,
        timeout_ms: u64,
    ) -> ObjectResult<Vec<bool>> {
        if num_objects > ids.len() {
            return Err(ObjectError::WaitPrecondition {
                requested: num_objects,
                provided: ids.len(),
            });
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut ready = vec![false; ids.len()];
        let mut receivers = Vec::new();
        {
            let state = self.state.read();
            for (index, id) in ids.iter().enumerate() {
                let slot = state
                    .slots
                    .get(id)
                    .ok_or_else(|| ObjectError::NotFound(id.clone()))?;
                if slot.is_ready() {
                    ready[index] = true;
                } else {
                    receivers.push((index, slot.ready_tx.subscribe()));
                }
            }
        }

        let mut ready_count = ready.iter().filter(|r| **r).count();
        if ready_count >= num_objects {
            return Ok(ready);
        }

        let mut pending: FuturesUnordered<_> = receivers
            .into_iter()
            .map(|(index, mut rx)| async move {
                match rx.wait_for(|ready| *ready).await.map(|_| ()) {
                    Ok(()) => index,
                    // A lost handle never becomes ready
                    Err(_) => std::future::pending().await,
                }
            })
            .collect();

        while ready_count < num_objects {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(index)) => {
                    ready[index] = true;
                    ready_count += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }

        Ok(ready)
    }

    /// Whether a handle exists and has materialized
    pub fn is_ready(&self, id: &ObjectId) -> bool {
        self.state
            .read()
            .slots
            .get(id)
            .map(Slot::is_ready)
            .unwrap_or(false)
    }

    /// Whether a handle is currently tracked
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.state.read().slots.contains_key(id)
    }

    /// Peek at a materialized handle without suspending
    ///
    /// Returns `None` while the handle is pending.
    pub fn try_get_materialized(&self, id: &ObjectId) -> ObjectResult<Option<Materialized>> {
        let state = self.state.read();
        let slot = state
            .slots
            .get(id)
            .ok_or_else(|| ObjectError::NotFound(id.clone()))?;
        match &slot.value {
            SlotValue::Pending => Ok(None),
            SlotValue::InMemory(payload) => Ok(Some(Materialized::Value(payload.clone()))),
            SlotValue::Failed(failure) => Ok(Some(Materialized::Failed(failure.clone()))),
            SlotValue::Spilled { .. } => {
                drop(state);
                Ok(Some(Materialized::Value(self.read_spilled(id)?)))
            }
        }
    }

    /// Current occupancy counters
    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            objects: state.slots.len(),
            pending: state
                .slots
                .values()
                .filter(|slot| !slot.is_ready())
                .count(),
            in_memory_bytes: state.used_bytes,
            spilled: state
                .slots
                .values()
                .filter(|slot| matches!(slot.value, SlotValue::Spilled { .. }))
                .count(),
        }
    }

    /// Free memory until `needed` additional bytes fit
    ///
    /// Stage one evicts refcount-zero objects; stage two spills the
    /// least-recently-touched referenced payloads when a spill directory is
    /// configured. Reclamation of unreferenced objects is lazy: it happens
    /// here, under pressure, not on the zero-count transition.
    fn make_room(&self, state: &mut StoreState, needed: usize) -> ObjectResult<()> {
        if needed > self.capacity_bytes {
            return Err(ObjectError::CapacityExceeded {
                requested: needed,
                available: self.capacity_bytes.saturating_sub(state.used_bytes),
            });
        }
        if state.used_bytes + needed <= self.capacity_bytes {
            return Ok(());
        }

        // Stage one: evict eviction-eligible objects.
        let evictable: Vec<ObjectId> = state
            .slots
            .keys()
            .filter(|id| !self.refs.is_live(id))
            .cloned()
            .collect();
        for id in evictable {
            if let Some(slot) = state.slots.remove(&id) {
                state.used_bytes -= slot.in_memory_len();
                if let Some(storage) = &self.storage {
                    let _ = storage.remove_spill(&id);
                }
                info!(object = %id, "evicted unreferenced object");
            }
            if state.used_bytes + needed <= self.capacity_bytes {
                return Ok(());
            }
        }

        // Stage two: spill cold referenced payloads.
        if let Some(storage) = &self.storage {
            loop {
                if state.used_bytes + needed <= self.capacity_bytes {
                    return Ok(());
                }
                let victim = state
                    .slots
                    .iter()
                    .filter(|(_, slot)| matches!(slot.value, SlotValue::InMemory(_)))
                    .min_by_key(|(_, slot)| slot.last_touch)
                    .map(|(id, _)| id.clone());
                let Some(id) = victim else { break };

                let Some(slot) = state.slots.get_mut(&id) else {
                    break;
                };
                let SlotValue::InMemory(payload) =
                    std::mem::replace(&mut slot.value, SlotValue::Pending)
                else {
                    break;
                };
                match storage.write_spill(&id, &payload) {
                    Ok(()) => {
                        let len = payload.len();
                        slot.value = SlotValue::Spilled { len };
                        state.used_bytes -= len;
                        info!(object = %id, bytes = len, "spilled object to disk");
                    }
                    Err(err) => {
                        warn!(object = %id, error = %err, "spill failed");
                        slot.value = SlotValue::InMemory(payload);
                        break;
                    }
                }
            }
        }

        if state.used_bytes + needed <= self.capacity_bytes {
            Ok(())
        } else {
            Err(ObjectError::CapacityExceeded {
                requested: needed,
                available: self.capacity_bytes.saturating_sub(state.used_bytes),
            })
        }
    }
}
