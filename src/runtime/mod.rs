//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that coordinates all
//! subsystems and exposes the public interface for embedding or controlling
//! the runtime: object storage, reference management, task and actor
//! dispatch, and placement groups.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// Submodules
pub mod actor;
pub mod client;
pub mod cluster;
pub mod error;
pub mod ident;
pub mod object;
pub mod placement;
pub mod refcount;
pub mod registry;
pub mod service;
pub mod storage;
pub mod task;

use actor::{ActorInfo, ActorManager, ActorOptions, ActorState};
use cluster::{ClusterView, NodeSnapshot, NodeSpec};
use error::Result;
use ident::{ActorId, NodeId, ObjectId, PlacementGroupId};
use object::{ObjectStore, Payload, StoreStats};
use placement::{
    PlacementGroupInfo, PlacementGroupOptions, PlacementGroupScheduler, PlacementGroupState,
};
use refcount::ReferenceCounter;
use registry::{FunctionCatalog, FunctionRegistry, RemoteFunction};
use storage::Storage;
use task::{CallOptions, TaskArg, TaskDispatcher};

/// Configuration for the Ensemble runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root directory for runtime storage (config, spill area)
    pub root: PathBuf,

    /// Object store memory capacity in bytes
    pub store_capacity_bytes: usize,

    /// Whether cold referenced objects spill to disk under pressure
    pub spill_enabled: bool,

    /// Concurrently executing tasks
    pub worker_slots: usize,

    /// Default infrastructure-failure retry budget for tasks
    pub default_max_retries: u32,

    /// Cluster nodes; empty means one local node sized by `worker_slots`
    pub nodes: Vec<NodeSpec>,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".ensemble"),
            store_capacity_bytes: 256 * 1024 * 1024,
            spill_enabled: true,
            worker_slots: 4,
            default_max_retries: 0,
            nodes: Vec::new(),
            debug: false,
        }
    }
}

/// Point-in-time status of a runtime, for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Crate version
    pub version: String,
    /// Object store occupancy
    pub store: StoreStats,
    /// Known actors
    pub actors: Vec<ActorInfo>,
    /// Known placement groups
    pub placement_groups: Vec<PlacementGroupInfo>,
    /// Cluster capacity snapshot
    pub nodes: Vec<NodeSnapshot>,
}

/// The main runtime orchestrator
///
/// Owns every subsystem and wires them together: the object store and the
/// reference counter collaborate through ID-keyed lookups, the dispatcher
/// and actor manager share the store, and placement reservations run on a
/// background loop for the lifetime of the runtime.
pub struct Runtime {
    config: RuntimeConfig,
    refs: Arc<ReferenceCounter>,
    store: Arc<ObjectStore>,
    registry: FunctionRegistry,
    cluster: Arc<ClusterView>,
    placement: Arc<PlacementGroupScheduler>,
    actors: Arc<ActorManager>,
    dispatcher: Arc<TaskDispatcher>,
    placement_loop: tokio::task::JoinHandle<()>,
}

impl Runtime {
    /// Create a new runtime with the given configuration
    ///
    /// Snapshots the global function catalog; functions registered after
    /// this point are invisible to this runtime.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let spill = if config.spill_enabled {
            storage::init_storage(&config.root)?;
            Some(Storage::new(config.root.clone()))
        } else {
            None
        };

        let refs = Arc::new(ReferenceCounter::new());
        let store = Arc::new(ObjectStore::new(
            config.store_capacity_bytes,
            refs.clone(),
            spill,
        ));

        let nodes = if config.nodes.is_empty() {
            vec![NodeSpec {
                id: NodeId::local(),
                resources: cluster::resources(&[("CPU", config.worker_slots as f64)]),
            }]
        } else {
            config.nodes.clone()
        };
        let cluster = Arc::new(ClusterView::new(nodes));

        let placement = Arc::new(PlacementGroupScheduler::new(cluster.clone()));
        let placement_loop = placement.spawn_reservation_loop();

        let registry = FunctionCatalog::global().snapshot();
        let actors = ActorManager::new(
            store.clone(),
            refs.clone(),
            registry.clone(),
            cluster.clone(),
            placement.clone(),
        );
        let dispatcher = Arc::new(TaskDispatcher::new(
            store.clone(),
            refs.clone(),
            registry.clone(),
            cluster.clone(),
            placement.clone(),
            actors.clone(),
            config.worker_slots,
        ));

        Ok(Self {
            config,
            refs,
            store,
            registry,
            cluster,
            placement,
            actors,
            dispatcher,
            placement_loop,
        })
    }

    /// Initialize runtime storage directories and persist the configuration
    pub fn init(config: RuntimeConfig) -> Result<()> {
        storage::init_storage(&config.root)?;
        storage::write_config(&config)?;
        Ok(())
    }

    /// Load an existing runtime from a persisted configuration
    pub fn load(root: PathBuf) -> Result<Self> {
        let config = storage::load_config(&root)?;
        Self::new(config)
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ===== Object store =====

    /// Store a payload, returning a fresh handle holding one local reference
    pub fn put(&self, payload: Payload) -> Result<ObjectId> {
        Ok(self.store.put(payload)?)
    }

    /// Retrieve a payload, suspending until it materializes
    pub async fn get(&self, id: &ObjectId) -> Result<Payload> {
        Ok(self.store.get(id).await?)
    }

    /// Batched retrieval preserving input order; failures surface per element
    pub async fn get_many(&self, ids: &[ObjectId]) -> Vec<Result<Payload>> {
        self.store
            .get_many(ids)
            .await
            .into_iter()
            .map(|result| result.map_err(Into::into))
            .collect()
    }

    /// Report which of `ids` materialize within the timeout
    pub async fn wait(
        &self,
        ids: &[ObjectId],
        num_objects: usize,
        timeout_ms: u64,
    ) -> Result<Vec<bool>> {
        Ok(self.store.wait(ids, num_objects, timeout_ms).await?)
    }

    // ===== Reference counting =====

    /// Add a local reference to a handle
    pub fn add_local_reference(&self, id: &ObjectId) -> Result<()> {
        Ok(self.refs.add_local(id)?)
    }

    /// Remove a local reference; the handle becomes eviction-eligible when
    /// the last holder lets go
    pub fn remove_local_reference(&self, id: &ObjectId) -> Result<()> {
        self.refs.remove_local(id)?;
        Ok(())
    }

    // ===== Tasks =====

    /// Resolve a registered task function, failing fast if unknown
    pub fn task_function(&self, name: &str) -> Result<RemoteFunction> {
        Ok(RemoteFunction::task(name, &self.registry)?)
    }

    /// Resolve a registered actor constructor, failing fast if unknown
    pub fn actor_constructor(&self, name: &str) -> Result<RemoteFunction> {
        Ok(RemoteFunction::actor_constructor(name, &self.registry)?)
    }

    /// Resolve a registered actor method, failing fast if unknown
    pub fn actor_method(&self, name: &str) -> Result<RemoteFunction> {
        Ok(RemoteFunction::actor_method(name, &self.registry)?)
    }

    /// Submit a task invocation, returning its future result handle
    pub fn call(
        &self,
        function: &RemoteFunction,
        args: Vec<TaskArg>,
        options: CallOptions,
    ) -> Result<ObjectId> {
        Ok(self.dispatcher.submit(function, args, options)?)
    }

    /// Submit an actor method call; FIFO per actor
    pub fn call_actor(
        &self,
        function: &RemoteFunction,
        actor: &ActorId,
        args: Vec<TaskArg>,
        options: CallOptions,
    ) -> Result<ObjectId> {
        self.dispatcher.submit_actor(function, actor, args, options)
    }

    // ===== Actors =====

    /// Create an actor and return its handle immediately
    pub fn create_actor(
        &self,
        function: &RemoteFunction,
        args: Vec<TaskArg>,
        options: ActorOptions,
    ) -> Result<ActorId> {
        self.actors.create_actor(function, args, options)
    }

    /// Look up a named actor in the global or job-local namespace
    pub fn get_actor_id(&self, global: bool, name: &str) -> Result<ActorId> {
        self.actors.get_actor_id(global, name)
    }

    /// Terminate an actor, optionally allowing restart
    pub fn kill_actor(&self, actor: &ActorId, no_restart: bool) -> Result<()> {
        self.actors.kill(actor, no_restart)
    }

    /// Current liveness state of an actor
    pub fn actor_state(&self, actor: &ActorId) -> Result<ActorState> {
        self.actors.state(actor)
    }

    // ===== Placement groups =====

    /// Reserve a placement group asynchronously, returning a pending handle
    pub fn create_placement_group(
        &self,
        options: PlacementGroupOptions,
    ) -> Result<PlacementGroupId> {
        Ok(self.placement.create(options)?)
    }

    /// Block until the group is ready or the timeout elapses
    pub async fn wait_placement_group_ready(
        &self,
        id: &PlacementGroupId,
        timeout_seconds: u64,
    ) -> Result<bool> {
        Ok(self.placement.wait_ready(id, timeout_seconds).await?)
    }

    /// Release a group's reservations; pending bound work fails
    pub fn remove_placement_group(&self, id: &PlacementGroupId) -> Result<()> {
        Ok(self.placement.remove(id)?)
    }

    /// Current lifecycle state of a placement group
    pub fn placement_group_state(&self, id: &PlacementGroupId) -> Result<PlacementGroupState> {
        Ok(self.placement.state(id)?)
    }

    // ===== Introspection =====

    /// Point-in-time status for the control plane
    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            version: crate::VERSION.to_string(),
            store: self.store.stats(),
            actors: self.actors.list(),
            placement_groups: self.placement.list(),
            nodes: self.cluster.snapshot(),
        }
    }

    /// Get the object store
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Get the reference counter
    pub fn refs(&self) -> &Arc<ReferenceCounter> {
        &self.refs
    }

    /// Get this runtime's immutable function registry snapshot
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Get the cluster view
    pub fn cluster(&self) -> &Arc<ClusterView> {
        &self.cluster
    }

    /// Get the placement group scheduler
    pub fn placement(&self) -> &Arc<PlacementGroupScheduler> {
        &self.placement
    }

    /// Get the actor manager
    pub fn actors(&self) -> &Arc<ActorManager> {
        &self.actors
    }

    /// Stop background work: kills all actors and the reservation loop
    pub fn shutdown(&self) {
        self.actors.kill_all();
        self.placement_loop.abort();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.placement_loop.abort();
    }
}

// Re-export commonly used types
pub use actor::{ActorBehavior, ActorContext};
pub use error::{Result as RuntimeResult, RuntimeError, TaskFailure};
pub use object::Materialized;
