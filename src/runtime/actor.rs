//! Actor lifecycle, addressing, and FIFO method dispatch
//!
//! An actor is a stateful behavior instance addressed by a logical ID.
//! Method calls enqueue onto a per-actor mailbox and execute strictly in
//! submission order, one at a time. A kill with restart budget remaining
//! moves the actor through `Restarting` into a fresh incarnation that
//! reuses the logical ID under the next generation; queued calls survive
//! the restart, while the in-flight call fails. Results produced by a
//! killed incarnation are dropped rather than delivered, so callers never
//! observe stale-generation responses.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cluster::{ClusterView, ResourceVector};
use super::error::{ActorError, Result, RuntimeError, TaskError, TaskFailure};
use super::ident::{ActorId, Generation, ObjectId, PlacementGroupId};
use super::object::{Materialized, ObjectStore, Payload};
use super::placement::{PlacementGroupScheduler, PlacementGroupState};
use super::refcount::{ArgRefGuard, ReferenceCounter};
use super::registry::{ActorCtorFn, FunctionKind, FunctionRegistry, RemoteFunction};
use super::task::{TaskArg, by_reference};

/// Behavior of one actor type
///
/// `invoke` dispatches a method by name. Returning `Err` is an
/// application-level failure delivered on the call's result object; a
/// panic models a crash of the actor's worker process and consumes restart
/// budget.
pub trait ActorBehavior: Send {
    /// Execute one method call against the actor's state
    fn invoke(
        &mut self,
        ctx: &mut ActorContext,
        method: &str,
        args: &[Payload],
    ) -> anyhow::Result<Payload>;
}

/// Execution context handed to every invocation
///
/// Only the actor's own code sees this; it is how an actor observes its
/// restart history and requests its own terminal exit.
pub struct ActorContext {
    actor_id: ActorId,
    generation: Generation,
    restarted: bool,
    exit_requested: bool,
}

impl ActorContext {
    fn new(actor_id: ActorId, generation: Generation, restarted: bool) -> Self {
        Self {
            actor_id,
            generation,
            restarted,
            exit_requested: false,
        }
    }

    /// The logical ID of this actor
    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// The generation of this physical incarnation
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether this incarnation is a restart of a previously failed one
    pub fn was_restarted(&self) -> bool {
        self.restarted
    }

    /// Request terminal exit, honored after the current call returns
    ///
    /// Equivalent to a kill with `no_restart = true`, without requiring
    /// caller permission.
    pub fn exit(&mut self) {
        self.exit_requested = true;
    }
}

/// Liveness state of a logical actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorState {
    /// Accepting and executing calls
    Alive,
    /// Between incarnations; calls queue until alive again
    Restarting,
    /// Permanently terminated; calls are rejected
    Dead,
}

/// Creation options for an actor
#[derive(Debug, Clone)]
pub struct ActorOptions {
    /// Register the actor under this name
    pub name: Option<String>,
    /// Use the cluster-wide namespace instead of the job-local one
    pub global: bool,
    /// How many restarts the actor may consume before staying dead
    pub max_restarts: u32,
    /// Method concurrency; only `1` (strict FIFO) is supported
    pub max_concurrency: u32,
    /// Placement group whose reservation hosts the actor, if any
    pub placement_group: Option<PlacementGroupId>,
    /// Worker resources to reserve for the actor's lifetime
    pub resources: ResourceVector,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            name: None,
            global: false,
            max_restarts: 0,
            max_concurrency: 1,
            placement_group: None,
            resources: ResourceVector::new(),
        }
    }
}

/// Status summary of one actor
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActorInfo {
    /// Logical actor ID
    pub id: ActorId,
    /// Registered name, if any
    pub name: Option<String>,
    /// Constructor type name
    pub type_name: String,
    /// Current liveness state
    pub state: ActorState,
    /// Current generation
    pub generation: Generation,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

struct Envelope {
    method: String,
    args: Vec<TaskArg>,
    result: ObjectId,
    guard: ArgRefGuard,
}

struct ActorRecord {
    type_name: String,
    options: ActorOptions,
    state: ActorState,
    generation: Generation,
    restarts_remaining: u32,
    mailbox: mpsc::UnboundedSender<Envelope>,
    kill: mpsc::UnboundedSender<bool>,
    created_at: DateTime<Utc>,
}

enum IncarnationEnd {
    Killed { no_restart: bool },
    Crashed,
    Exited,
    Closed,
}

/// Creates, addresses, and tears down stateful actors
pub struct ActorManager {
    store: Arc<ObjectStore>,
    refs: Arc<ReferenceCounter>,
    registry: FunctionRegistry,
    cluster: Arc<ClusterView>,
    placement: Arc<PlacementGroupScheduler>,
    actors: Mutex<HashMap<ActorId, ActorRecord>>,
    named: Mutex<HashMap<(bool, String), ActorId>>,
    nonce: AtomicU64,
}

impl ActorManager {
    /// Create a manager wired to the runtime's shared components
    pub fn new(
        store: Arc<ObjectStore>,
        refs: Arc<ReferenceCounter>,
        registry: FunctionRegistry,
        cluster: Arc<ClusterView>,
        placement: Arc<PlacementGroupScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            refs,
            registry,
            cluster,
            placement,
            actors: Mutex::new(HashMap::new()),
            named: Mutex::new(HashMap::new()),
            nonce: AtomicU64::new(0),
        })
    }

    /// Allocate an actor, spawn its driver, and return its handle
    ///
    /// Returns immediately; construction happens asynchronously, and the
    /// first call serializes behind it.
    pub fn create_actor(
        self: &Arc<Self>,
        function: &RemoteFunction,
        args: Vec<TaskArg>,
        options: ActorOptions,
    ) -> Result<ActorId> {
        if function.kind() != FunctionKind::ActorConstructor {
            return Err(TaskError::InvalidOptions(format!(
                "'{}' is not an actor constructor",
                function.name()
            ))
            .into());
        }
        let ctor: ActorCtorFn = self
            .registry
            .resolve_actor_ctor(function.name())
            .ok_or_else(|| TaskError::FunctionNotRegistered(function.name().to_string()))?;
        if options.max_concurrency != 1 {
            return Err(TaskError::InvalidOptions(
                "only max_concurrency = 1 (strict FIFO) is supported".to_string(),
            )
            .into());
        }
        for (name, qty) in &options.resources {
            if !qty.is_finite() || *qty < 0.0 {
                return Err(TaskError::InvalidOptions(format!(
                    "resource '{name}' has invalid quantity {qty}"
                ))
                .into());
            }
        }
        if let Some(group) = &options.placement_group
            && self.placement.state(group).is_err()
        {
            return Err(
                TaskError::InvalidOptions(format!("unknown placement group {group}")).into(),
            );
        }

        let guard = ArgRefGuard::acquire(self.refs.clone(), by_reference(&args))
            .map_err(RuntimeError::RefCount)?;

        let id = ActorId::fresh();
        if let Some(name) = &options.name {
            let mut named = self.named.lock();
            let key = (options.global, name.clone());
            if named.contains_key(&key) {
                return Err(TaskError::InvalidOptions(format!(
                    "actor name '{name}' is already taken"
                ))
                .into());
            }
            named.insert(key, id.clone());
        }

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let record = ActorRecord {
            type_name: function.name().to_string(),
            options: options.clone(),
            state: ActorState::Alive,
            generation: Generation::zero(),
            restarts_remaining: options.max_restarts,
            mailbox: mailbox_tx,
            kill: kill_tx,
            created_at: Utc::now(),
        };
        self.actors.lock().insert(id.clone(), record);
        info!(actor = %id, type_name = %function.name(), "actor created");

        let driver = ActorDriver {
            manager: Arc::downgrade(self),
            store: self.store.clone(),
            cluster: self.cluster.clone(),
            placement: self.placement.clone(),
            id: id.clone(),
            ctor,
            ctor_args: args,
            options,
        };
        tokio::spawn(driver.run(mailbox_rx, kill_rx, guard));
        Ok(id)
    }

    /// Enqueue a method call, FIFO per actor
    ///
    /// Calls against a `Restarting` actor queue until the next incarnation
    /// is alive; calls against a `Dead` actor are rejected. Resource and
    /// placement options are ignored: actor calls run wherever the actor's
    /// worker was reserved at creation.
    pub fn submit_call(
        &self,
        function: &RemoteFunction,
        actor: &ActorId,
        args: Vec<TaskArg>,
        _options: super::task::CallOptions,
    ) -> Result<ObjectId> {
        if function.kind() != FunctionKind::ActorMethod {
            return Err(TaskError::InvalidOptions(format!(
                "'{}' is not an actor method",
                function.name()
            ))
            .into());
        }
        let mailbox = {
            let actors = self.actors.lock();
            let record = actors
                .get(actor)
                .ok_or_else(|| ActorError::UnknownActor(actor.clone()))?;
            if record.state == ActorState::Dead {
                return Err(ActorError::Dead(actor.clone()).into());
            }
            record.mailbox.clone()
        };

        let guard = ArgRefGuard::acquire(self.refs.clone(), by_reference(&args))
            .map_err(RuntimeError::RefCount)?;

        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let result = ObjectId::for_task_result(&format!("{actor}.{}", function.name()), nonce);
        self.store.register_pending(&result);

        let envelope = Envelope {
            method: function.name().to_string(),
            args,
            result: result.clone(),
            guard,
        };
        if mailbox.send(envelope).is_err() {
            // The driver exited between the state check and the send
            self.store.abandon(&result);
            let _ = self.refs.remove_local(&result);
            return Err(ActorError::Dead(actor.clone()).into());
        }
        debug!(actor = %actor, method = %function.name(), result = %result, "actor call queued");
        Ok(result)
    }

    /// Look up a named actor in the global or job-local namespace
    pub fn get_actor_id(&self, global: bool, name: &str) -> Result<ActorId> {
        self.named
            .lock()
            .get(&(global, name.to_string()))
            .cloned()
            .ok_or_else(|| ActorError::NotFound(name.to_string()).into())
    }

    /// Terminate an actor
    ///
    /// With `no_restart = false` and budget remaining, the actor restarts
    /// under the next generation; otherwise it transitions to `Dead`.
    /// Killing a dead actor is a no-op.
    pub fn kill(&self, actor: &ActorId, no_restart: bool) -> Result<()> {
        let actors = self.actors.lock();
        let record = actors
            .get(actor)
            .ok_or_else(|| ActorError::UnknownActor(actor.clone()))?;
        if record.state == ActorState::Dead {
            return Ok(());
        }
        info!(actor = %actor, no_restart, "kill requested");
        let _ = record.kill.send(no_restart);
        Ok(())
    }

    /// Current liveness state of an actor
    pub fn state(&self, actor: &ActorId) -> Result<ActorState> {
        self.actors
            .lock()
            .get(actor)
            .map(|record| record.state)
            .ok_or_else(|| ActorError::UnknownActor(actor.clone()).into())
    }

    /// Status summaries for all known actors
    pub fn list(&self) -> Vec<ActorInfo> {
        self.actors
            .lock()
            .iter()
            .map(|(id, record)| ActorInfo {
                id: id.clone(),
                name: record.options.name.clone(),
                type_name: record.type_name.clone(),
                state: record.state,
                generation: record.generation,
                created_at: record.created_at,
            })
            .collect()
    }

    /// Kill every non-dead actor without restart (runtime shutdown)
    pub fn kill_all(&self) {
        let actors = self.actors.lock();
        for record in actors.values() {
            if record.state != ActorState::Dead {
                let _ = record.kill.send(true);
            }
        }
    }

    fn set_state(&self, actor: &ActorId, state: ActorState, generation: Generation) {
        let mut actors = self.actors.lock();
        if let Some(record) = actors.get_mut(actor) {
            record.state = state;
            record.generation = generation;
        }
    }

    /// Consume one unit of restart budget, moving the actor to `Restarting`
    fn try_consume_restart(&self, actor: &ActorId) -> bool {
        let mut actors = self.actors.lock();
        let Some(record) = actors.get_mut(actor) else {
            return false;
        };
        if record.restarts_remaining == 0 {
            return false;
        }
        record.restarts_remaining -= 1;
        record.state = ActorState::Restarting;
        true
    }

    fn unregister_name(&self, options: &ActorOptions) {
        if let Some(name) = &options.name {
            self.named.lock().remove(&(options.global, name.clone()));
        }
    }
}

struct ActorDriver {
    manager: Weak<ActorManager>,
    store: Arc<ObjectStore>,
    cluster: Arc<ClusterView>,
    placement: Arc<PlacementGroupScheduler>,
    id: ActorId,
    ctor: ActorCtorFn,
    ctor_args: Vec<TaskArg>,
    options: ActorOptions,
}

impl ActorDriver {
    async fn run(
        self,
        mut mailbox: mpsc::UnboundedReceiver<Envelope>,
        mut kill: mpsc::UnboundedReceiver<bool>,
        ctor_guard: ArgRefGuard,
    ) {
        // Placement binding: the actor's worker lives on the group's
        // reservation, so creation waits for the group to settle.
        if let Some(group) = &self.options.placement_group {
            let ready = match self.placement.subscribe(group) {
                Ok(mut rx) => {
                    let settled = rx
                        .wait_for(|state| *state != PlacementGroupState::Pending)
                        .await;
                    matches!(settled.as_deref(), Ok(PlacementGroupState::Ready))
                }
                Err(_) => false,
            };
            if !ready {
                warn!(actor = %self.id, group = %group, "placement group unavailable, actor dead");
                self.finalize_dead(&mut mailbox).await;
                drop(ctor_guard);
                return;
            }
        }

        let reserved = if self.options.resources.is_empty() {
            None
        } else {
            let node = self.cluster.acquire(&self.options.resources).await;
            Some(node)
        };

        let mut generation = Generation::zero();
        let mut restarted = false;
        loop {
            let Ok(args) = resolve_args(&self.store, &self.ctor_args).await else {
                warn!(actor = %self.id, "constructor arguments unavailable, actor dead");
                break;
            };
            let ctor = self.ctor.clone();
            let built = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(AssertUnwindSafe(|| ctor(&args)))
            })
            .await;
            let behavior = match built {
                Ok(Ok(Ok(behavior))) => behavior,
                _ => {
                    warn!(actor = %self.id, %generation, "actor constructor failed");
                    if self.consume_restart() {
                        generation = generation.next();
                        restarted = true;
                        continue;
                    }
                    break;
                }
            };

            self.set_state(ActorState::Alive, generation);
            info!(actor = %self.id, %generation, restarted, "actor alive");
            let ctx = ActorContext::new(self.id.clone(), generation, restarted);

            match self
                .run_incarnation(behavior, ctx, &mut mailbox, &mut kill)
                .await
            {
                IncarnationEnd::Killed { no_restart: false } | IncarnationEnd::Crashed => {
                    if self.consume_restart() {
                        info!(actor = %self.id, %generation, "actor restarting");
                        generation = generation.next();
                        restarted = true;
                        continue;
                    }
                    break;
                }
                IncarnationEnd::Killed { no_restart: true } | IncarnationEnd::Exited => break,
                IncarnationEnd::Closed => {
                    drop(ctor_guard);
                    return;
                }
            }
        }

        if let Some(node) = reserved {
            self.cluster.release(&node, &self.options.resources);
        }
        self.finalize_dead(&mut mailbox).await;
        drop(ctor_guard);
    }

    /// Process the mailbox until this incarnation ends
    async fn run_incarnation(
        &self,
        mut behavior: Box<dyn ActorBehavior>,
        mut ctx: ActorContext,
        mailbox: &mut mpsc::UnboundedReceiver<Envelope>,
        kill: &mut mpsc::UnboundedReceiver<bool>,
    ) -> IncarnationEnd {
        loop {
            let envelope = tokio::select! {
                biased;
                signal = kill.recv() => {
                    return match signal {
                        Some(no_restart) => IncarnationEnd::Killed { no_restart },
                        None => IncarnationEnd::Closed,
                    };
                }
                envelope = mailbox.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return IncarnationEnd::Closed,
                },
            };
            let Envelope {
                method,
                args,
                result,
                guard,
            } = envelope;

            // Dependency resolution can suspend; kills preempt it
            let resolved = tokio::select! {
                biased;
                signal = kill.recv() => {
                    self.fail_call(&result, self.kill_failure(signal.unwrap_or(true)));
                    drop(guard);
                    return match signal {
                        Some(no_restart) => IncarnationEnd::Killed { no_restart },
                        None => IncarnationEnd::Closed,
                    };
                }
                resolved = resolve_args(&self.store, &args) => resolved,
            };
            let args = match resolved {
                Ok(args) => args,
                Err(failure) => {
                    self.fail_call(&result, failure);
                    drop(guard);
                    continue;
                }
            };

            let method_name = method.clone();
            let invocation = tokio::task::spawn_blocking(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    behavior.invoke(&mut ctx, &method, &args)
                }));
                (behavior, ctx, outcome)
            });

            tokio::select! {
                biased;
                signal = kill.recv() => {
                    // The invocation's outcome belongs to a killed
                    // generation; drop it and fail the in-flight call.
                    self.fail_call(&result, self.kill_failure(signal.unwrap_or(true)));
                    drop(guard);
                    return match signal {
                        Some(no_restart) => IncarnationEnd::Killed { no_restart },
                        None => IncarnationEnd::Closed,
                    };
                }
                joined = invocation => {
                    match joined {
                        Ok((returned, returned_ctx, Ok(Ok(payload)))) => {
                            behavior = returned;
                            ctx = returned_ctx;
                            self.deliver(&result, payload);
                        }
                        Ok((returned, returned_ctx, Ok(Err(app_err)))) => {
                            behavior = returned;
                            ctx = returned_ctx;
                            self.fail_call(&result, TaskFailure::Application {
                                message: format!("{app_err:#}"),
                            });
                        }
                        Ok((_, _, Err(_))) | Err(_) => {
                            // The actor's worker crashed mid-call
                            warn!(actor = %self.id, method = %method_name, "actor crashed during call");
                            self.fail_call(&result, self.kill_failure(false));
                            drop(guard);
                            return IncarnationEnd::Crashed;
                        }
                    }
                    drop(guard);
                    if ctx.exit_requested {
                        info!(actor = %self.id, "actor exited voluntarily");
                        return IncarnationEnd::Exited;
                    }
                }
            }
        }
    }

    /// Failure delivered to calls interrupted by a kill or crash
    fn kill_failure(&self, no_restart: bool) -> TaskFailure {
        let will_restart = !no_restart && self.restart_budget_remains();
        if will_restart {
            TaskFailure::ActorRestarting(self.id.clone())
        } else {
            TaskFailure::ActorDead(self.id.clone())
        }
    }

    fn restart_budget_remains(&self) -> bool {
        self.manager
            .upgrade()
            .map(|manager| {
                manager
                    .actors
                    .lock()
                    .get(&self.id)
                    .map(|record| record.restarts_remaining > 0)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn fail_call(&self, result: &ObjectId, failure: TaskFailure) {
        let _ = self
            .store
            .materialize(result, Materialized::Failed(failure));
    }

    fn deliver(&self, result: &ObjectId, payload: Payload) {
        match self.store.materialize(result, Materialized::Value(payload)) {
            Ok(()) => {}
            Err(super::error::ObjectError::CapacityExceeded { .. }) => {
                self.fail_call(
                    result,
                    TaskFailure::Application {
                        message: "object store capacity exceeded storing call result".to_string(),
                    },
                );
            }
            Err(_) => {}
        }
    }

    fn consume_restart(&self) -> bool {
        self.manager
            .upgrade()
            .map(|manager| manager.try_consume_restart(&self.id))
            .unwrap_or(false)
    }

    fn set_state(&self, state: ActorState, generation: Generation) {
        if let Some(manager) = self.manager.upgrade() {
            manager.set_state(&self.id, state, generation);
        }
    }

    /// Mark the actor dead, unregister its name, and drain queued calls
    async fn finalize_dead(&self, mailbox: &mut mpsc::UnboundedReceiver<Envelope>) {
        if let Some(manager) = self.manager.upgrade() {
            let generation = manager
                .actors
                .lock()
                .get(&self.id)
                .map(|record| record.generation)
                .unwrap_or_default();
            manager.set_state(&self.id, ActorState::Dead, generation);
            let options = manager
                .actors
                .lock()
                .get(&self.id)
                .map(|record| record.options.clone());
            if let Some(options) = options {
                manager.unregister_name(&options);
            }
        }
        info!(actor = %self.id, "actor dead");

        mailbox.close();
        while let Some(envelope) = mailbox.recv().await {
            self.fail_call(&envelope.result, TaskFailure::ActorDead(self.id.clone()));
            drop(envelope.guard);
        }
    }
}

/// Resolve task args into payloads, mapping failures to dependency markers
async fn resolve_args(
    store: &ObjectStore,
    args: &[TaskArg],
) -> std::result::Result<Vec<Payload>, TaskFailure> {
    let mut resolved = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            TaskArg::Value(payload) => resolved.push(payload.clone()),
            TaskArg::ObjectRef(id) => match store.get(id).await {
                Ok(payload) => resolved.push(payload),
                Err(super::error::ObjectError::TaskFailed(cause)) => {
                    return Err(TaskFailure::DependencyFailed {
                        object: id.clone(),
                        cause: Box::new(cause),
                    });
                }
                Err(err) => {
                    return Err(TaskFailure::DependencyFailed {
                        object: id.clone(),
                        cause: Box::new(TaskFailure::Application {
                            message: err.to_string(),
                        }),
                    });
                }
            },
        }
    }
    Ok(resolved)
}
