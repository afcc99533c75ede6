//! Task submission, dependency resolution, retries, and back-pressure
//!
//! `Call` allocates an unmaterialized result handle, enqueues the work, and
//! returns immediately; a driver future per task awaits by-reference
//! dependencies (dataflow ordering), a worker slot (resource ordering), and
//! then executes the function on the blocking pool. Application errors
//! materialize as the task's result; a panicking task function models
//! worker death and is retried up to the configured budget.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::actor::ActorManager;
use super::cluster::{ClusterView, ResourceVector};
use super::error::{TaskError, TaskFailure, TaskResult};
use super::ident::{ActorId, ObjectId, TaskId};
use super::object::{Materialized, ObjectStore, Payload};
use super::placement::{PlacementGroupScheduler, PlacementGroupState};
use super::refcount::{ArgRefGuard, ReferenceCounter};
use super::registry::{FunctionKind, FunctionRegistry, RemoteFunction};

/// One task argument: an inlined value or a by-reference dependency edge
#[derive(Debug, Clone)]
pub enum TaskArg {
    /// Inlined payload, passed through untouched
    Value(Payload),
    /// Handle to an object the task depends on
    ObjectRef(ObjectId),
}

/// Options governing a single `Call` or `CallActor`
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Resources to reserve from the cluster for the task's duration
    pub resources: ResourceVector,
    /// Placement group the task is bound to, if any
    pub placement_group: Option<super::ident::PlacementGroupId>,
    /// Infrastructure-failure retry budget (application errors never retry)
    pub max_retries: u32,
    /// Optional label for tracing
    pub name: Option<String>,
}

impl CallOptions {
    fn validate(&self) -> TaskResult<()> {
        for (name, qty) in &self.resources {
            if !qty.is_finite() || *qty < 0.0 {
                return Err(TaskError::InvalidOptions(format!(
                    "resource '{name}' has invalid quantity {qty}"
                )));
            }
        }
        Ok(())
    }
}

struct TaskSpec {
    task_id: TaskId,
    function: String,
    args: Vec<TaskArg>,
    options: CallOptions,
    result: ObjectId,
}

/// Submits remote invocations and produces future object handles
pub struct TaskDispatcher {
    store: Arc<ObjectStore>,
    refs: Arc<ReferenceCounter>,
    registry: FunctionRegistry,
    cluster: Arc<ClusterView>,
    placement: Arc<PlacementGroupScheduler>,
    actors: Arc<ActorManager>,
    slots: Arc<Semaphore>,
    nonce: AtomicU64,
}

impl TaskDispatcher {
    /// Create a dispatcher with `worker_slots` concurrently executing tasks
    pub fn new(
        store: Arc<ObjectStore>,
        refs: Arc<ReferenceCounter>,
        registry: FunctionRegistry,
        cluster: Arc<ClusterView>,
        placement: Arc<PlacementGroupScheduler>,
        actors: Arc<ActorManager>,
        worker_slots: usize,
    ) -> Self {
        Self {
            store,
            refs,
            registry,
            cluster,
            placement,
            actors,
            slots: Arc::new(Semaphore::new(worker_slots.max(1))),
            nonce: AtomicU64::new(0),
        }
    }

    /// Submit a task invocation, returning its future result handle
    ///
    /// The holder was already resolved, so the only submission-time failures
    /// are malformed options and unknown argument handles, both rejected
    /// before any scheduling side effect.
    pub fn submit(
        self: &Arc<Self>,
        function: &RemoteFunction,
        args: Vec<TaskArg>,
        options: CallOptions,
    ) -> TaskResult<ObjectId> {
        if function.kind() != FunctionKind::Task {
            return Err(TaskError::InvalidOptions(format!(
                "'{}' is not a task function",
                function.name()
            )));
        }
        options.validate()?;
        if let Some(group) = &options.placement_group
            && self.placement.state(group).is_err()
        {
            return Err(TaskError::InvalidOptions(format!(
                "unknown placement group {group}"
            )));
        }

        // Implicit holds on by-reference args, rolled back if any is unknown
        let guard = ArgRefGuard::acquire(self.refs.clone(), by_reference(&args))
            .map_err(|err| TaskError::InvalidOptions(err.to_string()))?;

        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let result = ObjectId::for_task_result(function.name(), nonce);
        self.store.register_pending(&result);

        let spec = TaskSpec {
            task_id: TaskId::fresh(),
            function: function.name().to_string(),
            args,
            options,
            result: result.clone(),
        };
        debug!(task = %spec.task_id, function = %spec.function, result = %result, "task submitted");

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.drive(spec, guard).await;
        });
        Ok(result)
    }

    /// Submit an actor method call, FIFO per actor
    ///
    /// Same contract as [`submit`](Self::submit), additionally requiring the
    /// actor to not be permanently dead; calls during a restart queue until
    /// the next incarnation is alive.
    pub fn submit_actor(
        &self,
        function: &RemoteFunction,
        actor: &ActorId,
        args: Vec<TaskArg>,
        options: CallOptions,
    ) -> super::error::Result<ObjectId> {
        self.actors.submit_call(function, actor, args, options)
    }

    async fn drive(&self, spec: TaskSpec, guard: ArgRefGuard) {
        // Placement binding: wait until the group settles
        if let Some(group) = &spec.options.placement_group {
            let Ok(mut rx) = self.placement.subscribe(group) else {
                self.finish(
                    &spec,
                    Materialized::Failed(TaskFailure::PlacementGroupRemoved(group.clone())),
                );
                return;
            };
            let settled = rx.wait_for(|state| *state != PlacementGroupState::Pending).await;
            let ready = matches!(settled.as_deref(), Ok(PlacementGroupState::Ready));
            if !ready {
                self.finish(
                    &spec,
                    Materialized::Failed(TaskFailure::PlacementGroupRemoved(group.clone())),
                );
                return;
            }
        }

        // Dataflow ordering: resolve by-reference args, propagating failures
        let mut resolved: Vec<Payload> = Vec::with_capacity(spec.args.len());
        for arg in &spec.args {
            match arg {
                TaskArg::Value(payload) => resolved.push(payload.clone()),
                TaskArg::ObjectRef(id) => match self.store.get(id).await {
                    Ok(payload) => resolved.push(payload),
                    Err(super::error::ObjectError::TaskFailed(cause)) => {
                        self.finish(
                            &spec,
                            Materialized::Failed(TaskFailure::DependencyFailed {
                                object: id.clone(),
                                cause: Box::new(cause),
                            }),
                        );
                        return;
                    }
                    Err(err) => {
                        self.finish(
                            &spec,
                            Materialized::Failed(TaskFailure::DependencyFailed {
                                object: id.clone(),
                                cause: Box::new(TaskFailure::Application {
                                    message: err.to_string(),
                                }),
                            }),
                        );
                        return;
                    }
                },
            }
        }

        // Resource ordering: a worker slot, plus cluster capacity if asked
        let Ok(_permit) = self.slots.clone().acquire_owned().await else {
            return;
        };
        let reserved = if spec.options.resources.is_empty() {
            None
        } else {
            let node = self.cluster.acquire(&spec.options.resources).await;
            Some((node, spec.options.resources.clone()))
        };

        // Cancellation: every reference was dropped before execution began
        if !self.refs.is_live(&spec.result) {
            debug!(task = %spec.task_id, "abandoning unreferenced task");
            self.store.abandon(&spec.result);
        } else {
            self.execute(&spec, resolved).await;
        }

        if let Some((node, resources)) = reserved {
            self.cluster.release(&node, &resources);
        }
        drop(guard);
    }

    async fn execute(&self, spec: &TaskSpec, args: Vec<Payload>) {
        let Some(function) = self.registry.resolve_task(&spec.function) else {
            // The snapshot is immutable, so a resolved holder cannot miss
            self.finish(
                spec,
                Materialized::Failed(TaskFailure::Application {
                    message: format!("function '{}' missing from registry", spec.function),
                }),
            );
            return;
        };

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let function = function.clone();
            let args = args.clone();
            let joined = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(AssertUnwindSafe(|| function(&args)))
            })
            .await;

            match joined {
                Ok(Ok(Ok(payload))) => {
                    self.finish(spec, Materialized::Value(payload));
                    return;
                }
                Ok(Ok(Err(app_err))) => {
                    // Application-level failure: captured, never retried
                    self.finish(
                        spec,
                        Materialized::Failed(TaskFailure::Application {
                            message: format!("{app_err:#}"),
                        }),
                    );
                    return;
                }
                Ok(Err(_)) | Err(_) => {
                    if attempts > spec.options.max_retries {
                        warn!(task = %spec.task_id, attempts, "worker died, retry budget exhausted");
                        self.finish(
                            spec,
                            Materialized::Failed(TaskFailure::WorkerDied { attempts }),
                        );
                        return;
                    }
                    warn!(task = %spec.task_id, attempts, "worker died, retrying");
                }
            }
        }
    }

    fn finish(&self, spec: &TaskSpec, outcome: Materialized) {
        match self.store.materialize(&spec.result, outcome) {
            Ok(()) => {}
            Err(super::error::ObjectError::NotFound(_)) => {
                // The result was abandoned after all references dropped
            }
            Err(super::error::ObjectError::CapacityExceeded { .. }) => {
                let _ = self.store.materialize(
                    &spec.result,
                    Materialized::Failed(TaskFailure::Application {
                        message: "object store capacity exceeded storing task result".to_string(),
                    }),
                );
            }
            Err(err) => {
                warn!(task = %spec.task_id, error = %err, "failed to materialize task result");
            }
        }
    }
}

/// Extract the by-reference argument IDs
pub(crate) fn by_reference(args: &[TaskArg]) -> Vec<ObjectId> {
    args.iter()
        .filter_map(|arg| match arg {
            TaskArg::ObjectRef(id) => Some(id.clone()),
            TaskArg::Value(_) => None,
        })
        .collect()
}
