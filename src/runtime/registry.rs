//! Function registration and fail-fast remote-function resolution
//!
//! Provides a global catalog for registering task functions, actor
//! constructors, and actor method names prior to runtime startup. Each
//! runtime clones an immutable snapshot of the catalog, so registration
//! after startup never changes what a running runtime can resolve.
//!
//! A [`RemoteFunction`] resolves its name against a snapshot at
//! construction time and fails fast if the name was never registered; this
//! is a precondition check that happens before any scheduling side effect.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::actor::ActorBehavior;
use super::error::{TaskError, TaskResult};
use super::object::Payload;

/// Task entry point: opaque argument payloads in, one payload out
///
/// An `Err` return is an application-level failure and materializes as the
/// task's result. A panic models worker death and is subject to retries.
pub type TaskFn = Arc<dyn Fn(&[Payload]) -> anyhow::Result<Payload> + Send + Sync>;

/// Actor constructor: builds the behavior instance for a new incarnation
pub type ActorCtorFn =
    Arc<dyn Fn(&[Payload]) -> anyhow::Result<Box<dyn ActorBehavior>> + Send + Sync>;

#[derive(Default)]
struct CatalogInner {
    tasks: HashMap<String, TaskFn>,
    actor_ctors: HashMap<String, ActorCtorFn>,
    actor_methods: HashSet<String>,
}

/// Global catalog of registered functions.
pub struct FunctionCatalog {
    inner: RwLock<CatalogInner>,
}

static CATALOG: Lazy<FunctionCatalog> = Lazy::new(FunctionCatalog::new);

impl FunctionCatalog {
    fn new() -> Self {
        Self {
            inner: RwLock::new(CatalogInner::default()),
        }
    }

    /// Access the global catalog singleton.
    pub fn global() -> &'static Self {
        &CATALOG
    }

    /// Register a task function under a stable name.
    pub fn register_task<F>(&self, name: &str, function: F)
    where
        F: Fn(&[Payload]) -> anyhow::Result<Payload> + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        inner.tasks.insert(name.to_string(), Arc::new(function));
    }

    /// Register an actor type: a constructor plus its callable method names.
    pub fn register_actor<F>(&self, type_name: &str, ctor: F, methods: &[&str])
    where
        F: Fn(&[Payload]) -> anyhow::Result<Box<dyn ActorBehavior>> + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        inner
            .actor_ctors
            .insert(type_name.to_string(), Arc::new(ctor));
        for method in methods {
            inner.actor_methods.insert((*method).to_string());
        }
    }

    /// Produce an immutable snapshot for a runtime instance.
    pub fn snapshot(&self) -> FunctionRegistry {
        let inner = self.inner.read();
        FunctionRegistry {
            inner: Arc::new(CatalogInner {
                tasks: inner.tasks.clone(),
                actor_ctors: inner.actor_ctors.clone(),
                actor_methods: inner.actor_methods.clone(),
            }),
        }
    }
}

/// Immutable runtime view of the function catalog.
#[derive(Clone)]
pub struct FunctionRegistry {
    inner: Arc<CatalogInner>,
}

impl FunctionRegistry {
    /// An empty registry, for runtimes that only store objects.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(CatalogInner::default()),
        }
    }

    /// Look up a task function by name.
    pub fn resolve_task(&self, name: &str) -> Option<TaskFn> {
        self.inner.tasks.get(name).cloned()
    }

    /// Look up an actor constructor by type name.
    pub fn resolve_actor_ctor(&self, name: &str) -> Option<ActorCtorFn> {
        self.inner.actor_ctors.get(name).cloned()
    }

    /// Whether `name` is registered in any role.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.tasks.contains_key(name)
            || self.inner.actor_ctors.contains_key(name)
            || self.inner.actor_methods.contains(name)
    }

    /// Whether `name` is a registered actor method.
    pub fn is_actor_method(&self, name: &str) -> bool {
        self.inner.actor_methods.contains(name)
    }

    /// List all registered task names.
    pub fn list_tasks(&self) -> Vec<String> {
        self.inner.tasks.keys().cloned().collect()
    }

    /// List all registered actor type names.
    pub fn list_actor_types(&self) -> Vec<String> {
        self.inner.actor_ctors.keys().cloned().collect()
    }
}

/// Role a [`RemoteFunction`] was resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// A stateless task function
    Task,
    /// An actor constructor
    ActorConstructor,
    /// An actor method
    ActorMethod,
}

/// A registered function, resolved once at call-construction time
///
/// Construction is the only failure point for unregistered names; a
/// successfully constructed holder never fails resolution again.
#[derive(Debug, Clone)]
pub struct RemoteFunction {
    name: String,
    kind: FunctionKind,
}

impl RemoteFunction {
    /// Resolve a task function, failing fast if unregistered.
    pub fn task(name: &str, registry: &FunctionRegistry) -> TaskResult<Self> {
        if registry.resolve_task(name).is_some() {
            Ok(Self {
                name: name.to_string(),
                kind: FunctionKind::Task,
            })
        } else {
            Err(TaskError::FunctionNotRegistered(name.to_string()))
        }
    }

    /// Resolve an actor constructor, failing fast if unregistered.
    pub fn actor_constructor(name: &str, registry: &FunctionRegistry) -> TaskResult<Self> {
        if registry.resolve_actor_ctor(name).is_some() {
            Ok(Self {
                name: name.to_string(),
                kind: FunctionKind::ActorConstructor,
            })
        } else if registry.contains(name) {
            Err(TaskError::NotAnActorConstructor(name.to_string()))
        } else {
            Err(TaskError::FunctionNotRegistered(name.to_string()))
        }
    }

    /// Resolve an actor method, failing fast if unregistered.
    pub fn actor_method(name: &str, registry: &FunctionRegistry) -> TaskResult<Self> {
        if registry.is_actor_method(name) {
            Ok(Self {
                name: name.to_string(),
                kind: FunctionKind::ActorMethod,
            })
        } else if registry.contains(name) {
            Err(TaskError::NotAnActorMethod(name.to_string()))
        } else {
            Err(TaskError::FunctionNotRegistered(name.to_string()))
        }
    }

    /// The registered function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The role this holder was resolved for.
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_function_fails_at_construction() {
        let registry = FunctionRegistry::empty();
        let err = RemoteFunction::task("nope", &registry).unwrap_err();
        assert!(matches!(err, TaskError::FunctionNotRegistered(_)));
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let catalog = FunctionCatalog::new();
        catalog.register_task("before", |_args| Ok(Vec::new()));
        let registry = catalog.snapshot();

        catalog.register_task("after", |_args| Ok(Vec::new()));
        assert!(registry.resolve_task("before").is_some());
        assert!(registry.resolve_task("after").is_none());
    }

    #[test]
    fn test_role_mismatch_is_distinguished() {
        let catalog = FunctionCatalog::new();
        catalog.register_task("double", |_args| Ok(Vec::new()));
        let registry = catalog.snapshot();

        let err = RemoteFunction::actor_constructor("double", &registry).unwrap_err();
        assert!(matches!(err, TaskError::NotAnActorConstructor(_)));
    }
}
