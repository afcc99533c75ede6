//! Error types for the Ensemble runtime
//!
//! Domain errors use thiserror, one enum per subsystem, joined by a
//! top-level `RuntimeError`. Application-level task failures are not errors
//! in this module's sense: they materialize as the task's result payload
//! (`TaskFailure`) and surface to `get` callers as `ObjectError::TaskFailed`.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::ident::{ActorId, ObjectId, PlacementGroupId};

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Object store errors
    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    /// Reference counting errors
    #[error("Reference counting error: {0}")]
    RefCount(#[from] RefCountError),

    /// Task submission errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Actor lifecycle errors
    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    /// Placement group errors
    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The runtime has shut down
    #[error("Runtime has shut down")]
    Shutdown,
}

/// Terminal outcome of a task that did not produce a value
///
/// A result handle materializes exactly once; when the task fails, it
/// materializes as one of these markers instead of a payload. Retrieval
/// surfaces the marker as a recoverable error value, never a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TaskFailure {
    /// The task function returned an application-level error
    #[error("Task failed: {message}")]
    Application {
        /// Error message captured from the task function
        message: String,
    },

    /// The worker process died and the retry budget is exhausted
    #[error("Worker died after {attempts} attempt(s)")]
    WorkerDied {
        /// Number of execution attempts made
        attempts: u32,
    },

    /// The placement group this task was bound to was removed before start
    #[error("Placement group {0} was removed before the task started")]
    PlacementGroupRemoved(PlacementGroupId),

    /// The actor was restarting when this call was in flight
    #[error("Actor {0} was restarting")]
    ActorRestarting(ActorId),

    /// The actor is permanently dead
    #[error("Actor {0} is dead")]
    ActorDead(ActorId),

    /// A by-reference argument materialized as a failure
    #[error("Dependency {object} failed: {cause}")]
    DependencyFailed {
        /// The argument object that failed
        object: ObjectId,
        /// The upstream failure
        cause: Box<TaskFailure>,
    },
}

/// Object store errors
#[derive(Debug, Error)]
pub enum ObjectError {
    /// The ID was never issued by this runtime
    #[error("Object {0} not found")]
    NotFound(ObjectId),

    /// The owning node failed before materialization and no replica exists
    #[error("Object {0} was lost before materialization")]
    Lost(ObjectId),

    /// The store is full and no eviction or spill could free space
    #[error("Store capacity exceeded: need {requested} bytes, {available} available")]
    CapacityExceeded {
        /// Bytes required by the rejected payload
        requested: usize,
        /// Bytes currently free
        available: usize,
    },

    /// A handle was materialized twice (contract violation)
    #[error("Object {0} is already materialized")]
    AlreadyMaterialized(ObjectId),

    /// `wait` was called with `num_objects` exceeding the ID count
    #[error("Wait precondition violated: requested {requested} of {provided} objects")]
    WaitPrecondition {
        /// Requested ready count
        requested: usize,
        /// Number of IDs provided
        provided: usize,
    },

    /// The object materialized as a task failure marker
    #[error("{0}")]
    TaskFailed(#[from] TaskFailure),

    /// Spill file I/O failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience result alias for object store operations
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// Reference counting errors
///
/// These are programming errors in the caller's bookkeeping, not runtime
/// conditions: removing a reference that was never added means the caller's
/// accounting is already corrupt.
#[derive(Debug, Error)]
pub enum RefCountError {
    /// A reference was removed that was never added
    #[error("Dangling reference for object {0}: removal without matching add")]
    DanglingReference(ObjectId),

    /// A reference was added for an ID this runtime never issued
    #[error("Cannot reference unknown object {0}")]
    UnknownObject(ObjectId),
}

/// Convenience result alias for reference-count operations
pub type RefCountResult<T> = std::result::Result<T, RefCountError>;

/// Task submission errors (preconditions, raised before any scheduling)
#[derive(Debug, Error)]
pub enum TaskError {
    /// The function name was never registered
    #[error("Function '{0}' not found. Register it before constructing a remote call")]
    FunctionNotRegistered(String),

    /// The name is registered, but not as an actor constructor
    #[error("'{0}' is not a registered actor constructor")]
    NotAnActorConstructor(String),

    /// The name is registered, but not as an actor method
    #[error("'{0}' is not a registered actor method")]
    NotAnActorMethod(String),

    /// Invalid call or creation options
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The dispatcher has shut down
    #[error("Task dispatcher has shut down")]
    Shutdown,
}

/// Convenience result alias for task operations
pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Actor lifecycle errors
#[derive(Debug, Error)]
pub enum ActorError {
    /// No actor with this name is registered in the requested namespace
    #[error("Actor named '{0}' not found")]
    NotFound(String),

    /// No actor with this ID exists
    #[error("Actor {0} does not exist")]
    UnknownActor(ActorId),

    /// The actor is permanently dead
    #[error("Actor {0} is dead")]
    Dead(ActorId),

    /// The actor is restarting; the call was rejected rather than queued
    #[error("Actor {0} is restarting")]
    Restarting(ActorId),

    /// The operation requires an actor execution context
    #[error("Not running inside an actor context: {0}")]
    InvalidContext(String),
}

/// Convenience result alias for actor operations
pub type ActorResult<T> = std::result::Result<T, ActorError>;

/// Placement group errors
#[derive(Debug, Error)]
pub enum PlacementError {
    /// No placement group with this ID exists
    #[error("Placement group {0} not found")]
    NotFound(PlacementGroupId),

    /// The group's demand can never be satisfied by this cluster
    #[error("Placement group {id} is infeasible: {reason}")]
    Infeasible {
        /// The infeasible group
        id: PlacementGroupId,
        /// Why the demand cannot be met
        reason: String,
    },

    /// The group was removed
    #[error("Placement group {0} was removed")]
    Removed(PlacementGroupId),

    /// A bundle requests a malformed resource vector
    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),
}

/// Convenience result alias for placement operations
pub type PlacementResult<T> = std::result::Result<T, PlacementError>;

/// Storage errors (runtime root, config persistence, spill files)
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where the write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Config file error
    #[error("Config file error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
