//! Opaque identifiers shared across the runtime
//!
//! Every handle the runtime issues (objects, tasks, actors, placement
//! groups, nodes) is an opaque string. The runtime only ever compares and
//! hashes them; any internal structure is an implementation detail that
//! callers must not rely on.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Handle for an immutable, possibly not-yet-materialized byte payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an ObjectId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh unique ObjectId
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Derive the result ObjectId for a task submission
    ///
    /// Result handles are computed from the function name and a per-runtime
    /// submission nonce, so they are unique without coordination.
    pub fn for_task_result(function_name: &str, nonce: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(function_name.as_bytes());
        hasher.update(&nonce.to_le_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a single task submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Allocate a fresh unique TaskId
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a logical actor
///
/// One logical ActorId may span several physical incarnations; those are
/// distinguished by the actor's generation counter, not by the ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    /// Create an ActorId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh unique ActorId
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a placement group reservation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementGroupId(String);

impl PlacementGroupId {
    /// Create a PlacementGroupId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh unique PlacementGroupId
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlacementGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Create a NodeId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The local node on a single-node runtime
    pub fn local() -> Self {
        Self("local".to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone counter distinguishing physical incarnations of one actor ID
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Generation(pub u64);

impl Generation {
    /// The first incarnation
    pub fn zero() -> Self {
        Self(0)
    }

    /// The next incarnation
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
