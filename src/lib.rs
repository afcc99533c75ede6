//! Ensemble Runtime – a distributed object store, task dispatch, and actor
//! runtime core with gang-scheduled placement groups
//!
//! This crate implements the runtime behind a distributed-computing client
//! API:
//! - Write-once, reference-counted object storage with blocking-wait retrieval
//! - Remote task invocation producing future object handles, with dataflow
//!   dependency ordering, retries, and back-pressure
//! - Stateful actors with FIFO method dispatch, restart budgets, and
//!   generation-tagged identity
//! - Placement groups: atomic multi-bundle resource reservation with
//!   PACK / SPREAD / STRICT_PACK / STRICT_SPREAD strategies
//! - NDJSON control plane for driving a runtime from another process

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of the Ensemble runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for control plane communication
pub const PROTOCOL_VERSION: &str = "1.0.0";
