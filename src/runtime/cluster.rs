//! Cluster resource view: node capacities and reservations
//!
//! Tracks the total and available resource vector of every known node.
//! All mutations happen under a single mutex, so a committed reservation is
//! never silently lost within the process. Waiters (resource-annotated
//! tasks, the placement reservation loop) are woken whenever capacity is
//! released or a node joins.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Notify;
use tracing::debug;

use super::ident::NodeId;

/// Resource-name to quantity mapping
pub type ResourceVector = BTreeMap<String, f64>;

/// Build a resource vector from name/quantity pairs
pub fn resources(pairs: &[(&str, f64)]) -> ResourceVector {
    pairs
        .iter()
        .map(|(name, qty)| ((*name).to_string(), *qty))
        .collect()
}

/// Static description of a node's capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node identifier
    pub id: NodeId,
    /// Total capacity per resource
    pub resources: ResourceVector,
}

/// Live capacity bookkeeping for one node
#[derive(Debug, Clone)]
pub struct NodeState {
    total: ResourceVector,
    available: ResourceVector,
}

impl NodeState {
    fn new(total: ResourceVector) -> Self {
        Self {
            available: total.clone(),
            total,
        }
    }

    /// Whether the demand fits the node's current availability
    pub fn can_fit(&self, demand: &ResourceVector) -> bool {
        fits(&self.available, demand)
    }

    /// Whether the demand could ever fit this node, at full capacity
    pub fn could_ever_fit(&self, demand: &ResourceVector) -> bool {
        fits(&self.total, demand)
    }

    /// Sum of available quantities, used for best/worst-fit ordering
    pub fn available_weight(&self) -> f64 {
        self.available.values().sum()
    }

    /// Commit a reservation. Caller must have checked `can_fit`.
    pub(crate) fn reserve(&mut self, demand: &ResourceVector) {
        for (name, qty) in demand {
            if let Some(avail) = self.available.get_mut(name) {
                *avail -= qty;
            }
        }
    }

    /// Return a reservation's resources to the pool
    pub(crate) fn release(&mut self, demand: &ResourceVector) {
        for (name, qty) in demand {
            if let Some(avail) = self.available.get_mut(name) {
                *avail = (*avail + qty).min(self.total.get(name).copied().unwrap_or(0.0));
            }
        }
    }

    /// Current availability per resource
    pub fn available(&self) -> &ResourceVector {
        &self.available
    }

    /// Total capacity per resource
    pub fn total(&self) -> &ResourceVector {
        &self.total
    }
}

fn fits(available: &ResourceVector, demand: &ResourceVector) -> bool {
    demand
        .iter()
        .all(|(name, qty)| available.get(name).copied().unwrap_or(0.0) + 1e-9 >= *qty)
}

/// Sum two resource vectors
pub fn combine(a: &ResourceVector, b: &ResourceVector) -> ResourceVector {
    let mut out = a.clone();
    for (name, qty) in b {
        *out.entry(name.clone()).or_insert(0.0) += qty;
    }
    out
}

/// Point-in-time view of one node for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Node identifier
    pub id: NodeId,
    /// Total capacity
    pub total: ResourceVector,
    /// Currently available capacity
    pub available: ResourceVector,
}

/// Shared table of node capacities
pub struct ClusterView {
    table: Mutex<BTreeMap<NodeId, NodeState>>,
    released: Notify,
}

impl ClusterView {
    /// Create a view seeded with the given nodes
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        let table = nodes
            .into_iter()
            .map(|spec| (spec.id, NodeState::new(spec.resources)))
            .collect();
        Self {
            table: Mutex::new(table),
            released: Notify::new(),
        }
    }

    /// Add a node to the cluster, waking capacity waiters
    pub fn add_node(&self, spec: NodeSpec) {
        self.table
            .lock()
            .insert(spec.id.clone(), NodeState::new(spec.resources));
        debug!(node = %spec.id, "node joined cluster view");
        self.released.notify_waiters();
    }

    /// Number of known nodes
    pub fn node_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Run a closure over the locked node table
    ///
    /// Multi-node operations (group placement with rollback) use this to
    /// stay atomic with respect to concurrent reservations.
    pub(crate) fn with_table<R>(&self, f: impl FnOnce(&mut BTreeMap<NodeId, NodeState>) -> R) -> R {
        let mut table = self.table.lock();
        f(&mut table)
    }

    /// Reserve `demand` on the first node where it fits
    pub fn try_reserve(&self, demand: &ResourceVector) -> Option<NodeId> {
        let mut table = self.table.lock();
        let id = table
            .iter()
            .find(|(_, state)| state.can_fit(demand))
            .map(|(id, _)| id.clone())?;
        if let Some(state) = table.get_mut(&id) {
            state.reserve(demand);
        }
        Some(id)
    }

    /// Release a prior reservation and wake waiters
    pub fn release(&self, node: &NodeId, demand: &ResourceVector) {
        {
            let mut table = self.table.lock();
            if let Some(state) = table.get_mut(node) {
                state.release(demand);
            }
        }
        self.released.notify_waiters();
    }

    /// Reserve `demand` somewhere, suspending until capacity frees
    pub async fn acquire(&self, demand: &ResourceVector) -> NodeId {
        loop {
            // Register for wakeup before checking, so a release between the
            // check and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(node) = self.try_reserve(demand) {
                return node;
            }
            notified.await;
        }
    }

    /// Suspend until capacity is released or a node joins
    pub async fn released(&self) {
        self.released.notified().await;
    }

    /// Whether any single node could ever fit `demand` at full capacity
    pub fn any_node_could_ever_fit(&self, demand: &ResourceVector) -> bool {
        self.table
            .lock()
            .values()
            .any(|state| state.could_ever_fit(demand))
    }

    /// How many distinct nodes could ever fit `demand` at full capacity
    pub fn nodes_that_could_ever_fit(&self, demand: &ResourceVector) -> usize {
        self.table
            .lock()
            .values()
            .filter(|state| state.could_ever_fit(demand))
            .count()
    }

    /// Point-in-time capacity snapshot for status reporting
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.table
            .lock()
            .iter()
            .map(|(id, state)| NodeSnapshot {
                id: id.clone(),
                total: state.total.clone(),
                available: state.available.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_node(cpu: f64) -> ClusterView {
        ClusterView::new(vec![NodeSpec {
            id: NodeId::local(),
            resources: resources(&[("CPU", cpu)]),
        }])
    }

    #[test]
    fn test_reserve_and_release() {
        let cluster = one_node(4.0);
        let demand = resources(&[("CPU", 3.0)]);

        let node = cluster.try_reserve(&demand).unwrap();
        assert!(cluster.try_reserve(&demand).is_none());

        cluster.release(&node, &demand);
        assert!(cluster.try_reserve(&demand).is_some());
    }

    #[test]
    fn test_unknown_resource_never_fits() {
        let cluster = one_node(4.0);
        assert!(cluster.try_reserve(&resources(&[("GPU", 1.0)])).is_none());
    }

    #[test]
    fn test_feasibility_checks_totals_not_availability() {
        let cluster = one_node(4.0);
        let demand = resources(&[("CPU", 4.0)]);
        cluster.try_reserve(&demand).unwrap();

        // Fully reserved now, but still feasible in principle
        assert!(cluster.any_node_could_ever_fit(&demand));
        assert!(!cluster.any_node_could_ever_fit(&resources(&[("CPU", 5.0)])));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        use std::sync::Arc;
        let cluster = Arc::new(one_node(1.0));
        let demand = resources(&[("CPU", 1.0)]);
        let node = cluster.try_reserve(&demand).unwrap();

        let waiter = {
            let cluster = cluster.clone();
            let demand = demand.clone();
            tokio::spawn(async move { cluster.acquire(&demand).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        cluster.release(&node, &demand);
        assert_eq!(waiter.await.unwrap(), node);
    }
}
