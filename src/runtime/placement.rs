//! Placement groups: atomic multi-bundle resource reservation
//!
//! A placement group asks for a set of bundles (resource vectors) placed
//! according to a strategy. Creation returns immediately with a `Pending`
//! handle; a background reservation loop attempts placement whenever
//! capacity changes. Strict strategies are all-or-nothing per attempt and
//! roll back partial reservations; non-strict strategies keep partial
//! placements and stay `Pending` until the remainder fits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use super::cluster::{ClusterView, NodeState, ResourceVector, combine};
use super::error::{PlacementError, PlacementResult};
use super::ident::{NodeId, PlacementGroupId};

/// One indivisible placement unit: a resource-quantity vector
pub type Bundle = ResourceVector;

/// Strategy governing how bundles map onto nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementStrategy {
    /// Prefer packing bundles onto as few nodes as possible
    Pack,
    /// Prefer spreading bundles across distinct nodes
    Spread,
    /// All bundles on one node, all-or-nothing
    StrictPack,
    /// Every bundle on a distinct node, all-or-nothing
    StrictSpread,
}

/// Creation options for a placement group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGroupOptions {
    /// Requested bundles, addressed by index
    pub bundles: Vec<Bundle>,
    /// Placement strategy
    pub strategy: PlacementStrategy,
    /// Optional human-readable name
    #[serde(default)]
    pub name: Option<String>,
}

/// Lifecycle state of a placement group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementGroupState {
    /// Reservation in progress (possibly partially placed)
    Pending,
    /// All bundles reserved
    Ready,
    /// The demand can never be satisfied by this cluster
    Infeasible,
    /// The reservation was released
    Removed,
}

/// Status summary of one placement group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGroupInfo {
    /// Group identifier
    pub id: PlacementGroupId,
    /// Optional name from creation options
    pub name: Option<String>,
    /// Strategy from creation options
    pub strategy: PlacementStrategy,
    /// Current lifecycle state
    pub state: PlacementGroupState,
    /// Bundles placed so far (by bundle index)
    pub placed: usize,
    /// Total bundle count
    pub bundles: usize,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

struct GroupRecord {
    options: PlacementGroupOptions,
    state: PlacementGroupState,
    placements: Vec<Option<NodeId>>,
    state_tx: watch::Sender<PlacementGroupState>,
    created_at: DateTime<Utc>,
}

impl GroupRecord {
    fn placed(&self) -> usize {
        self.placements.iter().filter(|p| p.is_some()).count()
    }
}

/// Scheduler owning all placement group reservations
pub struct PlacementGroupScheduler {
    cluster: Arc<ClusterView>,
    groups: Mutex<HashMap<PlacementGroupId, GroupRecord>>,
    kick: Notify,
}

impl PlacementGroupScheduler {
    /// Create a scheduler over the given cluster view
    pub fn new(cluster: Arc<ClusterView>) -> Self {
        Self {
            cluster,
            groups: Mutex::new(HashMap::new()),
            kick: Notify::new(),
        }
    }

    /// Register a new group and start reserving asynchronously
    ///
    /// Returns immediately with a `Pending` handle. Demand the cluster can
    /// never satisfy is marked `Infeasible` up front.
    pub fn create(&self, options: PlacementGroupOptions) -> PlacementResult<PlacementGroupId> {
        if options.bundles.is_empty() {
            return Err(PlacementError::InvalidBundle(
                "a placement group needs at least one bundle".to_string(),
            ));
        }
        for bundle in &options.bundles {
            if bundle.is_empty() {
                return Err(PlacementError::InvalidBundle(
                    "empty resource vector".to_string(),
                ));
            }
            for (name, qty) in bundle {
                if !qty.is_finite() || *qty <= 0.0 {
                    return Err(PlacementError::InvalidBundle(format!(
                        "resource '{name}' has invalid quantity {qty}"
                    )));
                }
            }
        }

        let id = PlacementGroupId::fresh();
        let infeasible = self.infeasibility_reason(&options);
        let state = if infeasible.is_some() {
            PlacementGroupState::Infeasible
        } else {
            PlacementGroupState::Pending
        };
        let (state_tx, _) = watch::channel(state);

        let bundles = options.bundles.len();
        let record = GroupRecord {
            placements: vec![None; bundles],
            options,
            state,
            state_tx,
            created_at: Utc::now(),
        };
        self.groups.lock().insert(id.clone(), record);

        match infeasible {
            Some(reason) => info!(group = %id, %reason, "placement group is infeasible"),
            None => debug!(group = %id, bundles, "placement group created"),
        }
        self.kick.notify_one();
        Ok(id)
    }

    fn infeasibility_reason(&self, options: &PlacementGroupOptions) -> Option<String> {
        for (index, bundle) in options.bundles.iter().enumerate() {
            if !self.cluster.any_node_could_ever_fit(bundle) {
                return Some(format!("bundle {index} exceeds every node's capacity"));
            }
        }
        match options.strategy {
            PlacementStrategy::StrictPack => {
                let total = options
                    .bundles
                    .iter()
                    .fold(ResourceVector::new(), |acc, b| combine(&acc, b));
                if !self.cluster.any_node_could_ever_fit(&total) {
                    return Some("combined bundles exceed every node's capacity".to_string());
                }
            }
            PlacementStrategy::StrictSpread => {
                if self.cluster.node_count() < options.bundles.len() {
                    return Some(format!(
                        "{} bundles require distinct nodes but only {} exist",
                        options.bundles.len(),
                        self.cluster.node_count()
                    ));
                }
            }
            PlacementStrategy::Pack | PlacementStrategy::Spread => {}
        }
        None
    }

    /// Release all reserved bundles
    ///
    /// Pending work bound to this group observes the `Removed` state and
    /// fails; already-running work is unaffected.
    pub fn remove(&self, id: &PlacementGroupId) -> PlacementResult<()> {
        let mut groups = self.groups.lock();
        let record = groups
            .get_mut(id)
            .ok_or_else(|| PlacementError::NotFound(id.clone()))?;
        if record.state == PlacementGroupState::Removed {
            return Ok(());
        }

        for (index, placement) in record.placements.iter_mut().enumerate() {
            if let Some(node) = placement.take() {
                self.cluster.release(&node, &record.options.bundles[index]);
            }
        }
        record.state = PlacementGroupState::Removed;
        record.state_tx.send_replace(PlacementGroupState::Removed);
        info!(group = %id, "placement group removed");
        self.kick.notify_one();
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self, id: &PlacementGroupId) -> PlacementResult<PlacementGroupState> {
        self.groups
            .lock()
            .get(id)
            .map(|record| record.state)
            .ok_or_else(|| PlacementError::NotFound(id.clone()))
    }

    /// Subscribe to state transitions (used to bind tasks to a group)
    pub fn subscribe(
        &self,
        id: &PlacementGroupId,
    ) -> PlacementResult<watch::Receiver<PlacementGroupState>> {
        self.groups
            .lock()
            .get(id)
            .map(|record| record.state_tx.subscribe())
            .ok_or_else(|| PlacementError::NotFound(id.clone()))
    }

    /// Per-bundle node placements (None while a bundle is unplaced)
    pub fn placements(&self, id: &PlacementGroupId) -> PlacementResult<Vec<Option<NodeId>>> {
        self.groups
            .lock()
            .get(id)
            .map(|record| record.placements.clone())
            .ok_or_else(|| PlacementError::NotFound(id.clone()))
    }

    /// Block until all bundles are reserved or the timeout elapses
    ///
    /// Returns `false` on timeout without cancelling the reservation
    /// attempt; the caller must `remove` explicitly if it gives up.
    pub async fn wait_ready(
        &self,
        id: &PlacementGroupId,
        timeout_seconds: u64,
    ) -> PlacementResult<bool> {
        let mut rx = self.subscribe(id)?;
        let settled = rx.wait_for(|state| *state != PlacementGroupState::Pending);
        match tokio::time::timeout(Duration::from_secs(timeout_seconds), settled).await {
            Err(_) => Ok(false),
            Ok(Err(_)) => Err(PlacementError::NotFound(id.clone())),
            Ok(Ok(state)) => match *state {
                PlacementGroupState::Ready => Ok(true),
                PlacementGroupState::Removed => Err(PlacementError::Removed(id.clone())),
                PlacementGroupState::Infeasible => Err(PlacementError::Infeasible {
                    id: id.clone(),
                    reason: "demand exceeds cluster capacity".to_string(),
                }),
                PlacementGroupState::Pending => Ok(false),
            },
        }
    }

    /// Status summaries for all known groups
    pub fn list(&self) -> Vec<PlacementGroupInfo> {
        self.groups
            .lock()
            .iter()
            .map(|(id, record)| PlacementGroupInfo {
                id: id.clone(),
                name: record.options.name.clone(),
                strategy: record.options.strategy,
                state: record.state,
                placed: record.placed(),
                bundles: record.options.bundles.len(),
                created_at: record.created_at,
            })
            .collect()
    }

    /// Run the reservation loop until the handle is aborted
    ///
    /// Wakes on group creation/removal, on cluster capacity changes, and on
    /// a coarse interval as a backstop.
    pub fn spawn_reservation_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                scheduler.drive();
                tokio::select! {
                    _ = scheduler.kick.notified() => {}
                    _ = scheduler.cluster.released() => {}
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        })
    }

    /// Attempt placement for every pending group
    pub fn drive(&self) {
        let mut groups = self.groups.lock();
        for (id, record) in groups.iter_mut() {
            if record.state != PlacementGroupState::Pending {
                continue;
            }
            let bundles = &record.options.bundles;
            let placed = self.cluster.with_table(|table| match record.options.strategy {
                PlacementStrategy::StrictPack => place_strict_pack(table, bundles),
                PlacementStrategy::StrictSpread => place_strict_spread(table, bundles),
                PlacementStrategy::Pack => {
                    place_partial(table, bundles, &mut record.placements, true);
                    None
                }
                PlacementStrategy::Spread => {
                    place_partial(table, bundles, &mut record.placements, false);
                    None
                }
            });
            if let Some(nodes) = placed {
                record.placements = nodes.into_iter().map(Some).collect();
            }
            if record.placed() == bundles.len() {
                record.state = PlacementGroupState::Ready;
                record.state_tx.send_replace(PlacementGroupState::Ready);
                info!(group = %id, "placement group ready");
            }
        }
    }
}

/// All bundles onto one node, all-or-nothing
fn place_strict_pack(
    table: &mut BTreeMap<NodeId, NodeState>,
    bundles: &[Bundle],
) -> Option<Vec<NodeId>> {
    let total = bundles
        .iter()
        .fold(ResourceVector::new(), |acc, b| combine(&acc, b));
    let node = table
        .iter()
        .find(|(_, state)| state.can_fit(&total))
        .map(|(id, _)| id.clone())?;
    table.get_mut(&node)?.reserve(&total);
    Some(vec![node; bundles.len()])
}

/// Each bundle onto a distinct node, all-or-nothing with rollback
fn place_strict_spread(
    table: &mut BTreeMap<NodeId, NodeState>,
    bundles: &[Bundle],
) -> Option<Vec<NodeId>> {
    let mut order: Vec<usize> = (0..bundles.len()).collect();
    order.sort_by(|a, b| {
        let wa: f64 = bundles[*a].values().sum();
        let wb: f64 = bundles[*b].values().sum();
        wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut chosen: Vec<Option<NodeId>> = vec![None; bundles.len()];
    let mut used: HashSet<NodeId> = HashSet::new();
    for index in order {
        let candidate = table
            .iter()
            .filter(|(id, state)| !used.contains(*id) && state.can_fit(&bundles[index]))
            .max_by(|(_, a), (_, b)| {
                a.available_weight()
                    .partial_cmp(&b.available_weight())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| id.clone());
        match candidate {
            Some(node) => {
                if let Some(state) = table.get_mut(&node) {
                    state.reserve(&bundles[index]);
                }
                used.insert(node.clone());
                chosen[index] = Some(node);
            }
            None => {
                // Roll back everything reserved so far
                for (i, placement) in chosen.iter().enumerate() {
                    if let Some(node) = placement
                        && let Some(state) = table.get_mut(node)
                    {
                        state.release(&bundles[i]);
                    }
                }
                return None;
            }
        }
    }
    Some(chosen.into_iter().flatten().collect())
}

/// Place what fits, leave the rest pending
///
/// `pack` selects the fullest node that still fits (best-fit); spread
/// selects the emptiest node, preferring nodes this group does not use yet.
fn place_partial(
    table: &mut BTreeMap<NodeId, NodeState>,
    bundles: &[Bundle],
    placements: &mut [Option<NodeId>],
    pack: bool,
) {
    let mut used: HashSet<NodeId> = placements.iter().flatten().cloned().collect();
    for (index, bundle) in bundles.iter().enumerate() {
        if placements[index].is_some() {
            continue;
        }
        let fitting = table.iter().filter(|(_, state)| state.can_fit(bundle));
        let candidate = if pack {
            fitting
                .min_by(|(_, a), (_, b)| {
                    a.available_weight()
                        .partial_cmp(&b.available_weight())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(id, _)| id.clone())
        } else {
            let fresh: Vec<(&NodeId, &NodeState)> =
                fitting.filter(|(id, _)| !used.contains(*id)).collect();
            let pool = if fresh.is_empty() {
                table
                    .iter()
                    .filter(|(_, state)| state.can_fit(bundle))
                    .collect()
            } else {
                fresh
            };
            pool.into_iter()
                .max_by(|(_, a), (_, b)| {
                    a.available_weight()
                        .partial_cmp(&b.available_weight())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(id, _)| id.clone())
        };
        if let Some(node) = candidate {
            if let Some(state) = table.get_mut(&node) {
                state.reserve(bundle);
            }
            used.insert(node.clone());
            placements[index] = Some(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cluster::{NodeSpec, resources};

    fn cluster(nodes: &[(&str, f64)]) -> Arc<ClusterView> {
        Arc::new(ClusterView::new(
            nodes
                .iter()
                .map(|(id, cpu)| NodeSpec {
                    id: NodeId::new(*id),
                    resources: resources(&[("CPU", *cpu)]),
                })
                .collect(),
        ))
    }

    fn options(strategy: PlacementStrategy, cpus: &[f64]) -> PlacementGroupOptions {
        PlacementGroupOptions {
            bundles: cpus.iter().map(|c| resources(&[("CPU", *c)])).collect(),
            strategy,
            name: None,
        }
    }

    #[test]
    fn test_strict_pack_places_on_one_node() {
        let cluster = cluster(&[("a", 4.0), ("b", 4.0)]);
        let scheduler = PlacementGroupScheduler::new(cluster);
        let id = scheduler
            .create(options(PlacementStrategy::StrictPack, &[2.0, 2.0]))
            .unwrap();

        scheduler.drive();
        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Ready);
        let nodes: Vec<_> = scheduler.placements(&id).unwrap().into_iter().collect();
        assert_eq!(nodes[0], nodes[1]);
    }

    #[test]
    fn test_strict_spread_uses_distinct_nodes() {
        let cluster = cluster(&[("a", 2.0), ("b", 2.0)]);
        let scheduler = PlacementGroupScheduler::new(cluster);
        let id = scheduler
            .create(options(PlacementStrategy::StrictSpread, &[1.0, 1.0]))
            .unwrap();

        scheduler.drive();
        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Ready);
        let nodes = scheduler.placements(&id).unwrap();
        assert_ne!(nodes[0], nodes[1]);
    }

    #[test]
    fn test_strict_pack_never_partially_reserves() {
        let view = cluster(&[("a", 4.0)]);
        let scheduler = PlacementGroupScheduler::new(view.clone());
        // Feasible in total capacity terms, but the node is half-occupied
        view.try_reserve(&resources(&[("CPU", 3.0)])).unwrap();

        let id = scheduler
            .create(options(PlacementStrategy::StrictPack, &[2.0, 2.0]))
            .unwrap();
        scheduler.drive();

        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Pending);
        // Nothing was reserved for the group
        let snapshot = view.snapshot();
        assert_eq!(snapshot[0].available.get("CPU").copied().unwrap(), 1.0);
    }

    #[test]
    fn test_unsatisfiable_demand_is_infeasible() {
        let cluster = cluster(&[("a", 4.0)]);
        let scheduler = PlacementGroupScheduler::new(cluster);
        let id = scheduler
            .create(options(PlacementStrategy::StrictPack, &[3.0, 3.0]))
            .unwrap();
        assert_eq!(
            scheduler.state(&id).unwrap(),
            PlacementGroupState::Infeasible
        );
    }

    #[test]
    fn test_non_strict_degrades_gracefully() {
        let view = cluster(&[("a", 2.0)]);
        let scheduler = PlacementGroupScheduler::new(view.clone());
        let id = scheduler
            .create(options(PlacementStrategy::Pack, &[2.0, 2.0]))
            .unwrap();

        scheduler.drive();
        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Pending);
        let placements = scheduler.placements(&id).unwrap();
        assert_eq!(placements.iter().flatten().count(), 1);

        // Capacity frees: the second bundle lands and the group becomes ready
        view.add_node(NodeSpec {
            id: NodeId::new("b"),
            resources: resources(&[("CPU", 2.0)]),
        });
        scheduler.drive();
        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Ready);
    }

    #[test]
    fn test_remove_releases_reservations() {
        let view = cluster(&[("a", 4.0)]);
        let scheduler = PlacementGroupScheduler::new(view.clone());
        let id = scheduler
            .create(options(PlacementStrategy::Pack, &[4.0]))
            .unwrap();
        scheduler.drive();
        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Ready);

        scheduler.remove(&id).unwrap();
        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Removed);
        assert!(view.try_reserve(&resources(&[("CPU", 4.0)])).is_some());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_without_cancelling() {
        let view = cluster(&[("a", 1.0)]);
        let scheduler = Arc::new(PlacementGroupScheduler::new(view));
        let id = scheduler
            .create(options(PlacementStrategy::Pack, &[1.0, 1.0]))
            .unwrap();
        scheduler.drive();

        let ready = scheduler.wait_ready(&id, 0).await.unwrap();
        assert!(!ready);
        // Still pending, not cancelled
        assert_eq!(scheduler.state(&id).unwrap(), PlacementGroupState::Pending);
    }
}
