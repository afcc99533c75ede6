//! Integration tests for placement groups and task binding
//!
//! Covers readiness waiting, strict all-or-nothing reservation, removal
//! semantics for bound work, and infeasible demand.

use ensemble::runtime::cluster::{NodeSpec, resources};
use ensemble::runtime::error::{ObjectError, PlacementError, RuntimeError, TaskFailure};
use ensemble::runtime::ident::NodeId;
use ensemble::runtime::placement::{
    PlacementGroupOptions, PlacementGroupState, PlacementStrategy,
};
use ensemble::runtime::registry::FunctionCatalog;
use ensemble::runtime::task::{CallOptions, TaskArg};
use ensemble::runtime::{Runtime, RuntimeConfig};
use std::time::Duration;

fn register_functions() {
    let catalog = FunctionCatalog::global();
    catalog.register_task("echo", |args| {
        Ok(args.first().cloned().unwrap_or_default())
    });
    catalog.register_task("slow_echo", |args| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(args.first().cloned().unwrap_or_default())
    });
}

fn runtime_with_nodes(cpus: &[f64]) -> Runtime {
    register_functions();
    Runtime::new(RuntimeConfig {
        spill_enabled: false,
        nodes: cpus
            .iter()
            .enumerate()
            .map(|(i, cpu)| NodeSpec {
                id: NodeId::new(format!("node-{i}")),
                resources: resources(&[("CPU", *cpu)]),
            })
            .collect(),
        ..RuntimeConfig::default()
    })
    .unwrap()
}

fn group(strategy: PlacementStrategy, cpus: &[f64]) -> PlacementGroupOptions {
    PlacementGroupOptions {
        bundles: cpus.iter().map(|c| resources(&[("CPU", *c)])).collect(),
        strategy,
        name: None,
    }
}

#[tokio::test]
async fn test_feasible_group_becomes_ready() {
    let runtime = runtime_with_nodes(&[4.0, 4.0]);
    let id = runtime
        .create_placement_group(group(PlacementStrategy::Spread, &[2.0, 2.0]))
        .unwrap();

    assert!(runtime.wait_placement_group_ready(&id, 5).await.unwrap());
    assert_eq!(
        runtime.placement_group_state(&id).unwrap(),
        PlacementGroupState::Ready
    );
}

#[tokio::test]
async fn test_wait_ready_timeout_does_not_cancel() {
    let runtime = runtime_with_nodes(&[2.0]);
    // Feasible in total, but two bundles cannot fit at once
    let id = runtime
        .create_placement_group(group(PlacementStrategy::Pack, &[2.0, 2.0]))
        .unwrap();

    assert!(!runtime.wait_placement_group_ready(&id, 1).await.unwrap());
    assert_eq!(
        runtime.placement_group_state(&id).unwrap(),
        PlacementGroupState::Pending
    );
}

#[tokio::test]
async fn test_strict_pack_unsatisfiable_rolls_back() {
    let runtime = runtime_with_nodes(&[4.0, 4.0]);
    let id = runtime
        .create_placement_group(group(PlacementStrategy::StrictPack, &[3.0, 3.0]))
        .unwrap();

    let err = runtime
        .wait_placement_group_ready(&id, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Placement(PlacementError::Infeasible { .. })
    ));

    // Nothing was reserved: full node capacity remains available
    let status = runtime.status();
    for node in status.nodes {
        assert_eq!(node.available.get("CPU"), node.total.get("CPU"));
    }
}

#[tokio::test]
async fn test_bound_task_runs_once_group_is_ready() {
    let runtime = runtime_with_nodes(&[4.0]);
    let function = runtime.task_function("echo").unwrap();
    let id = runtime
        .create_placement_group(group(PlacementStrategy::Pack, &[1.0]))
        .unwrap();

    let result = runtime
        .call(
            &function,
            vec![TaskArg::Value(b"pinned".to_vec())],
            CallOptions {
                placement_group: Some(id.clone()),
                ..CallOptions::default()
            },
        )
        .unwrap();
    assert_eq!(runtime.get(&result).await.unwrap(), b"pinned");
}

#[tokio::test]
async fn test_remove_fails_unstarted_bound_tasks() {
    let runtime = runtime_with_nodes(&[1.0]);
    let function = runtime.task_function("echo").unwrap();

    // The group can never leave Pending: one node, two 1-CPU bundles needed
    let id = runtime
        .create_placement_group(group(PlacementStrategy::Pack, &[1.0, 1.0]))
        .unwrap();
    let result = runtime
        .call(
            &function,
            vec![TaskArg::Value(b"never".to_vec())],
            CallOptions {
                placement_group: Some(id.clone()),
                ..CallOptions::default()
            },
        )
        .unwrap();

    runtime.remove_placement_group(&id).unwrap();

    let err = runtime.get(&result).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Object(ObjectError::TaskFailed(
            TaskFailure::PlacementGroupRemoved(_)
        ))
    ));
}

#[tokio::test]
async fn test_remove_leaves_running_bound_tasks_alone() {
    let runtime = runtime_with_nodes(&[4.0]);
    let function = runtime.task_function("slow_echo").unwrap();
    let id = runtime
        .create_placement_group(group(PlacementStrategy::Pack, &[1.0]))
        .unwrap();
    assert!(runtime.wait_placement_group_ready(&id, 5).await.unwrap());

    let result = runtime
        .call(
            &function,
            vec![TaskArg::Value(b"running".to_vec())],
            CallOptions {
                placement_group: Some(id.clone()),
                ..CallOptions::default()
            },
        )
        .unwrap();

    // Let the task start, then pull the group out from under it
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.remove_placement_group(&id).unwrap();

    assert_eq!(runtime.get(&result).await.unwrap(), b"running");
}

#[tokio::test]
async fn test_strict_spread_needs_enough_nodes() {
    let runtime = runtime_with_nodes(&[4.0]);
    let id = runtime
        .create_placement_group(group(PlacementStrategy::StrictSpread, &[1.0, 1.0]))
        .unwrap();
    assert_eq!(
        runtime.placement_group_state(&id).unwrap(),
        PlacementGroupState::Infeasible
    );
}
