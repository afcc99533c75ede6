//! Integration tests for reference-counting semantics
//!
//! The counter is the single liveness authority: N adds require exactly N
//! removes, counts never go negative, and task holds pin objects across
//! caller releases.

use ensemble::runtime::refcount::{ArgRefGuard, ReferenceCounter};
use ensemble::runtime::{Runtime, RuntimeConfig};
use ensemble::runtime::ident::ObjectId;
use std::sync::Arc;

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig {
        spill_enabled: false,
        ..RuntimeConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_n_adds_require_n_removes() {
    let runtime = runtime();
    let id = runtime.put(b"counted".to_vec()).unwrap();

    for _ in 0..4 {
        runtime.add_local_reference(&id).unwrap();
    }
    // 1 (put) + 4 explicit = 5 holds
    assert_eq!(runtime.refs().total(&id), 5);

    for _ in 0..5 {
        runtime.remove_local_reference(&id).unwrap();
    }
    assert!(!runtime.refs().is_live(&id));
}

#[tokio::test]
async fn test_add_reference_to_unknown_id_rejected() {
    let runtime = runtime();
    let err = runtime.add_local_reference(&ObjectId::fresh()).unwrap_err();
    assert!(matches!(
        err,
        ensemble::runtime::RuntimeError::RefCount(_)
    ));
}

#[test]
fn test_concurrent_adds_and_removes_are_linearizable() {
    let counter = Arc::new(ReferenceCounter::new());
    let id = ObjectId::fresh();
    counter.register(&id);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let counter = counter.clone();
        let id = id.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..1_000 {
                counter.add_local(&id).unwrap();
                counter.remove_local(&id).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Only the registration hold remains
    assert_eq!(counter.total(&id), 1);
}

#[test]
fn test_guard_releases_on_drop() {
    let counter = Arc::new(ReferenceCounter::new());
    let a = ObjectId::fresh();
    let b = ObjectId::fresh();
    counter.register(&a);
    counter.register(&b);

    {
        let _guard =
            ArgRefGuard::acquire(counter.clone(), vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(counter.total(&a), 2);
        assert_eq!(counter.total(&b), 2);
    }
    assert_eq!(counter.total(&a), 1);
    assert_eq!(counter.total(&b), 1);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any interleaving of paired add/remove sequences leaves the count
        /// at exactly the registration hold, and never trips the dangling
        /// check along the way.
        #[test]
        fn paired_operations_balance(batches in proptest::collection::vec(1u8..20, 1..20)) {
            let counter = ReferenceCounter::new();
            let id = ObjectId::fresh();
            counter.register(&id);

            for batch in &batches {
                for _ in 0..*batch {
                    counter.add_local(&id).unwrap();
                }
                prop_assert_eq!(counter.total(&id), 1 + u64::from(*batch));
                for _ in 0..*batch {
                    counter.remove_local(&id).unwrap();
                }
                prop_assert_eq!(counter.total(&id), 1);
            }
        }

        /// Task holds and local holds combine additively; releasing one kind
        /// never disturbs the other.
        #[test]
        fn task_and_local_holds_are_independent(locals in 0u8..10, tasks in 0u8..10) {
            let counter = ReferenceCounter::new();
            let id = ObjectId::fresh();
            counter.register(&id);

            for _ in 0..locals {
                counter.add_local(&id).unwrap();
            }
            for _ in 0..tasks {
                counter.add_task_hold(&id).unwrap();
            }
            prop_assert_eq!(counter.total(&id), 1 + u64::from(locals) + u64::from(tasks));

            for _ in 0..tasks {
                counter.remove_task_hold(&id).unwrap();
            }
            prop_assert_eq!(counter.total(&id), 1 + u64::from(locals));

            for _ in 0..locals {
                counter.remove_local(&id).unwrap();
            }
            prop_assert_eq!(counter.total(&id), 1);
        }
    }
}
