//! Integration tests for actor lifecycle and FIFO dispatch
//!
//! Covers submission-order execution, kill/restart semantics with budgets,
//! generation-fresh state, named lookup, and voluntary exit.

use ensemble::runtime::actor::{ActorBehavior, ActorContext, ActorOptions, ActorState};
use ensemble::runtime::error::{ActorError, ObjectError, RuntimeError, TaskFailure};
use ensemble::runtime::ident::ActorId;
use ensemble::runtime::object::Payload;
use ensemble::runtime::registry::FunctionCatalog;
use ensemble::runtime::task::{CallOptions, TaskArg};
use ensemble::runtime::{Runtime, RuntimeConfig};
use std::time::Duration;

struct Counter {
    value: i64,
}

impl ActorBehavior for Counter {
    fn invoke(
        &mut self,
        ctx: &mut ActorContext,
        method: &str,
        args: &[Payload],
    ) -> anyhow::Result<Payload> {
        match method {
            "increment" => {
                let by = args
                    .first()
                    .and_then(|a| a.first())
                    .copied()
                    .unwrap_or(1) as i64;
                self.value += by;
                Ok(self.value.to_le_bytes().to_vec())
            }
            "value" => Ok(self.value.to_le_bytes().to_vec()),
            "was_restarted" => Ok(vec![u8::from(ctx.was_restarted())]),
            "sleep" => {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Vec::new())
            }
            "retire" => {
                ctx.exit();
                Ok(Vec::new())
            }
            other => anyhow::bail!("unknown method {other}"),
        }
    }
}

fn register_functions() {
    let catalog = FunctionCatalog::global();
    catalog.register_actor(
        "Counter",
        |args| {
            let start = args
                .first()
                .and_then(|a| a.first())
                .copied()
                .unwrap_or(0) as i64;
            Ok(Box::new(Counter { value: start }))
        },
        &["increment", "value", "was_restarted", "sleep", "retire"],
    );
}

fn runtime() -> Runtime {
    register_functions();
    Runtime::new(RuntimeConfig {
        spill_enabled: false,
        ..RuntimeConfig::default()
    })
    .unwrap()
}

fn as_i64(payload: &[u8]) -> i64 {
    i64::from_le_bytes(payload[..8].try_into().unwrap())
}

fn spawn_counter(runtime: &Runtime, options: ActorOptions) -> ActorId {
    let ctor = runtime.actor_constructor("Counter").unwrap();
    runtime.create_actor(&ctor, Vec::new(), options).unwrap()
}

async fn wait_for_state(runtime: &Runtime, actor: &ActorId, state: ActorState) {
    for _ in 0..100 {
        if runtime.actor_state(actor).unwrap() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("actor never reached {state:?}");
}

#[tokio::test]
async fn test_calls_execute_in_submission_order() {
    let runtime = runtime();
    let actor = spawn_counter(&runtime, ActorOptions::default());
    let increment = runtime.actor_method("increment").unwrap();

    let first = runtime
        .call_actor(
            &increment,
            &actor,
            vec![TaskArg::Value(vec![1])],
            CallOptions::default(),
        )
        .unwrap();
    let second = runtime
        .call_actor(
            &increment,
            &actor,
            vec![TaskArg::Value(vec![1])],
            CallOptions::default(),
        )
        .unwrap();

    // Both increments observed, in order
    assert_eq!(as_i64(&runtime.get(&first).await.unwrap()), 1);
    assert_eq!(as_i64(&runtime.get(&second).await.unwrap()), 2);
}

#[tokio::test]
async fn test_kill_without_restart_is_terminal() {
    let runtime = runtime();
    let actor = spawn_counter(&runtime, ActorOptions::default());
    let value = runtime.actor_method("value").unwrap();

    // Make sure the actor is constructed and serving
    let probe = runtime
        .call_actor(&value, &actor, Vec::new(), CallOptions::default())
        .unwrap();
    runtime.get(&probe).await.unwrap();

    runtime.kill_actor(&actor, true).unwrap();
    wait_for_state(&runtime, &actor, ActorState::Dead).await;

    let err = runtime
        .call_actor(&value, &actor, Vec::new(), CallOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Actor(ActorError::Dead(_))
    ));
}

#[tokio::test]
async fn test_restart_reuses_logical_id_with_fresh_state() {
    let runtime = runtime();
    let actor = spawn_counter(
        &runtime,
        ActorOptions {
            max_restarts: 1,
            ..ActorOptions::default()
        },
    );
    let increment = runtime.actor_method("increment").unwrap();
    let value = runtime.actor_method("value").unwrap();
    let was_restarted = runtime.actor_method("was_restarted").unwrap();

    let r = runtime
        .call_actor(
            &increment,
            &actor,
            vec![TaskArg::Value(vec![5])],
            CallOptions::default(),
        )
        .unwrap();
    assert_eq!(as_i64(&runtime.get(&r).await.unwrap()), 5);

    runtime.kill_actor(&actor, false).unwrap();

    // Calls queue through the restart and land on the new incarnation
    let fresh = runtime
        .call_actor(&value, &actor, Vec::new(), CallOptions::default())
        .unwrap();
    assert_eq!(as_i64(&runtime.get(&fresh).await.unwrap()), 0);

    let restarted = runtime
        .call_actor(&was_restarted, &actor, Vec::new(), CallOptions::default())
        .unwrap();
    assert_eq!(runtime.get(&restarted).await.unwrap(), vec![1]);
    assert_eq!(runtime.actor_state(&actor).unwrap(), ActorState::Alive);
}

#[tokio::test]
async fn test_in_flight_call_fails_on_kill_and_queue_survives() {
    let runtime = runtime();
    let actor = spawn_counter(
        &runtime,
        ActorOptions {
            max_restarts: 1,
            ..ActorOptions::default()
        },
    );
    let sleep = runtime.actor_method("sleep").unwrap();
    let increment = runtime.actor_method("increment").unwrap();

    let in_flight = runtime
        .call_actor(&sleep, &actor, Vec::new(), CallOptions::default())
        .unwrap();
    let queued = runtime
        .call_actor(
            &increment,
            &actor,
            vec![TaskArg::Value(vec![1])],
            CallOptions::default(),
        )
        .unwrap();

    // Let the sleep call start executing, then kill mid-flight
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.kill_actor(&actor, false).unwrap();

    let err = runtime.get(&in_flight).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Object(ObjectError::TaskFailed(TaskFailure::ActorRestarting(_)))
    ));

    // The queued call survives the restart
    assert_eq!(as_i64(&runtime.get(&queued).await.unwrap()), 1);
}

#[tokio::test]
async fn test_exhausted_restart_budget_means_dead() {
    let runtime = runtime();
    let actor = spawn_counter(&runtime, ActorOptions::default());
    let value = runtime.actor_method("value").unwrap();

    let probe = runtime
        .call_actor(&value, &actor, Vec::new(), CallOptions::default())
        .unwrap();
    runtime.get(&probe).await.unwrap();

    // no_restart = false, but the default budget is zero
    runtime.kill_actor(&actor, false).unwrap();
    wait_for_state(&runtime, &actor, ActorState::Dead).await;
}

#[tokio::test]
async fn test_named_actor_lookup() {
    let runtime = runtime();
    let actor = spawn_counter(
        &runtime,
        ActorOptions {
            name: Some("tally".to_string()),
            global: true,
            ..ActorOptions::default()
        },
    );

    assert_eq!(runtime.get_actor_id(true, "tally").unwrap(), actor);
    // Wrong namespace
    let err = runtime.get_actor_id(false, "tally").unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Actor(ActorError::NotFound(_))
    ));

    // Permanent death unregisters the name
    runtime.kill_actor(&actor, true).unwrap();
    wait_for_state(&runtime, &actor, ActorState::Dead).await;
    assert!(runtime.get_actor_id(true, "tally").is_err());
}

#[tokio::test]
async fn test_voluntary_exit_is_terminal() {
    let runtime = runtime();
    let actor = spawn_counter(
        &runtime,
        ActorOptions {
            // Budget must not rescue a voluntary exit
            max_restarts: 3,
            ..ActorOptions::default()
        },
    );
    let retire = runtime.actor_method("retire").unwrap();

    let result = runtime
        .call_actor(&retire, &actor, Vec::new(), CallOptions::default())
        .unwrap();
    runtime.get(&result).await.unwrap();

    wait_for_state(&runtime, &actor, ActorState::Dead).await;
}

#[tokio::test]
async fn test_concurrent_methods_are_rejected() {
    let runtime = runtime();
    let ctor = runtime.actor_constructor("Counter").unwrap();
    let err = runtime
        .create_actor(
            &ctor,
            Vec::new(),
            ActorOptions {
                max_concurrency: 4,
                ..ActorOptions::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Task(_)));
}

#[tokio::test]
async fn test_unknown_method_surfaces_as_application_failure() {
    register_functions();
    let catalog = FunctionCatalog::global();
    // A method registered by some other actor type
    catalog.register_actor("Noop", |_args| Ok(Box::new(Noop)), &["noop"]);

    let runtime = Runtime::new(RuntimeConfig {
        spill_enabled: false,
        ..RuntimeConfig::default()
    })
    .unwrap();
    let actor = spawn_counter(&runtime, ActorOptions::default());
    let noop = runtime.actor_method("noop").unwrap();

    let result = runtime
        .call_actor(&noop, &actor, Vec::new(), CallOptions::default())
        .unwrap();
    let err = runtime.get(&result).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Object(ObjectError::TaskFailed(TaskFailure::Application { .. }))
    ));
}

struct Noop;

impl ActorBehavior for Noop {
    fn invoke(
        &mut self,
        _ctx: &mut ActorContext,
        _method: &str,
        _args: &[Payload],
    ) -> anyhow::Result<Payload> {
        Ok(Vec::new())
    }
}
