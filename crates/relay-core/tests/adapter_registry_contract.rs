use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use relay_core::adapters::{Adapter, AdapterResult, RunContext};
use relay_core::config::CoreConfig;
use relay_core::models::{
    CoreErrorKind, InitiatorParams, InitiatorRequest, JobSpecRequest, RunStatus, TaskParams,
    TaskSpecRequest, TaskType, TriggerEvent, WebParams,
};
use relay_core::orchestration::RunEngine;
use relay_core::persistence::{InMemoryStore, RunStore};
use relay_core::registry::{AdapterFactory, AdapterRegistry, builtin_adapter, builtin_adapters};

/// Reports how many runs its own job spec has, read through the store it
/// was built with.
struct RunCounter {
    store: Arc<dyn RunStore>,
}

#[async_trait]
impl Adapter for RunCounter {
    async fn run(&self, _params: &TaskParams, context: &RunContext) -> AdapterResult<Value> {
        let runs = self.store.list_job_runs(context.job_spec_id)?;
        Ok(json!(runs.len()))
    }
}

fn run_counter_factory() -> AdapterFactory {
    Arc::new(|_: &CoreConfig, store: Arc<dyn RunStore>| {
        Arc::new(RunCounter { store }) as Arc<dyn Adapter>
    })
}

fn tag(raw: &str) -> TaskType {
    TaskType::new(raw).expect("valid tag")
}

#[test]
fn builtin_table_covers_the_shipped_adapters() {
    let tags: Vec<&str> = builtin_adapters().iter().map(|entry| entry.tag).collect();
    assert_eq!(tags, vec!["noop", "copy", "multiply", "sleep"]);

    assert!(builtin_adapter(&tag("NoOp")).is_some());
    assert!(builtin_adapter(&tag("httpget")).is_none());
}

#[test]
fn registrations_cannot_shadow_builtins_or_each_other() {
    let error = AdapterRegistry::with_factories([(tag("noop"), run_counter_factory())])
        .err()
        .expect("builtin collision");
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert_eq!(error.task_type, Some(tag("noop")));

    let error = AdapterRegistry::with_factories([
        (tag("count"), run_counter_factory()),
        (tag("COUNT"), run_counter_factory()),
    ])
    .err()
    .expect("duplicate registration");
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[test]
fn unknown_tags_fail_to_resolve() {
    let registry = AdapterRegistry::with_factories([(tag("count"), run_counter_factory())])
        .expect("registry");
    let store: Arc<dyn RunStore> = Arc::new(InMemoryStore::new());

    assert!(registry.contains(&tag("count")));
    assert!(registry.contains(&tag("sleep")));
    assert!(
        registry
            .resolve(&tag("count"), &CoreConfig::default(), store.clone())
            .is_ok()
    );

    let error = registry
        .resolve(&tag("bridge"), &CoreConfig::default(), store)
        .err()
        .expect("unknown tag");
    assert_eq!(error.kind, CoreErrorKind::UnknownAdapter);
    assert_eq!(error.task_type, Some(tag("bridge")));
}

#[tokio::test]
async fn registered_factories_receive_the_engine_store() {
    let registry = AdapterRegistry::with_factories([(tag("count"), run_counter_factory())])
        .expect("registry");
    let engine = RunEngine::with_store(
        Arc::new(InMemoryStore::new()),
        registry,
        CoreConfig::default(),
    );
    let spec = engine
        .create_job_spec(JobSpecRequest {
            initiators: vec![InitiatorRequest::new(InitiatorParams::Web(WebParams {}))],
            tasks: vec![TaskSpecRequest::new("Count", json!({}))],
            ..JobSpecRequest::default()
        })
        .await
        .expect("create spec");

    for expected in 1..=2 {
        let outcome = engine
            .fire(spec.id, spec.initiators[0].id, TriggerEvent::unique())
            .await
            .expect("fire");
        let run = outcome.created().expect("new run").clone();
        let finished = engine.execute(run.id).await.expect("execute");

        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.result, Some(json!(expected)));
    }
}
