use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::{Adapter, CopyAdapter, MultiplyAdapter, NoOpAdapter, SleepAdapter};
use crate::config::CoreConfig;
use crate::models::{CoreError, CoreResult, TaskType};
use crate::persistence::RunStore;

/// Builds an adapter for one step execution. Factories see the process
/// config and the run store so adapters can read settings or prior runs.
pub type AdapterFactory =
    Arc<dyn Fn(&CoreConfig, Arc<dyn RunStore>) -> Arc<dyn Adapter> + Send + Sync>;

#[derive(Clone, Copy)]
pub struct BuiltinAdapter {
    pub tag: &'static str,
    pub summary: &'static str,
    factory: fn(&CoreConfig, Arc<dyn RunStore>) -> Arc<dyn Adapter>,
}

impl BuiltinAdapter {
    pub fn build(&self, config: &CoreConfig, store: Arc<dyn RunStore>) -> Arc<dyn Adapter> {
        (self.factory)(config, store)
    }
}

fn noop(_: &CoreConfig, _: Arc<dyn RunStore>) -> Arc<dyn Adapter> {
    Arc::new(NoOpAdapter)
}

fn copy(_: &CoreConfig, _: Arc<dyn RunStore>) -> Arc<dyn Adapter> {
    Arc::new(CopyAdapter)
}

fn multiply(_: &CoreConfig, _: Arc<dyn RunStore>) -> Arc<dyn Adapter> {
    Arc::new(MultiplyAdapter)
}

fn sleep(_: &CoreConfig, _: Arc<dyn RunStore>) -> Arc<dyn Adapter> {
    Arc::new(SleepAdapter)
}

const BUILTIN_ADAPTERS: [BuiltinAdapter; 4] = [
    BuiltinAdapter {
        tag: "noop",
        summary: "passes the previous result through",
        factory: noop,
    },
    BuiltinAdapter {
        tag: "copy",
        summary: "extracts a value from the previous result by path",
        factory: copy,
    },
    BuiltinAdapter {
        tag: "multiply",
        summary: "multiplies a numeric input by a factor",
        factory: multiply,
    },
    BuiltinAdapter {
        tag: "sleep",
        summary: "waits for a duration, honoring cancellation",
        factory: sleep,
    },
];

pub fn builtin_adapters() -> &'static [BuiltinAdapter] {
    &BUILTIN_ADAPTERS
}

pub fn builtin_adapter(task_type: &TaskType) -> Option<&'static BuiltinAdapter> {
    BUILTIN_ADAPTERS
        .iter()
        .find(|builtin| builtin.tag == task_type.as_str())
}

/// Resolves task type tags to adapters: builtins first, then the factories
/// registered when the registry was built.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    registered: Arc<HashMap<TaskType, AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factories(
        factories: impl IntoIterator<Item = (TaskType, AdapterFactory)>,
    ) -> CoreResult<Self> {
        let mut mapped = HashMap::new();
        for (task_type, factory) in factories {
            if builtin_adapter(&task_type).is_some() || mapped.contains_key(&task_type) {
                return Err(CoreError::invalid_input(format!(
                    "duplicate adapter registration for task type '{task_type}'"
                ))
                .with_task_type(task_type));
            }
            mapped.insert(task_type, factory);
        }

        Ok(Self {
            registered: Arc::new(mapped),
        })
    }

    /// Registers ready-made adapter instances shared by every execution.
    pub fn with_adapters(
        adapters: impl IntoIterator<Item = (TaskType, Arc<dyn Adapter>)>,
    ) -> CoreResult<Self> {
        Self::with_factories(adapters.into_iter().map(|(task_type, adapter)| {
            let factory: AdapterFactory =
                Arc::new(move |_: &CoreConfig, _: Arc<dyn RunStore>| adapter.clone());
            (task_type, factory)
        }))
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        builtin_adapter(task_type).is_some() || self.registered.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut task_types: Vec<TaskType> = BUILTIN_ADAPTERS
            .iter()
            .filter_map(|builtin| TaskType::new(builtin.tag).ok())
            .chain(self.registered.keys().cloned())
            .collect();
        task_types.sort();
        task_types
    }

    pub fn resolve(
        &self,
        task_type: &TaskType,
        config: &CoreConfig,
        store: Arc<dyn RunStore>,
    ) -> CoreResult<Arc<dyn Adapter>> {
        if let Some(builtin) = builtin_adapter(task_type) {
            return Ok(builtin.build(config, store));
        }
        self.registered
            .get(task_type)
            .map(|factory| factory(config, store))
            .ok_or_else(|| CoreError::unknown_adapter(task_type))
    }
}
