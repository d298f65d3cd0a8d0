/// Task-type registry: maps a task type name to the factory that builds its
/// runnable and validator.
use crate::errors::{TaskError, TaskResult};
use crate::task::Task;
use crate::traits::{DelegateRunnableTask, DelegateValidateTask, TaskFactory};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct TaskFactoryRegistry {
    factories: DashMap<String, Arc<dyn TaskFactory>>,
}

impl TaskFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one for the same type.
    pub fn register(&self, factory: Arc<dyn TaskFactory>) {
        self.factories
            .insert(factory.task_type().to_string(), factory);
    }

    pub fn with_factory(self, factory: Arc<dyn TaskFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    fn factory(&self, task: &Task) -> TaskResult<Arc<dyn TaskFactory>> {
        self.factories
            .get(&task.task_type)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| TaskError::UnsupportedType(task.task_type.clone()))
    }

    pub fn runnable(&self, task: &Task) -> TaskResult<Box<dyn DelegateRunnableTask>> {
        self.factory(task)?.runnable(task)
    }

    pub fn validator(&self, task: &Task) -> TaskResult<Box<dyn DelegateValidateTask>> {
        self.factory(task)?.validator(task)
    }
}
