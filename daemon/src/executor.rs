/// Task execution: submission to a pool, the execution hooks, and status
/// reporting back to the manager.
use crate::manager::ManagerHandle;
use crate::metrics::DelegateMetrics;
use crate::pool::ExecutorPools;
use crate::registry::{TaskHandle, TaskRegistry};
use crate::timeout::{enforce_task_timeout, TimeoutPolicy};
use async_trait::async_trait;
use delegate_core::{
    DelegateRunnableTask, ExecutionHooks, Task, TaskContext, TaskError, TaskFactoryRegistry,
    TaskResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Retry policy for `send_task_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StatusRetryPolicy {
    fn default() -> Self {
        StatusRetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

/// Execution hooks backed by the registry and the manager.
pub struct ExecutionReporter {
    manager: Arc<ManagerHandle>,
    registry: Arc<TaskRegistry>,
    retry: StatusRetryPolicy,
    metrics: Arc<DelegateMetrics>,
}

impl ExecutionReporter {
    pub fn new(
        manager: Arc<ManagerHandle>,
        registry: Arc<TaskRegistry>,
        retry: StatusRetryPolicy,
        metrics: Arc<DelegateMetrics>,
    ) -> Self {
        ExecutionReporter {
            manager,
            registry,
            retry,
            metrics,
        }
    }

    /// Sends the response, retrying on failure. Never errors; a response
    /// that cannot be delivered is logged as lost.
    pub async fn send_response(&self, task_id: &str, response: TaskResponse) -> bool {
        for attempt in 1..=self.retry.attempts {
            match self.manager.send_task_status(task_id, response.clone()).await {
                Ok(()) => {
                    debug!("Task {} response sent (attempt {})", task_id, attempt);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Failed to send response for task {} (attempt {}/{}): {}",
                        task_id, attempt, self.retry.attempts, e
                    );
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }
        error!(
            "Response for task {} lost after {} attempts",
            task_id, self.retry.attempts
        );
        false
    }

    fn update_gauge(&self) {
        self.metrics
            .tasks_executing
            .set(self.registry.executing_count() as i64);
    }
}

#[async_trait]
impl ExecutionHooks for ExecutionReporter {
    fn on_before_execute(&self, task: &Task) -> bool {
        let claimed = self.registry.begin_execution(Arc::new(task.clone()));
        self.update_gauge();
        claimed
    }

    async fn on_after_execute(&self, task: &Task, response: TaskResponse) {
        self.registry.finish_execution(&task.id);
        self.update_gauge();
        self.metrics.record_completion(response.is_success());
        info!(
            "Task {} finished with {:?}, reporting status",
            task.id, response.response_code
        );
        self.send_response(&task.id, response).await;
    }
}

pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    factories: Arc<TaskFactoryRegistry>,
    pools: Arc<ExecutorPools>,
    hooks: Arc<dyn ExecutionHooks>,
    timeout_policy: TimeoutPolicy,
    metrics: Arc<DelegateMetrics>,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        factories: Arc<TaskFactoryRegistry>,
        pools: Arc<ExecutorPools>,
        hooks: Arc<dyn ExecutionHooks>,
        timeout_policy: TimeoutPolicy,
        metrics: Arc<DelegateMetrics>,
    ) -> Self {
        TaskExecutor {
            registry,
            factories,
            pools,
            hooks,
            timeout_policy,
            metrics,
        }
    }

    /// Submits an acquired task for execution.
    ///
    /// Returns false (and does nothing) if the task is already executing.
    pub fn execute_task(&self, task: Task) -> bool {
        let task = Arc::new(task);
        if self.registry.is_executing(&task.id) || self.registry.execution_handle(&task.id).is_some() {
            info!("Task {} is already being executed", task.id);
            return false;
        }

        let runnable = match self.factories.runnable(&task) {
            Ok(runnable) => runnable,
            Err(e) => {
                error!("Unable to build runnable for task {}: {}", task.id, e);
                let hooks = Arc::clone(&self.hooks);
                let response = TaskResponse::failed(task.account_id.clone(), e.to_string());
                tokio::spawn(async move { hooks.on_after_execute(&task, response).await });
                return false;
            }
        };

        let cancel = CancellationToken::new();
        let handle = Arc::new(TaskHandle::new(cancel.clone()));
        if !self.registry.track_execution(&task.id, Arc::clone(&handle)) {
            info!("Task {} is already being executed", task.id);
            return false;
        }

        let pool = self.pools.for_task(&task);
        debug!("Submitting task {} to the {} pool", task.id, pool.kind());
        let job = run_task(
            Arc::clone(&task),
            runnable,
            Arc::clone(&self.hooks),
            cancel.clone(),
        )
        .instrument(info_span!("task", task_id = %task.id));
        handle.attach(pool.submit(cancel, job));

        tokio::spawn(enforce_task_timeout(
            task,
            handle,
            Arc::clone(&self.registry),
            self.timeout_policy,
            Arc::clone(&self.metrics),
        ));
        true
    }
}

async fn run_task(
    task: Arc<Task>,
    runnable: Box<dyn DelegateRunnableTask>,
    hooks: Arc<dyn ExecutionHooks>,
    cancel: CancellationToken,
) {
    if !hooks.on_before_execute(&task) {
        warn!("Unable to execute task {}, already executing", task.id);
        return;
    }

    let ctx = TaskContext::new(Arc::clone(&task), cancel.clone());
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TaskError::Cancelled),
        result = runnable.run(&ctx) => result,
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!("Task {} failed: {}", task.id, e);
            TaskResponse::failed(task.account_id.clone(), e.to_string())
        }
    };
    hooks.on_after_execute(&task, response).await;
}
