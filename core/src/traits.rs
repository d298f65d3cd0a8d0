/// Contracts at the seams of the agent: the manager client and the per-task
/// runnable/validator interfaces.
use crate::errors::{ManagerResult, TaskResult};
use crate::task::{ScriptBundle, Task, TaskEvent, TaskResponse, ValidationResult};
use crate::wire::{
    ConnectionHeartbeat, DelegateParams, DelegateRegisterResponse, HeartbeatResponse,
    ProfileParams,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Outbound calls to the manager.
///
/// A 2xx answer is success. Calls returning `Option` use `None` for an empty
/// resource, which is a normal outcome (task gone, not selected, no upgrade).
#[async_trait]
pub trait ManagerClient: Send + Sync {
    async fn register(&self, params: &DelegateParams) -> ManagerResult<DelegateRegisterResponse>;

    async fn unregister(&self, params: &DelegateParams) -> ManagerResult<()>;

    async fn heartbeat(&self, params: &DelegateParams) -> ManagerResult<HeartbeatResponse>;

    async fn connection_heartbeat(
        &self,
        delegate_id: &str,
        account_id: &str,
        heartbeat: &ConnectionHeartbeat,
    ) -> ManagerResult<()>;

    async fn poll_task_events(&self, delegate_id: &str, account_id: &str) -> ManagerResult<Vec<TaskEvent>>;

    async fn acquire_task(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
    ) -> ManagerResult<Option<Task>>;

    async fn report_validation_results(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
        results: &[ValidationResult],
    ) -> ManagerResult<Option<Task>>;

    async fn fail_if_all_delegates_failed(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
    ) -> ManagerResult<()>;

    async fn send_task_status(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
        response: &TaskResponse,
    ) -> ManagerResult<()>;

    async fn get_upgrade_scripts(&self, account_id: &str, version: &str) -> ManagerResult<Option<ScriptBundle>>;

    async fn get_delegate_scripts(&self, account_id: &str, version: &str) -> ManagerResult<Option<ScriptBundle>>;

    async fn check_for_profile(
        &self,
        delegate_id: &str,
        account_id: &str,
        profile_id: &str,
        last_updated_at: i64,
    ) -> ManagerResult<Option<ProfileParams>>;

    async fn save_profile_result(
        &self,
        delegate_id: &str,
        account_id: &str,
        error: bool,
        content: String,
    ) -> ManagerResult<()>;
}

/// What a runnable or validator sees of its task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Arc<Task>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task: Arc<Task>, cancel: CancellationToken) -> Self {
        TaskContext { task, cancel }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Cancellation is advisory; long-running work should poll this.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Runs one task type.
#[async_trait]
pub trait DelegateRunnableTask: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> TaskResult<TaskResponse>;
}

/// Probes whether this worker can run a task.
#[async_trait]
pub trait DelegateValidateTask: Send + Sync {
    async fn validate(&self, ctx: &TaskContext) -> Vec<ValidationResult>;
}

/// Builds runnables and validators for one task type.
pub trait TaskFactory: Send + Sync {
    fn task_type(&self) -> &str;

    fn runnable(&self, task: &Task) -> TaskResult<Box<dyn DelegateRunnableTask>>;

    fn validator(&self, task: &Task) -> TaskResult<Box<dyn DelegateValidateTask>>;
}

/// Lifecycle callbacks wrapped around every execution.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    /// Claims the task for execution. Returning false skips the run.
    fn on_before_execute(&self, task: &Task) -> bool;

    /// Always called once the run ends, whatever the outcome.
    async fn on_after_execute(&self, task: &Task, response: TaskResponse);
}
