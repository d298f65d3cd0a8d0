/// Validation and acquisition pipeline.
///
/// Every task event, pushed or polled, enters through [`TaskDispatcher::dispatch`].
/// Available events are acquired, validated when the manager has not
/// assigned them yet, and handed to the executor once this worker is the
/// assignee. Abort events skip all of that and cancel whatever is running.
use crate::executor::TaskExecutor;
use crate::manager::ManagerHandle;
use crate::metrics::DelegateMetrics;
use crate::pool::ExecutorPools;
use crate::registry::{TaskHandle, TaskRegistry};
use crate::state::AgentState;
use delegate_core::{
    is_validated, AgentSession, Task, TaskContext, TaskEvent, TaskFactoryRegistry,
    ValidationResult,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Knobs of the pipeline.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Delay per in-flight task before acquiring
    pub throttle_step: Duration,
    /// In-flight count at which the delay stops growing
    pub throttle_cap: usize,
    /// Poll interval of the intake, part of the fairness delay
    pub poll_interval: Duration,
    /// Added to the poll interval after a failed validation
    pub fairness_extra: Duration,
    /// Accepted task types; empty accepts all
    pub supported_task_types: HashSet<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            throttle_step: Duration::from_millis(100),
            throttle_cap: 10,
            poll_interval: Duration::from_secs(3),
            fairness_extra: Duration::from_secs(3),
            supported_task_types: HashSet::new(),
        }
    }
}

impl DispatchConfig {
    /// Backpressure delay applied before acquiring.
    pub fn throttle_delay(&self, in_flight: usize) -> Duration {
        self.throttle_step * in_flight.min(self.throttle_cap) as u32
    }

    pub fn fairness_delay(&self) -> Duration {
        self.poll_interval + self.fairness_extra
    }
}

/// How the pipeline ended for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the executor
    Executing,
    /// Already claimed elsewhere or expired
    Gone,
    /// Another worker was chosen
    NotSelected,
    /// No criterion validated
    Rejected,
    /// Abort arrived while validating
    Aborted,
    /// Acquisition or reporting failed
    Failed(String),
    /// Refused before acquisition
    Dropped(String),
}

pub struct TaskDispatcher {
    session: Arc<AgentSession>,
    state: Arc<AgentState>,
    manager: Arc<ManagerHandle>,
    registry: Arc<TaskRegistry>,
    factories: Arc<TaskFactoryRegistry>,
    pools: Arc<ExecutorPools>,
    executor: Arc<TaskExecutor>,
    metrics: Arc<DelegateMetrics>,
    config: DispatchConfig,
}

impl TaskDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<AgentSession>,
        state: Arc<AgentState>,
        manager: Arc<ManagerHandle>,
        registry: Arc<TaskRegistry>,
        factories: Arc<TaskFactoryRegistry>,
        pools: Arc<ExecutorPools>,
        executor: Arc<TaskExecutor>,
        metrics: Arc<DelegateMetrics>,
        config: DispatchConfig,
    ) -> Self {
        TaskDispatcher {
            session,
            state,
            manager,
            registry,
            factories,
            pools,
            executor,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Entry point for every task event. Never blocks the caller.
    pub fn dispatch(self: &Arc<Self>, event: TaskEvent) {
        if event.delegate_task_id.is_empty() {
            warn!("Ignoring task event without a task id");
            return;
        }
        if event.is_abort() {
            self.abort(&event.delegate_task_id);
            return;
        }
        if let Err(reason) = self.admit(&event) {
            info!("Dropping task {}: {}", event.delegate_task_id, reason);
            self.metrics.tasks_rejected.inc();
            return;
        }

        let task_id = event.delegate_task_id.clone();
        if !self.registry.begin_acquiring(&task_id) {
            debug!("Task {} is already being acquired", task_id);
            return;
        }

        let this = Arc::clone(self);
        let span = info_span!("task", task_id = %task_id);
        tokio::spawn(
            async move {
                let outcome = this.process(&task_id).await;
                debug!("Task {} dispatch ended: {:?}", task_id, outcome);
                this.registry.end_acquiring(&task_id);
            }
            .instrument(span),
        );
    }

    /// Checks that run before anything is acquired.
    fn admit(&self, event: &TaskEvent) -> Result<(), String> {
        self.state.admit(event.sync).map_err(|r| r.to_string())?;

        if let Some(task_type) = &event.task_type {
            let unsupported = !self.factories.supports(task_type)
                || (!self.config.supported_task_types.is_empty()
                    && !self.config.supported_task_types.contains(task_type));
            if unsupported {
                return Err(format!("unsupported task type {}", task_type));
            }
        }

        if self.registry.is_live(&event.delegate_task_id) {
            return Err("already validating or executing".to_string());
        }
        Ok(())
    }

    /// Runs the pipeline for an admitted task id.
    pub async fn process(&self, task_id: &str) -> DispatchOutcome {
        if self.registry.is_live(task_id) {
            return DispatchOutcome::Dropped("already validating or executing".to_string());
        }

        let delay = self.config.throttle_delay(self.registry.in_flight_count());
        if !delay.is_zero() {
            debug!("Throttling acquisition of task {} by {:?}", task_id, delay);
            tokio::time::sleep(delay).await;
        }

        let task = match self.manager.acquire_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                info!("Task {} no longer available", task_id);
                return DispatchOutcome::Gone;
            }
            Err(e) => {
                warn!("Unable to acquire task {}: {}", task_id, e);
                return DispatchOutcome::Failed(e.to_string());
            }
        };
        self.metrics.tasks_acquired.inc();

        if task.is_unassigned() {
            self.validate_and_claim(task).await
        } else if task.is_assigned_to(self.session.delegate_id()) {
            info!("Task {} is whitelisted for this delegate, executing", task.id);
            self.execute(task)
        } else {
            info!(
                "Task {} is assigned to delegate {:?}, dropping",
                task.id, task.delegate_id
            );
            DispatchOutcome::NotSelected
        }
    }

    async fn validate_and_claim(&self, task: Task) -> DispatchOutcome {
        let task = Arc::new(task);
        let validator = match self.factories.validator(&task) {
            Ok(validator) => validator,
            Err(e) => {
                warn!("No validator for task {}: {}", task.id, e);
                return DispatchOutcome::Dropped(e.to_string());
            }
        };

        let cancel = CancellationToken::new();
        let handle = Arc::new(TaskHandle::new(cancel.clone()));
        if !self.registry.begin_validation(Arc::clone(&task), Arc::clone(&handle)) {
            return DispatchOutcome::Dropped("already validating or executing".to_string());
        }
        self.metrics
            .tasks_validating
            .set(self.registry.validating_count() as i64);

        info!("Validating task {}", task.id);
        let (tx, rx) = oneshot::channel::<Vec<ValidationResult>>();
        let ctx = TaskContext::new(Arc::clone(&task), cancel.clone());
        let job_cancel = cancel.clone();
        let job = async move {
            tokio::select! {
                biased;
                _ = job_cancel.cancelled() => {}
                results = validator.validate(&ctx) => {
                    let _ = tx.send(results);
                }
            }
        };
        handle.attach(self.pools.for_task(&task).submit(cancel.clone(), job));

        let outcome = tokio::time::timeout(task.timeout(), rx).await;
        self.registry.finish_validation(&task.id);
        self.metrics
            .tasks_validating
            .set(self.registry.validating_count() as i64);

        let results = match outcome {
            Ok(Ok(results)) => results,
            // Sender dropped: the validation was cancelled by an abort
            Ok(Err(_)) => {
                info!("Validation of task {} was aborted", task.id);
                return DispatchOutcome::Aborted;
            }
            Err(_) => {
                warn!("Validation of task {} timed out", task.id);
                handle.cancel();
                Vec::new()
            }
        };

        let validated = is_validated(&results);
        info!(
            "Task {} validation {}: {:?}",
            task.id,
            if validated { "succeeded" } else { "failed" },
            results
        );

        let reply = match self.manager.report_validation_results(&task.id, results).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Unable to report validation results for task {}: {}", task.id, e);
                None
            }
        };

        match reply {
            Some(assigned) if assigned.is_assigned_to(self.session.delegate_id()) => {
                info!("Got the go-ahead to proceed with task {}", assigned.id);
                self.execute(assigned)
            }
            _ if validated => {
                info!("Task {} was assigned to another delegate", task.id);
                DispatchOutcome::NotSelected
            }
            _ => {
                info!(
                    "Task {} did not validate, waiting {:?} before failing it",
                    task.id,
                    self.config.fairness_delay()
                );
                tokio::time::sleep(self.config.fairness_delay()).await;
                if let Err(e) = self.manager.fail_if_all_delegates_failed(&task.id).await {
                    warn!("Unable to fail task {}: {}", task.id, e);
                }
                DispatchOutcome::Rejected
            }
        }
    }

    fn execute(&self, task: Task) -> DispatchOutcome {
        if self.executor.execute_task(task) {
            DispatchOutcome::Executing
        } else {
            DispatchOutcome::Dropped("already executing".to_string())
        }
    }

    /// Cancels and forgets the task, whatever phase it is in.
    pub fn abort(&self, task_id: &str) {
        info!("Aborting task {}", task_id);
        if self.registry.abort(task_id) {
            self.metrics.tasks_aborted.inc();
            self.metrics
                .tasks_executing
                .set(self.registry.executing_count() as i64);
            self.metrics
                .tasks_validating
                .set(self.registry.validating_count() as i64);
        } else {
            debug!("Task {} not found in registry, nothing to abort", task_id);
        }
    }
}
