/// Hard per-task timeout enforcement.
use crate::config::TimingConfig;
use crate::metrics::DelegateMetrics;
use crate::registry::{TaskHandle, TaskRegistry};
use delegate_core::Task;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// How often the watcher looks at the task
    pub poll_interval: Duration,
    /// Added to the task timeout before cancelling
    pub grace: Duration,
    /// How long to wait for the outcome after the loop ends
    pub result_wait: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy {
            poll_interval: Duration::from_secs(5),
            grace: Duration::from_secs(30),
            result_wait: Duration::from_secs(5),
        }
    }
}

impl TimeoutPolicy {
    pub fn from_config(timing: &TimingConfig) -> Self {
        TimeoutPolicy {
            poll_interval: Duration::from_millis(timing.timeout_poll_interval_ms),
            grace: Duration::from_millis(timing.timeout_grace_ms),
            result_wait: Duration::from_millis(timing.timeout_result_wait_ms),
        }
    }
}

/// Watches one executing task until it ends or overruns `timeout + grace`.
///
/// An overrunning task is cancelled. Either way the task is then removed
/// from the executing registry, unless the id has since been resubmitted.
/// Returns true if the task timed out.
pub async fn enforce_task_timeout(
    task: Arc<Task>,
    handle: Arc<TaskHandle>,
    registry: Arc<TaskRegistry>,
    policy: TimeoutPolicy,
    metrics: Arc<DelegateMetrics>,
) -> bool {
    let deadline = task.timeout() + policy.grace;

    while !handle.is_done() && !handle.is_cancelled() && handle.elapsed() < deadline {
        tokio::time::sleep(policy.poll_interval).await;
    }

    let timed_out = !handle.is_done() && !handle.is_cancelled();
    if timed_out {
        error!(
            "Task {} timed out after {:?}, cancelling",
            task.id,
            handle.elapsed()
        );
        handle.cancel();
        metrics.tasks_timed_out.inc();
    }

    match handle.join_within(policy.result_wait).await {
        Some(Err(e)) if e.is_panic() => error!("Task {} panicked: {}", task.id, e),
        Some(Err(e)) => warn!("Task {} ended abnormally: {}", task.id, e),
        Some(Ok(())) => {}
        None if timed_out => warn!(
            "Task {} still running {:?} after cancellation",
            task.id, policy.result_wait
        ),
        None => {}
    }

    registry.finish_execution_if(&task.id, &handle);
    metrics
        .tasks_executing
        .set(registry.executing_count() as i64);
    timed_out
}
