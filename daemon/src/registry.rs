/// In-flight task registry.
///
/// Two map pairs keyed by task id: validating and executing, each paired with
/// the cancelable handle of the work running for it. A task id is live in at
/// most one of the two phases. A separate acquiring set suppresses duplicate
/// events while a task is between the event and the validate/execute phase.
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use delegate_core::Task;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancelable handle to work submitted to a pool.
#[derive(Debug)]
pub struct TaskHandle {
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
    submitted_at: Instant,
}

impl TaskHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        TaskHandle {
            cancel,
            join: Mutex::new(None),
            submitted_at: Instant::now(),
        }
    }

    /// Binds the spawned work to this handle.
    pub fn attach(&self, join: JoinHandle<()>) {
        *self.join.lock() = Some(join);
    }

    /// Requests cancellation. Safe on finished work.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the spawned work has returned.
    pub fn is_done(&self) -> bool {
        self.join
            .lock()
            .as_ref()
            .map_or(false, |join| join.is_finished())
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits up to `wait` for the work's outcome.
    ///
    /// Returns `None` when the work was never attached, was already joined,
    /// or did not finish in time.
    pub async fn join_within(&self, wait: Duration) -> Option<Result<(), JoinError>> {
        let join = self.join.lock().take()?;
        tokio::time::timeout(wait, join).await.ok()
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    validating: DashMap<String, Arc<Task>>,
    validating_futures: DashMap<String, Arc<TaskHandle>>,
    executing: DashMap<String, Arc<Task>>,
    executing_futures: DashMap<String, Arc<TaskHandle>>,
    acquiring: DashSet<String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Present in either the validating or executing phase.
    pub fn is_live(&self, task_id: &str) -> bool {
        self.validating.contains_key(task_id)
            || self.validating_futures.contains_key(task_id)
            || self.executing.contains_key(task_id)
            || self.executing_futures.contains_key(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.validating.len() + self.executing.len()
    }

    // ============================================================================
    // ACQUIRING
    // ============================================================================

    /// Marks the task as being acquired. False if it already was.
    pub fn begin_acquiring(&self, task_id: &str) -> bool {
        self.acquiring.insert(task_id.to_string())
    }

    pub fn end_acquiring(&self, task_id: &str) {
        self.acquiring.remove(task_id);
    }

    pub fn is_acquiring(&self, task_id: &str) -> bool {
        self.acquiring.contains(task_id)
    }

    // ============================================================================
    // VALIDATING
    // ============================================================================

    /// Enters the validating phase. False if the task is already live.
    pub fn begin_validation(&self, task: Arc<Task>, handle: Arc<TaskHandle>) -> bool {
        if self.executing.contains_key(&task.id) || self.executing_futures.contains_key(&task.id) {
            return false;
        }
        match self.validating.entry(task.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.validating_futures.insert(task.id.clone(), handle);
                slot.insert(task);
                true
            }
        }
    }

    pub fn finish_validation(&self, task_id: &str) {
        self.validating.remove(task_id);
        self.validating_futures.remove(task_id);
    }

    pub fn is_validating(&self, task_id: &str) -> bool {
        self.validating.contains_key(task_id)
    }

    pub fn validating_count(&self) -> usize {
        self.validating.len()
    }

    // ============================================================================
    // EXECUTING
    // ============================================================================

    /// Records the handle of a submission. Only the first one is kept.
    pub fn track_execution(&self, task_id: &str, handle: Arc<TaskHandle>) -> bool {
        if self.executing.contains_key(task_id) || self.validating.contains_key(task_id) {
            return false;
        }
        match self.executing_futures.entry(task_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Claims the executing slot. False if the task already holds it.
    pub fn begin_execution(&self, task: Arc<Task>) -> bool {
        if self.validating.contains_key(&task.id) {
            return false;
        }
        match self.executing.entry(task.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(task);
                true
            }
        }
    }

    /// Drops all executing state for the task. Idempotent.
    pub fn finish_execution(&self, task_id: &str) {
        self.executing.remove(task_id);
        self.executing_futures.remove(task_id);
    }

    /// Like [`TaskRegistry::finish_execution`], but only while `handle` is
    /// still the tracked submission. A later submission of the same id is left
    /// alone. Returns true if anything was removed.
    pub fn finish_execution_if(&self, task_id: &str, handle: &Arc<TaskHandle>) -> bool {
        let ours = self
            .executing_futures
            .remove_if(task_id, |_, tracked| Arc::ptr_eq(tracked, handle))
            .is_some();
        if ours || !self.executing_futures.contains_key(task_id) {
            return self.executing.remove(task_id).is_some() || ours;
        }
        false
    }

    pub fn is_executing(&self, task_id: &str) -> bool {
        self.executing.contains_key(task_id)
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    /// Executing or submitted and waiting for a pool slot.
    pub fn has_executing(&self) -> bool {
        !self.executing.is_empty() || !self.executing_futures.is_empty()
    }

    pub fn execution_handle(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.executing_futures
            .get(task_id)
            .map(|h| Arc::clone(h.value()))
    }

    pub fn is_empty(&self) -> bool {
        self.validating.is_empty()
            && self.validating_futures.is_empty()
            && self.executing.is_empty()
            && self.executing_futures.is_empty()
    }

    // ============================================================================
    // ABORT
    // ============================================================================

    /// Cancels and forgets the task in whatever phase it is in.
    ///
    /// Returns true if anything was found. Unknown ids are a no-op.
    pub fn abort(&self, task_id: &str) -> bool {
        let mut found = self.validating.remove(task_id).is_some();
        if let Some((_, handle)) = self.validating_futures.remove(task_id) {
            handle.cancel();
            found = true;
        }
        if let Some((_, handle)) = self.executing_futures.remove(task_id) {
            handle.cancel();
            found = true;
        }
        found |= self.executing.remove(task_id).is_some();
        if found {
            debug!("Removed task {} from registry", task_id);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Arc<Task> {
        Arc::new(Task::new(id, "acc", "HTTP"))
    }

    fn handle() -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(CancellationToken::new()))
    }

    #[test]
    fn test_abort_unknown_is_noop() {
        let registry = TaskRegistry::new();
        assert!(!registry.abort("missing"));
        assert!(registry.is_empty());
        assert!(!registry.abort("missing"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_abort_cancels_validation() {
        let registry = TaskRegistry::new();
        let h = handle();
        assert!(registry.begin_validation(task("t1"), h.clone()));
        assert!(registry.is_live("t1"));

        assert!(registry.abort("t1"));
        assert!(h.is_cancelled());
        assert!(!registry.is_live("t1"));
    }

    #[test]
    fn test_finish_execution_if_matches_handle() {
        let registry = TaskRegistry::new();
        let first = handle();
        assert!(registry.track_execution("t1", first.clone()));
        assert!(registry.begin_execution(task("t1")));
        registry.finish_execution("t1");

        let second = handle();
        assert!(registry.track_execution("t1", second.clone()));
        assert!(registry.begin_execution(task("t1")));

        assert!(!registry.finish_execution_if("t1", &first));
        assert!(registry.is_executing("t1"));

        assert!(registry.finish_execution_if("t1", &second));
        assert!(registry.is_empty());
        assert!(!registry.finish_execution_if("t1", &second));
    }

    #[test]
    fn test_single_phase_invariant() {
        let registry = TaskRegistry::new();
        assert!(registry.begin_validation(task("t1"), handle()));
        assert!(!registry.track_execution("t1", handle()));
        assert!(!registry.begin_execution(task("t1")));

        registry.finish_validation("t1");
        assert!(registry.track_execution("t1", handle()));
        assert!(registry.begin_execution(task("t1")));
        assert!(!registry.begin_validation(task("t1"), handle()));
    }

    #[test]
    fn test_only_first_execution_tracked() {
        let registry = TaskRegistry::new();
        let first = handle();
        assert!(registry.track_execution("t1", first.clone()));
        assert!(!registry.track_execution("t1", handle()));
        let tracked = registry.execution_handle("t1").unwrap();
        assert!(Arc::ptr_eq(&tracked, &first));

        assert!(registry.begin_execution(task("t1")));
        assert!(!registry.begin_execution(task("t1")));
        assert_eq!(registry.executing_count(), 1);

        registry.finish_execution("t1");
        registry.finish_execution("t1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_acquiring_set() {
        let registry = TaskRegistry::new();
        assert!(registry.begin_acquiring("t1"));
        assert!(!registry.begin_acquiring("t1"));
        assert!(registry.is_acquiring("t1"));
        registry.end_acquiring("t1");
        assert!(registry.begin_acquiring("t1"));
    }

    #[tokio::test]
    async fn test_handle_lifecycle() {
        let h = TaskHandle::new(CancellationToken::new());
        assert!(!h.is_done());
        assert!(h.join_within(Duration::from_millis(10)).await.is_none());

        h.attach(tokio::spawn(async {}));
        tokio::task::yield_now().await;
        let outcome = h.join_within(Duration::from_secs(1)).await;
        assert!(matches!(outcome, Some(Ok(()))));

        // cancelling finished work is harmless
        h.cancel();
        assert!(h.is_cancelled());
    }
}
