//! Shared fixtures for the delegate integration tests: an in-memory manager,
//! a configurable task type and a fully wired runtime in polling mode.
#![allow(dead_code)]

use async_trait::async_trait;
use delegate_core::{
    AgentIdentity, ConnectionHeartbeat, DelegateParams, DelegateRegisterResponse, DelegateRunnableTask,
    DelegateStatus, DelegateValidateTask, HeartbeatResponse, ManagerClient, ManagerError, ManagerResult,
    MessageStore, MessengerType, ProfileParams, ScriptBundle, Task, TaskContext, TaskError, TaskEvent,
    TaskFactory, TaskFactoryRegistry, TaskResponse, TaskResult, ValidationResult,
};
use delegate_daemon::{
    AgentState, DelegateConfig, DelegateMetrics, DelegateRuntime, StreamFrame,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DELEGATE_ID: &str = "delegate-1";
pub const ACCOUNT_ID: &str = "account-1";
pub const RECORD: &str = "delegate-4242";
pub const PROCESS_ID: &str = "4242";
pub const TEST_TASK: &str = "TEST";

// ============================================================================
// FAKE MANAGER
// ============================================================================

/// In-memory manager recording every call it receives.
#[derive(Default)]
pub struct FakeManager {
    /// Tasks handed out by `acquire_task`
    pub tasks: Mutex<HashMap<String, Task>>,
    /// Delegate the task is assigned to once validation results arrive
    pub assign_on_validation: Mutex<Option<String>>,
    /// Scripted register answers; success with `DELEGATE_ID` once drained
    pub register_responses: Mutex<VecDeque<ManagerResult<DelegateRegisterResponse>>>,
    pub register_calls: Mutex<Vec<Instant>>,
    pub unregister_calls: AtomicUsize,
    pub heartbeat_status: Mutex<DelegateStatus>,
    pub heartbeats: AtomicUsize,
    pub connection_heartbeats: AtomicUsize,
    /// Returned once by the next poll
    pub pending_events: Mutex<Vec<TaskEvent>>,
    pub acquires: Mutex<Vec<String>>,
    pub validations: Mutex<Vec<(String, Vec<ValidationResult>)>>,
    pub failed_everywhere: Mutex<Vec<String>>,
    /// Failures returned by `send_task_status` before it succeeds
    pub status_failures: AtomicUsize,
    pub status_attempts: AtomicUsize,
    pub statuses: Mutex<Vec<(String, TaskResponse)>>,
    pub upgrade: Mutex<Option<ScriptBundle>>,
    pub delegate_scripts: Mutex<Option<ScriptBundle>>,
    pub profile: Mutex<Option<ProfileParams>>,
    pub profile_results: Mutex<Vec<(bool, String)>>,
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeManager::default())
    }

    pub fn add_task(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    pub fn statuses(&self) -> Vec<(String, TaskResponse)> {
        self.statuses.lock().clone()
    }

    pub fn acquires(&self) -> Vec<String> {
        self.acquires.lock().clone()
    }
}

#[async_trait]
impl ManagerClient for FakeManager {
    async fn register(&self, _params: &DelegateParams) -> ManagerResult<DelegateRegisterResponse> {
        self.register_calls.lock().push(Instant::now());
        match self.register_responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(DelegateRegisterResponse {
                delegate_id: Some(DELEGATE_ID.to_string()),
                ..DelegateRegisterResponse::default()
            }),
        }
    }

    async fn unregister(&self, _params: &DelegateParams) -> ManagerResult<()> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn heartbeat(&self, params: &DelegateParams) -> ManagerResult<HeartbeatResponse> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(HeartbeatResponse {
            delegate_id: params.delegate_id.clone().unwrap_or_default(),
            status: *self.heartbeat_status.lock(),
        })
    }

    async fn connection_heartbeat(
        &self,
        _delegate_id: &str,
        _account_id: &str,
        _heartbeat: &ConnectionHeartbeat,
    ) -> ManagerResult<()> {
        self.connection_heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_task_events(&self, _delegate_id: &str, _account_id: &str) -> ManagerResult<Vec<TaskEvent>> {
        Ok(std::mem::take(&mut *self.pending_events.lock()))
    }

    async fn acquire_task(
        &self,
        _delegate_id: &str,
        task_id: &str,
        _account_id: &str,
    ) -> ManagerResult<Option<Task>> {
        self.acquires.lock().push(task_id.to_string());
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    async fn report_validation_results(
        &self,
        _delegate_id: &str,
        task_id: &str,
        _account_id: &str,
        results: &[ValidationResult],
    ) -> ManagerResult<Option<Task>> {
        self.validations
            .lock()
            .push((task_id.to_string(), results.to_vec()));
        let assignee = self.assign_on_validation.lock().clone();
        Ok(assignee.and_then(|delegate_id| {
            self.tasks
                .lock()
                .get(task_id)
                .cloned()
                .map(|task| task.with_delegate(delegate_id))
        }))
    }

    async fn fail_if_all_delegates_failed(
        &self,
        _delegate_id: &str,
        task_id: &str,
        _account_id: &str,
    ) -> ManagerResult<()> {
        self.failed_everywhere.lock().push(task_id.to_string());
        Ok(())
    }

    async fn send_task_status(
        &self,
        _delegate_id: &str,
        task_id: &str,
        _account_id: &str,
        response: &TaskResponse,
    ) -> ManagerResult<()> {
        self.status_attempts.fetch_add(1, Ordering::SeqCst);
        let failures = self.status_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.status_failures.store(failures - 1, Ordering::SeqCst);
            return Err(ManagerError::ConnectionError("connection reset".to_string()));
        }
        self.statuses
            .lock()
            .push((task_id.to_string(), response.clone()));
        Ok(())
    }

    async fn get_upgrade_scripts(&self, _account_id: &str, _version: &str) -> ManagerResult<Option<ScriptBundle>> {
        Ok(self.upgrade.lock().clone())
    }

    async fn get_delegate_scripts(&self, _account_id: &str, _version: &str) -> ManagerResult<Option<ScriptBundle>> {
        Ok(self.delegate_scripts.lock().clone())
    }

    async fn check_for_profile(
        &self,
        _delegate_id: &str,
        _account_id: &str,
        _profile_id: &str,
        _last_updated_at: i64,
    ) -> ManagerResult<Option<ProfileParams>> {
        Ok(self.profile.lock().take())
    }

    async fn save_profile_result(
        &self,
        _delegate_id: &str,
        _account_id: &str,
        error: bool,
        content: String,
    ) -> ManagerResult<()> {
        self.profile_results.lock().push((error, content));
        Ok(())
    }
}

// ============================================================================
// TEST TASK TYPE
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum RunBehavior {
    Succeed,
    Fail,
    /// Runs until cancelled
    Hang,
    Sleep(Duration),
}

/// Task type whose validation and run outcome are fixed up front.
pub struct TestFactory {
    pub validated: bool,
    pub validation_delay: Option<Duration>,
    pub behavior: RunBehavior,
    pub runs: Arc<AtomicUsize>,
}

impl TestFactory {
    pub fn new(behavior: RunBehavior) -> Self {
        TestFactory {
            validated: true,
            validation_delay: None,
            behavior,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn rejecting(mut self) -> Self {
        self.validated = false;
        self
    }

    pub fn with_validation_delay(mut self, delay: Duration) -> Self {
        self.validation_delay = Some(delay);
        self
    }
}

impl TaskFactory for TestFactory {
    fn task_type(&self) -> &str {
        TEST_TASK
    }

    fn runnable(&self, _task: &Task) -> TaskResult<Box<dyn DelegateRunnableTask>> {
        Ok(Box::new(TestRunnable {
            behavior: self.behavior,
            runs: Arc::clone(&self.runs),
        }))
    }

    fn validator(&self, _task: &Task) -> TaskResult<Box<dyn DelegateValidateTask>> {
        Ok(Box::new(TestValidator {
            validated: self.validated,
            delay: self.validation_delay,
        }))
    }
}

struct TestRunnable {
    behavior: RunBehavior,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl DelegateRunnableTask for TestRunnable {
    async fn run(&self, ctx: &TaskContext) -> TaskResult<TaskResponse> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            RunBehavior::Succeed => {}
            RunBehavior::Fail => return Err(TaskError::ExecutionError("boom".to_string())),
            RunBehavior::Hang => {
                ctx.cancelled().await;
                return Err(TaskError::Cancelled);
            }
            RunBehavior::Sleep(duration) => tokio::time::sleep(duration).await,
        }
        Ok(TaskResponse::ok(
            ctx.task().account_id.clone(),
            json!({"ran": ctx.task().id}),
        ))
    }
}

struct TestValidator {
    validated: bool,
    delay: Option<Duration>,
}

#[async_trait]
impl DelegateValidateTask for TestValidator {
    async fn validate(&self, _ctx: &TaskContext) -> Vec<ValidationResult> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        vec![ValidationResult::new("reachable", self.validated)]
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub fn test_config(dir: &Path) -> DelegateConfig {
    let mut config = DelegateConfig::default();
    config.manager.url = "http://127.0.0.1:1/api/".to_string();
    config.manager.account_id = ACCOUNT_ID.to_string();
    config.manager.account_secret = "secret".to_string();
    config.agent.polling_mode = true;
    config.agent.working_dir = dir.join("work");
    config.store.dir = dir.join("store");
    config.timing.status_retry_delay_ms = 10;
    config
}

pub fn unassigned(id: &str) -> Task {
    Task::new(id, ACCOUNT_ID, TEST_TASK)
}

pub fn assigned(id: &str) -> Task {
    unassigned(id).with_delegate(DELEGATE_ID)
}

/// A registered delegate wired against a [`FakeManager`].
pub struct Harness {
    pub fake: Arc<FakeManager>,
    pub state: Arc<AgentState>,
    pub store: Arc<MessageStore>,
    pub metrics: Arc<DelegateMetrics>,
    pub runtime: DelegateRuntime,
    pub frames: Option<mpsc::Receiver<StreamFrame>>,
    pub config: DelegateConfig,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(fake: Arc<FakeManager>, factory: TestFactory) -> Self {
        Self::with_config(fake, factory, |_| {})
    }

    pub fn with_config(
        fake: Arc<FakeManager>,
        factory: TestFactory,
        adjust: impl FnOnce(&mut DelegateConfig),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);
        std::fs::create_dir_all(&config.agent.working_dir).unwrap();

        let state = Arc::new(AgentState::new());
        let store = Arc::new(
            MessageStore::open(&config.store.dir, MessengerType::Delegate, PROCESS_ID).unwrap(),
        );
        let metrics = Arc::new(DelegateMetrics::new().unwrap());
        let session = Arc::new(
            AgentIdentity::new(ACCOUNT_ID, "test-host", "delegate", "1.0.0").into_session(DELEGATE_ID),
        );
        let factories = Arc::new(TaskFactoryRegistry::new().with_factory(Arc::new(factory)));

        let (runtime, frames) = DelegateRuntime::assemble(
            &config,
            fake.clone(),
            session,
            state.clone(),
            store.clone(),
            RECORD,
            factories,
            metrics.clone(),
        );

        Harness {
            fake,
            state,
            store,
            metrics,
            runtime,
            frames: Some(frames),
            config,
            dir,
        }
    }
}

/// Polls `condition` every 10ms for up to `limit`.
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
