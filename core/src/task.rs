/// Task model: remote work units, the events announcing them, validation
/// results and the responses reported back to the manager.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default task timeout when the manager does not send one.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// A unit of remote work as held by the agent while validating or executing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task id assigned by the manager
    #[serde(rename = "uuid")]
    pub id: String,
    pub account_id: String,
    /// Discriminates which runnable/validator handles the task
    pub task_type: String,
    #[serde(rename = "async", default)]
    pub is_async: bool,
    /// Worker that claimed the task, empty until assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}

impl Task {
    pub fn new(id: impl Into<String>, account_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            account_id: account_id.into(),
            task_type: task_type.into(),
            is_async: false,
            delegate_id: None,
            timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_delegate(mut self, delegate_id: impl Into<String>) -> Self {
        self.delegate_id = Some(delegate_id.into());
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// True while no worker has claimed the task.
    pub fn is_unassigned(&self) -> bool {
        self.delegate_id.as_deref().map_or(true, str::is_empty)
    }

    /// Assignment is compared by value.
    pub fn is_assigned_to(&self, delegate_id: &str) -> bool {
        matches!(self.delegate_id.as_deref(), Some(id) if !id.is_empty() && id == delegate_id)
    }

    /// Chooses the executor pool for this task.
    pub fn pool_kind(&self) -> PoolKind {
        let task_type = self.task_type.to_ascii_uppercase();
        if task_type.contains("BUILD") || task_type.contains("ARTIFACT") {
            PoolKind::Build
        } else if self.is_async {
            PoolKind::Async
        } else {
            PoolKind::Sync
        }
    }
}

/// Executor pool families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Sync,
    Async,
    Build,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Sync => write!(f, "sync"),
            PoolKind::Async => write!(f, "async"),
            PoolKind::Build => write!(f, "build"),
        }
    }
}

/// What a task event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskEventKind {
    #[default]
    #[serde(rename = "DelegateTaskEvent")]
    Available,
    #[serde(rename = "DelegateTaskAbortEvent")]
    Abort,
}

/// Notification of work availability or abort. Consumed once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "eventType", default)]
    pub kind: TaskEventKind,
    pub delegate_task_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
}

impl TaskEvent {
    pub fn available(task_id: impl Into<String>, sync: bool) -> Self {
        TaskEvent {
            kind: TaskEventKind::Available,
            delegate_task_id: task_id.into(),
            account_id: String::new(),
            sync,
            task_type: None,
        }
    }

    pub fn abort(task_id: impl Into<String>) -> Self {
        TaskEvent {
            kind: TaskEventKind::Abort,
            ..TaskEvent::available(task_id, false)
        }
    }

    pub fn is_abort(&self) -> bool {
        self.kind == TaskEventKind::Abort
    }
}

/// Outcome of one capability probe for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub criteria: String,
    pub validated: bool,
}

impl ValidationResult {
    pub fn new(criteria: impl Into<String>, validated: bool) -> Self {
        ValidationResult {
            criteria: criteria.into(),
            validated,
        }
    }
}

/// A task is valid for this worker if any criterion validated.
pub fn is_validated(results: &[ValidationResult]) -> bool {
    results.iter().any(|r| r.validated)
}

/// Status code carried by a task response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Failed,
    RetryOnOtherDelegate,
}

/// Result of running a task, reported via `send_task_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub account_id: String,
    pub response_code: ResponseCode,
    #[serde(default)]
    pub response: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskResponse {
    pub fn ok(account_id: impl Into<String>, response: serde_json::Value) -> Self {
        TaskResponse {
            account_id: account_id.into(),
            response_code: ResponseCode::Ok,
            response,
            error_message: None,
        }
    }

    pub fn failed(account_id: impl Into<String>, message: impl Into<String>) -> Self {
        TaskResponse {
            account_id: account_id.into(),
            response_code: ResponseCode::Failed,
            response: serde_json::Value::Null,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_code == ResponseCode::Ok
    }
}

/// Script names understood in a [`ScriptBundle`].
pub const START_SCRIPT: &str = "start.sh";
pub const STOP_SCRIPT: &str = "stop.sh";
pub const DELEGATE_SCRIPT: &str = "delegate.sh";
pub const SETUP_PROXY_SCRIPT: &str = "setup-proxy.sh";

/// Run scripts for a target version, as served by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScriptBundle {
    pub version: String,
    #[serde(default)]
    pub do_upgrade: bool,
    /// Script file name to script body
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

impl ScriptBundle {
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts
            .get(name)
            .map(String::as_str)
            .filter(|body| !body.trim().is_empty())
    }
}
