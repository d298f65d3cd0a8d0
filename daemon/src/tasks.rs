/// Built-in task types.
use async_trait::async_trait;
use delegate_core::{
    DelegateRunnableTask, DelegateValidateTask, Task, TaskContext, TaskError, TaskFactory,
    TaskResponse, TaskResult, ValidationResult,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub const SHELL_SCRIPT_TASK: &str = "SHELL_SCRIPT";

/// Per-criterion connectivity probe limit
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ShellScriptParams {
    #[serde(default)]
    script: String,
    #[serde(default)]
    working_directory: Option<PathBuf>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    /// `host:port` endpoints this worker must reach
    #[serde(default)]
    criteria: Vec<String>,
}

impl ShellScriptParams {
    fn parse(task: &Task) -> TaskResult<Self> {
        if task.parameters.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(task.parameters.clone())
            .map_err(|e| TaskError::InvalidParameters(e.to_string()))
    }
}

/// Runs a bash script; validates by probing TCP endpoints.
pub struct ShellScriptFactory;

impl TaskFactory for ShellScriptFactory {
    fn task_type(&self) -> &str {
        SHELL_SCRIPT_TASK
    }

    fn runnable(&self, task: &Task) -> TaskResult<Box<dyn DelegateRunnableTask>> {
        let params = ShellScriptParams::parse(task)?;
        if params.script.trim().is_empty() {
            return Err(TaskError::InvalidParameters("script is empty".to_string()));
        }
        Ok(Box::new(ShellScriptTask { params }))
    }

    fn validator(&self, task: &Task) -> TaskResult<Box<dyn DelegateValidateTask>> {
        let params = ShellScriptParams::parse(task)?;
        Ok(Box::new(ConnectivityValidation {
            criteria: params.criteria,
        }))
    }
}

struct ShellScriptTask {
    params: ShellScriptParams,
}

#[async_trait]
impl DelegateRunnableTask for ShellScriptTask {
    async fn run(&self, ctx: &TaskContext) -> TaskResult<TaskResponse> {
        let mut command = tokio::process::Command::new("/bin/bash");
        command
            .arg("-c")
            .arg(&self.params.script)
            .envs(&self.params.environment)
            .kill_on_drop(true);
        if let Some(dir) = &self.params.working_directory {
            command.current_dir(dir);
        }

        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(TaskError::Cancelled),
            output = command.output() => output?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();
        debug!("Script for task {} exited with {:?}", ctx.task().id, exit_code);

        if !output.status.success() {
            return Err(TaskError::ExecutionError(format!(
                "script exited with {:?}: {}",
                exit_code,
                stderr.trim()
            )));
        }
        Ok(TaskResponse::ok(
            ctx.task().account_id.clone(),
            json!({
                "exitCode": exit_code,
                "output": stdout,
                "error": stderr,
            }),
        ))
    }
}

struct ConnectivityValidation {
    criteria: Vec<String>,
}

#[async_trait]
impl DelegateValidateTask for ConnectivityValidation {
    async fn validate(&self, _ctx: &TaskContext) -> Vec<ValidationResult> {
        if self.criteria.is_empty() {
            return vec![ValidationResult::new("ALWAYS_TRUE", true)];
        }
        let probes = self.criteria.iter().map(|endpoint| async move {
            let reachable = matches!(
                tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(endpoint.as_str())).await,
                Ok(Ok(_))
            );
            debug!("Probe {} reachable: {}", endpoint, reachable);
            ValidationResult::new(endpoint.clone(), reachable)
        });
        futures::future::join_all(probes).await
    }
}
