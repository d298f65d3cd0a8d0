/// Delegate profile: a setup script assigned by the manager and applied once
/// per profile revision.
use crate::errors::DaemonResult;
use crate::manager::ManagerHandle;
use crate::state::AgentState;
use delegate_core::wire::NO_PROFILE;
use delegate_core::ProfileParams;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PROFILE_FILE: &str = "profile";
pub const PROFILE_RESULT_FILE: &str = "profile.result";
/// Profile scripts are killed after this long.
pub const PROFILE_SCRIPT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Outcome of one profile script run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScriptOutput {
    pub error: bool,
    /// Stdout lines, then stderr lines prefixed with `ERROR: `
    pub lines: Vec<String>,
}

impl ScriptOutput {
    pub fn content(&self) -> String {
        self.lines.join("\n")
    }
}

pub struct ProfileManager {
    manager: Arc<ManagerHandle>,
    state: Arc<AgentState>,
    working_dir: PathBuf,
    script_timeout: Duration,
}

impl ProfileManager {
    pub fn new(manager: Arc<ManagerHandle>, state: Arc<AgentState>, working_dir: impl Into<PathBuf>) -> Self {
        ProfileManager {
            manager,
            state,
            working_dir: working_dir.into(),
            script_timeout: PROFILE_SCRIPT_TIMEOUT,
        }
    }

    /// One profile check tick.
    pub async fn check(&self) -> DaemonResult<()> {
        if self.state.is_frozen() || !self.state.should_contact_manager() {
            return Ok(());
        }

        let stored = load_profile(&self.working_dir)?;
        let (profile_id, updated_at) = stored
            .as_ref()
            .map(|p| (p.profile_id.clone(), p.profile_last_updated_at))
            .unwrap_or_else(|| (String::new(), 0));

        let Some(profile) = self.manager.check_for_profile(&profile_id, updated_at).await? else {
            debug!("Delegate profile unchanged");
            return Ok(());
        };

        if profile.profile_id == NO_PROFILE {
            if stored.is_some() {
                info!("Delegate profile removed");
            }
            clear_profile(&self.working_dir)?;
            return Ok(());
        }

        info!(
            "Applying delegate profile {} ({})",
            profile.name, profile.profile_id
        );
        let script = profile.script_content.clone().unwrap_or_default();
        let output = run_script(&script, &self.working_dir, self.script_timeout).await;
        if output.error {
            warn!("Delegate profile {} script failed", profile.profile_id);
        }

        save_profile(&self.working_dir, &profile, &output)?;
        self.manager
            .save_profile_result(output.error, output.content())
            .await
    }
}

pub fn load_profile(dir: &Path) -> DaemonResult<Option<ProfileParams>> {
    match fs::read_to_string(dir.join(PROFILE_FILE)) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn save_profile(dir: &Path, profile: &ProfileParams, output: &ScriptOutput) -> DaemonResult<()> {
    fs::create_dir_all(dir)?;
    let stored = ProfileParams {
        script_content: None,
        ..profile.clone()
    };
    fs::write(dir.join(PROFILE_FILE), serde_json::to_vec_pretty(&stored)?)?;
    fs::write(dir.join(PROFILE_RESULT_FILE), output.content())?;
    Ok(())
}

fn clear_profile(dir: &Path) -> DaemonResult<()> {
    for name in [PROFILE_FILE, PROFILE_RESULT_FILE] {
        match fs::remove_file(dir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Runs `script` with `/bin/bash -c`, killing it after `limit`.
pub async fn run_script(script: &str, dir: &Path, limit: Duration) -> ScriptOutput {
    if script.trim().is_empty() {
        return ScriptOutput::default();
    }

    let child = tokio::process::Command::new("/bin/bash")
        .arg("-c")
        .arg(script)
        .current_dir(dir)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(limit, child).await {
        Ok(Ok(output)) => {
            let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect();
            lines.extend(
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .map(|line| format!("ERROR: {}", line)),
            );
            ScriptOutput {
                error: !output.status.success(),
                lines,
            }
        }
        Ok(Err(e)) => ScriptOutput {
            error: true,
            lines: vec![format!("ERROR: unable to run script: {}", e)],
        },
        Err(_) => ScriptOutput {
            error: true,
            lines: vec![format!("ERROR: script timed out after {:?}", limit)],
        },
    }
}
