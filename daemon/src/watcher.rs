/// Liveness monitoring of the sibling watcher process.
///
/// The watcher publishes its heartbeat, version and pid in the shared store.
/// When the heartbeat goes stale, or the version stays wrong for too long,
/// the watcher is killed and relaunched from a fresh start script.
use crate::errors::DaemonResult;
use crate::manager::ManagerHandle;
use crate::scripts::write_scripts;
use crate::state::{now_millis, AgentState};
use delegate_core::message_store::{keys, WATCHER_DATA};
use delegate_core::task::START_SCRIPT;
use delegate_core::MessageStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Watcher heartbeat older than this means it is dead.
pub const WATCHER_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Wrong watcher version tolerated for this long.
pub const WATCHER_VERSION_MISMATCH_TIMEOUT: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub working_dir: PathBuf,
    pub expected_version: Option<String>,
    pub launch_command: Vec<String>,
    pub heartbeat_timeout: Duration,
    pub version_mismatch_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            working_dir: PathBuf::from("."),
            expected_version: None,
            launch_command: vec!["nohup".to_string(), format!("./{}", START_SCRIPT)],
            heartbeat_timeout: WATCHER_HEARTBEAT_TIMEOUT,
            version_mismatch_timeout: WATCHER_VERSION_MISMATCH_TIMEOUT,
        }
    }
}

/// What the watcher last published.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatcherStatus {
    pub heartbeat: Option<i64>,
    pub version: Option<String>,
    pub pid: Option<i32>,
}

impl WatcherStatus {
    pub fn read(store: &MessageStore) -> DaemonResult<Self> {
        let data = store.get_data(WATCHER_DATA)?;
        let pid = data.get(keys::WATCHER_PROCESS).and_then(|v| match v {
            Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Ok(WatcherStatus {
            heartbeat: data.get(keys::WATCHER_HEARTBEAT).and_then(Value::as_i64),
            version: data
                .get(keys::WATCHER_VERSION)
                .and_then(Value::as_str)
                .map(str::to_string),
            pid,
        })
    }
}

/// Restart decision over successive watcher readings.
pub struct WatcherHealth {
    heartbeat_timeout: Duration,
    version_mismatch_timeout: Duration,
    expected_version: Option<String>,
    mismatch_since: Mutex<Option<i64>>,
}

impl WatcherHealth {
    pub fn new(config: &WatcherConfig) -> Self {
        WatcherHealth {
            heartbeat_timeout: config.heartbeat_timeout,
            version_mismatch_timeout: config.version_mismatch_timeout,
            expected_version: config.expected_version.clone(),
            mismatch_since: Mutex::new(None),
        }
    }

    /// Decides on a restart; also tracks how long the version has been wrong.
    pub fn needs_restart(&self, status: &WatcherStatus, now: i64) -> bool {
        let heartbeat = status.heartbeat.unwrap_or(now);
        let stale_for = now - heartbeat;
        if stale_for > self.heartbeat_timeout.as_millis() as i64 {
            warn!("Watcher heartbeat is {}ms old", stale_for);
            return true;
        }

        let Some(expected) = &self.expected_version else {
            return false;
        };
        let mut since = self.mismatch_since.lock();
        if status.version.as_deref() == Some(expected.as_str()) {
            *since = None;
            return false;
        }
        let started = *since.get_or_insert(now);
        let mismatched_for = now - started;
        debug!(
            "Watcher version {:?} differs from {} for {}ms",
            status.version, expected, mismatched_for
        );
        if mismatched_for > self.version_mismatch_timeout.as_millis() as i64 {
            warn!(
                "Watcher version {:?} has not matched {} for {}ms",
                status.version, expected, mismatched_for
            );
            *since = None;
            return true;
        }
        false
    }
}

pub struct WatcherMonitor {
    manager: Arc<ManagerHandle>,
    state: Arc<AgentState>,
    store: Arc<MessageStore>,
    config: WatcherConfig,
    health: WatcherHealth,
}

impl WatcherMonitor {
    pub fn new(
        manager: Arc<ManagerHandle>,
        state: Arc<AgentState>,
        store: Arc<MessageStore>,
        config: WatcherConfig,
    ) -> Self {
        WatcherMonitor {
            manager,
            state,
            store,
            health: WatcherHealth::new(&config),
            config,
        }
    }

    /// One monitoring tick.
    pub async fn check(&self) -> DaemonResult<()> {
        if self.state.is_self_destructed() {
            return Ok(());
        }
        let status = WatcherStatus::read(&self.store)?;
        if self.health.needs_restart(&status, now_millis()) {
            self.restart_watcher(status.pid).await?;
        }
        Ok(())
    }

    async fn restart_watcher(&self, pid: Option<i32>) -> DaemonResult<()> {
        info!("Restarting watcher process {:?}", pid);

        match self.manager.get_delegate_scripts().await {
            Ok(Some(bundle)) => {
                write_scripts(&self.config.working_dir, &bundle, &[START_SCRIPT])?;
            }
            Ok(None) => warn!("Manager returned no delegate scripts, using the existing start script"),
            Err(e) => warn!("Unable to download delegate scripts: {}", e),
        }

        if let Some(pid) = pid {
            kill_process(pid);
        }

        // Give the new watcher a fresh heartbeat window
        self.store
            .put_data(WATCHER_DATA, keys::WATCHER_HEARTBEAT, now_millis())?;

        let Some((program, args)) = self.config.launch_command.split_first() else {
            error!("No watcher launch command configured");
            return Ok(());
        };
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.config.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        info!("Watcher relaunched with pid {:?}", child.id());
        Ok(())
    }
}

#[cfg(unix)]
fn kill_process(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        warn!("Unable to kill watcher process {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process(pid: i32) {
    warn!("Killing watcher process {} is not supported on this platform", pid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use delegate_core::MessengerType;
    use tempfile::TempDir;

    fn health(expected: Option<&str>) -> WatcherHealth {
        WatcherHealth::new(&WatcherConfig {
            expected_version: expected.map(str::to_string),
            ..WatcherConfig::default()
        })
    }

    #[test]
    fn test_stale_heartbeat_needs_restart() {
        let health = health(None);
        let now = 10_000_000;
        let fresh = WatcherStatus {
            heartbeat: Some(now - 60_000),
            ..WatcherStatus::default()
        };
        let stale = WatcherStatus {
            heartbeat: Some(now - 181_000),
            ..WatcherStatus::default()
        };
        assert!(!health.needs_restart(&fresh, now));
        assert!(health.needs_restart(&stale, now));
        assert!(!health.needs_restart(&WatcherStatus::default(), now));
    }

    #[test]
    fn test_version_mismatch_needs_restart_after_window() {
        let health = health(Some("2.0"));
        let now = 10_000_000;
        let status = |version: &str| WatcherStatus {
            heartbeat: Some(now),
            version: Some(version.to_string()),
            pid: None,
        };

        assert!(!health.needs_restart(&status("1.0"), now));
        assert!(!health.needs_restart(&status("1.0"), now + 60_000));
        assert!(health.needs_restart(&status("1.0"), now + 121_000));

        // A matching version resets the window
        assert!(!health.needs_restart(&status("1.0"), now + 200_000));
        assert!(!health.needs_restart(&status("2.0"), now + 210_000));
        assert!(!health.needs_restart(&status("1.0"), now + 300_000));
    }

    #[test]
    fn test_read_watcher_status() {
        let dir = TempDir::new().unwrap();
        let watcher = MessageStore::open(dir.path(), MessengerType::Watcher, "77").unwrap();
        watcher.put_data(WATCHER_DATA, keys::WATCHER_HEARTBEAT, 42).unwrap();
        watcher.put_data(WATCHER_DATA, keys::WATCHER_VERSION, "2.0").unwrap();
        watcher.put_data(WATCHER_DATA, keys::WATCHER_PROCESS, "77").unwrap();

        let status = WatcherStatus::read(&watcher).unwrap();
        assert_eq!(status.heartbeat, Some(42));
        assert_eq!(status.version.as_deref(), Some("2.0"));
        assert_eq!(status.pid, Some(77));
    }
}
