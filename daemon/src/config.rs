/// Agent configuration
use crate::errors::{DaemonError, DaemonResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DelegateConfig {
    pub manager: ManagerConfig,
    pub agent: AgentConfig,
    pub pools: PoolConfig,
    pub timing: TimingConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Manager connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Base URL of the manager API (e.g., "https://manager.example.com/api/")
    pub url: String,
    /// Streaming endpoint base; derived from `url` when unset
    pub stream_url: Option<String>,
    pub account_id: String,
    /// Secret used to sign short-lived tokens
    pub account_secret: String,
    /// HTTP client timeout in seconds
    pub request_timeout_secs: u64,
    /// Time limit applied around each manager call
    pub call_timeout_secs: u64,
    /// Signed token lifetime in seconds
    pub token_expiry_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            url: "https://localhost:9090/api/".to_string(),
            stream_url: None,
            account_id: String::new(),
            account_secret: String::new(),
            request_timeout_secs: 60,
            call_timeout_secs: 15,
            token_expiry_secs: 300,
        }
    }
}

impl ManagerConfig {
    /// Streaming endpoint base URL (ws/wss).
    pub fn stream_base(&self) -> String {
        if let Some(url) = &self.stream_url {
            return url.trim_end_matches('/').to_string();
        }
        let base = self.url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        }
    }
}

/// Agent behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Version reported to the manager; defaults to the crate version
    pub version: Option<String>,
    /// Directory holding run scripts and profile files
    pub working_dir: PathBuf,
    /// Pull task events instead of keeping a socket open
    pub polling_mode: bool,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub auto_upgrade: bool,
    pub upgrade_check_interval_secs: u64,
    /// Running under a watcher process
    pub watched: bool,
    /// Task types this agent accepts; empty accepts everything registered
    pub supported_task_types: Vec<String>,
    /// Watcher version to enforce, if any
    pub expected_watcher_version: Option<String>,
    /// Command used to relaunch the watcher
    pub watcher_launch_command: Vec<String>,
    /// Connect attempts before the socket gives up and asks for a restart
    pub socket_connect_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            name: "delegate".to_string(),
            version: None,
            working_dir: PathBuf::from("."),
            polling_mode: false,
            poll_interval_ms: 3_000,
            heartbeat_interval_secs: 60,
            auto_upgrade: true,
            upgrade_check_interval_secs: 60,
            watched: false,
            supported_task_types: Vec::new(),
            expected_watcher_version: None,
            watcher_launch_command: vec!["nohup".to_string(), "./start.sh".to_string()],
            socket_connect_attempts: 5,
        }
    }
}

impl AgentConfig {
    pub fn version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| crate::VERSION.to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Executor pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub sync_size: usize,
    pub async_size: usize,
    pub build_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            sync_size: 10,
            async_size: 10,
            build_size: 2,
        }
    }
}

/// Intervals, ceilings and retry policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub timeout_poll_interval_ms: u64,
    pub timeout_grace_ms: u64,
    pub timeout_result_wait_ms: u64,
    pub drain_poll_interval_ms: u64,
    pub drain_ceiling_secs: u64,
    pub status_retry_attempts: u32,
    pub status_retry_delay_ms: u64,
    pub register_retry_delay_secs: u64,
    pub fairness_extra_delay_ms: u64,
    pub throttle_step_ms: u64,
    pub throttle_cap: usize,
    pub local_heartbeat_interval_secs: u64,
    pub input_check_interval_ms: u64,
    pub watcher_check_interval_secs: u64,
    pub profile_check_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            timeout_poll_interval_ms: 5_000,
            timeout_grace_ms: 30_000,
            timeout_result_wait_ms: 5_000,
            drain_poll_interval_ms: 1_000,
            drain_ceiling_secs: 2 * 60 * 60,
            status_retry_attempts: 3,
            status_retry_delay_ms: 200,
            register_retry_delay_secs: 60,
            fairness_extra_delay_ms: 3_000,
            throttle_step_ms: 100,
            throttle_cap: 10,
            local_heartbeat_interval_secs: 10,
            input_check_interval_ms: 1_000,
            watcher_check_interval_secs: 10,
            profile_check_interval_secs: 3 * 60,
        }
    }
}

/// Status/message store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory shared with the watcher
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            dir: PathBuf::from("msg"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format ("text" or "json")
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl DelegateConfig {
    /// Load configuration from file
    pub fn load(path: &str) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&str>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> DaemonResult<()> {
        if self.manager.url.is_empty() {
            return Err(DaemonError::ConfigError("manager.url must be set".to_string()));
        }

        if self.manager.account_id.is_empty() {
            return Err(DaemonError::ConfigError(
                "manager.account_id must be set".to_string(),
            ));
        }

        if self.manager.account_secret.is_empty() {
            return Err(DaemonError::ConfigError(
                "manager.account_secret must be set".to_string(),
            ));
        }

        if self.pools.sync_size == 0 || self.pools.async_size == 0 || self.pools.build_size == 0 {
            return Err(DaemonError::ConfigError(
                "pool sizes must be greater than 0".to_string(),
            ));
        }

        if self.agent.heartbeat_interval_secs == 0 || self.agent.poll_interval_ms == 0 {
            return Err(DaemonError::ConfigError(
                "heartbeat and poll intervals must be greater than 0".to_string(),
            ));
        }

        if self.timing.status_retry_attempts == 0 {
            return Err(DaemonError::ConfigError(
                "timing.status_retry_attempts must be at least 1".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(DaemonError::ConfigError(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }
}
