/// Registration, heartbeat and profile payloads exchanged with the manager.
use serde::{Deserialize, Serialize};

/// Identity and liveness payload used for register, unregister and heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DelegateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<String>,
    pub account_id: String,
    pub host_name: String,
    pub delegate_name: String,
    pub version: String,
    pub delegate_connection_id: String,
    /// Milliseconds since the epoch
    #[serde(default)]
    pub last_heartbeat: i64,
    #[serde(default)]
    pub polling_mode_enabled: bool,
    #[serde(default)]
    pub supported_task_types: Vec<String>,
}

/// Action the manager may attach to a registration response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegisterAction {
    SelfDestruct,
    Migrate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRegisterResponse {
    #[serde(default)]
    pub delegate_id: Option<String>,
    #[serde(default)]
    pub action: Option<RegisterAction>,
    #[serde(default)]
    pub migrate_url: Option<String>,
}

/// Worker record status as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegateStatus {
    #[default]
    Enabled,
    WaitingForApproval,
    Disabled,
    Deleted,
    #[serde(other)]
    Unknown,
}

/// Manager's current view of this worker, returned by heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub delegate_id: String,
    #[serde(default)]
    pub status: DelegateStatus,
}

/// Secondary heartbeat keyed by connection id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHeartbeat {
    pub delegate_connection_id: String,
    pub version: String,
    pub alive: bool,
}

/// Profile id meaning "no profile assigned".
pub const NO_PROFILE: &str = "NONE";

/// Setup profile assigned to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileParams {
    pub profile_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub profile_last_updated_at: i64,
    #[serde(default)]
    pub script_content: Option<String>,
}
