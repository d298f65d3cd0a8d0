/// Process identity.
///
/// [`AgentIdentity`] is known before registration. Registration turns it into
/// an [`AgentSession`], which is immutable for the rest of the process and
/// shared by reference with every component.
use crate::wire::DelegateParams;
use uuid::Uuid;

/// Identity the agent presents when registering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub account_id: String,
    pub host_name: String,
    pub delegate_name: String,
    pub version: String,
    /// Fresh random id per process start
    pub connection_id: String,
}

impl AgentIdentity {
    pub fn new(
        account_id: impl Into<String>,
        host_name: impl Into<String>,
        delegate_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        AgentIdentity {
            account_id: account_id.into(),
            host_name: host_name.into(),
            delegate_name: delegate_name.into(),
            version: version.into(),
            connection_id: Uuid::new_v4().to_string(),
        }
    }

    /// Registration payload for this identity.
    pub fn register_params(&self, polling_mode: bool, supported_task_types: Vec<String>) -> DelegateParams {
        DelegateParams {
            delegate_id: None,
            account_id: self.account_id.clone(),
            host_name: self.host_name.clone(),
            delegate_name: self.delegate_name.clone(),
            version: self.version.clone(),
            delegate_connection_id: self.connection_id.clone(),
            last_heartbeat: chrono::Utc::now().timestamp_millis(),
            polling_mode_enabled: polling_mode,
            supported_task_types,
        }
    }

    /// Binds the id assigned by the manager.
    pub fn into_session(self, delegate_id: impl Into<String>) -> AgentSession {
        AgentSession {
            delegate_id: delegate_id.into(),
            identity: self,
        }
    }
}

/// Registered identity of this worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSession {
    delegate_id: String,
    identity: AgentIdentity,
}

impl AgentSession {
    pub fn delegate_id(&self) -> &str {
        &self.delegate_id
    }

    pub fn account_id(&self) -> &str {
        &self.identity.account_id
    }

    pub fn connection_id(&self) -> &str {
        &self.identity.connection_id
    }

    pub fn host_name(&self) -> &str {
        &self.identity.host_name
    }

    pub fn version(&self) -> &str {
        &self.identity.version
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// True if `delegate_id` names this worker.
    pub fn is_self(&self, delegate_id: &str) -> bool {
        self.delegate_id == delegate_id
    }

    /// Heartbeat payload stamped with `last_heartbeat` (epoch millis).
    pub fn heartbeat_params(&self, last_heartbeat: i64, polling_mode: bool) -> DelegateParams {
        DelegateParams {
            delegate_id: Some(self.delegate_id.clone()),
            last_heartbeat,
            polling_mode_enabled: polling_mode,
            ..self.identity.register_params(polling_mode, Vec::new())
        }
    }
}
