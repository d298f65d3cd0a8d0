/// Session-bound view of the manager.
///
/// Every call is time limited and token errors are fed back into the agent
/// state (invalid token self-destructs, expired/revoked token freezes).
use crate::errors::{DaemonError, DaemonResult};
use crate::state::AgentState;
use crate::time_limit::call_with_timeout;
use delegate_core::{
    AgentSession, ConnectionHeartbeat, HeartbeatResponse, ManagerClient, ProfileParams,
    ScriptBundle, Task, TaskEvent, TaskResponse, ValidationResult,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Poll calls get a shorter limit so the poll cadence holds.
pub const POLL_CALL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ManagerHandle {
    client: Arc<dyn ManagerClient>,
    session: Arc<AgentSession>,
    state: Arc<AgentState>,
    polling_mode: bool,
    call_timeout: Duration,
}

impl ManagerHandle {
    pub fn new(
        client: Arc<dyn ManagerClient>,
        session: Arc<AgentSession>,
        state: Arc<AgentState>,
        polling_mode: bool,
        call_timeout: Duration,
    ) -> Self {
        ManagerHandle {
            client,
            session,
            state,
            polling_mode,
            call_timeout,
        }
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    async fn call<T, F, Fut>(&self, limit: Duration, f: F) -> DaemonResult<T>
    where
        F: FnOnce(Arc<dyn ManagerClient>, Arc<AgentSession>) -> Fut,
        Fut: Future<Output = delegate_core::ManagerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let result = call_with_timeout(limit, f(Arc::clone(&self.client), Arc::clone(&self.session))).await;
        if let Err(DaemonError::Manager(e)) = &result {
            self.state.apply_manager_error(e);
        }
        result
    }

    pub async fn heartbeat(&self, last_heartbeat: i64) -> DaemonResult<HeartbeatResponse> {
        let params = self.session.heartbeat_params(last_heartbeat, self.polling_mode);
        self.call(self.call_timeout, move |client, _| async move {
            client.heartbeat(&params).await
        })
        .await
    }

    pub async fn connection_heartbeat(&self) -> DaemonResult<()> {
        let heartbeat = ConnectionHeartbeat {
            delegate_connection_id: self.session.connection_id().to_string(),
            version: self.session.version().to_string(),
            alive: true,
        };
        self.call(self.call_timeout, move |client, session| async move {
            client
                .connection_heartbeat(session.delegate_id(), session.account_id(), &heartbeat)
                .await
        })
        .await
    }

    pub async fn unregister(&self) -> DaemonResult<()> {
        let params = self
            .session
            .heartbeat_params(crate::state::now_millis(), self.polling_mode);
        self.call(self.call_timeout, move |client, _| async move {
            client.unregister(&params).await
        })
        .await
    }

    pub async fn poll_task_events(&self) -> DaemonResult<Vec<TaskEvent>> {
        self.call(POLL_CALL_TIMEOUT, |client, session| async move {
            client
                .poll_task_events(session.delegate_id(), session.account_id())
                .await
        })
        .await
    }

    pub async fn acquire_task(&self, task_id: &str) -> DaemonResult<Option<Task>> {
        let task_id = task_id.to_string();
        self.call(self.call_timeout, move |client, session| async move {
            client
                .acquire_task(session.delegate_id(), &task_id, session.account_id())
                .await
        })
        .await
    }

    pub async fn report_validation_results(
        &self,
        task_id: &str,
        results: Vec<ValidationResult>,
    ) -> DaemonResult<Option<Task>> {
        let task_id = task_id.to_string();
        self.call(self.call_timeout, move |client, session| async move {
            client
                .report_validation_results(
                    session.delegate_id(),
                    &task_id,
                    session.account_id(),
                    &results,
                )
                .await
        })
        .await
    }

    pub async fn fail_if_all_delegates_failed(&self, task_id: &str) -> DaemonResult<()> {
        let task_id = task_id.to_string();
        self.call(self.call_timeout, move |client, session| async move {
            client
                .fail_if_all_delegates_failed(session.delegate_id(), &task_id, session.account_id())
                .await
        })
        .await
    }

    pub async fn send_task_status(&self, task_id: &str, response: TaskResponse) -> DaemonResult<()> {
        let task_id = task_id.to_string();
        self.call(self.call_timeout, move |client, session| async move {
            client
                .send_task_status(session.delegate_id(), &task_id, session.account_id(), &response)
                .await
        })
        .await
    }

    pub async fn get_upgrade_scripts(&self) -> DaemonResult<Option<ScriptBundle>> {
        self.call(self.call_timeout, |client, session| async move {
            client
                .get_upgrade_scripts(session.account_id(), session.version())
                .await
        })
        .await
    }

    pub async fn get_delegate_scripts(&self) -> DaemonResult<Option<ScriptBundle>> {
        self.call(self.call_timeout, |client, session| async move {
            client
                .get_delegate_scripts(session.account_id(), session.version())
                .await
        })
        .await
    }

    pub async fn check_for_profile(
        &self,
        profile_id: &str,
        last_updated_at: i64,
    ) -> DaemonResult<Option<ProfileParams>> {
        let profile_id = profile_id.to_string();
        self.call(self.call_timeout, move |client, session| async move {
            client
                .check_for_profile(
                    session.delegate_id(),
                    session.account_id(),
                    &profile_id,
                    last_updated_at,
                )
                .await
        })
        .await
    }

    pub async fn save_profile_result(&self, error: bool, content: String) -> DaemonResult<()> {
        self.call(self.call_timeout, move |client, session| async move {
            client
                .save_profile_result(session.delegate_id(), session.account_id(), error, content)
                .await
        })
        .await
    }
}
