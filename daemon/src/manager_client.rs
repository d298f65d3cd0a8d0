/// HTTP client for the manager API
///
/// Implements [`ManagerClient`] over REST. Responses are wrapped in a
/// `{"resource": ...}` envelope; a missing resource maps to `None`.
use crate::auth::TokenSigner;
use crate::config::ManagerConfig;
use crate::errors::{DaemonError, DaemonResult};
use async_trait::async_trait;
use delegate_core::{
    ConnectionHeartbeat, DelegateParams, DelegateRegisterResponse, HeartbeatResponse,
    ManagerClient, ManagerError, ManagerResult, ProfileParams, ScriptBundle, Task, TaskEvent,
    TaskResponse, ValidationResult,
};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Manager response envelope
#[derive(Debug, Deserialize)]
struct RestResponse<T> {
    #[serde(default = "Option::default")]
    resource: Option<T>,
}

/// Task events returned by the poll endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskEventsResponse {
    #[serde(default)]
    delegate_task_events: Vec<TaskEvent>,
}

#[derive(Debug, Serialize)]
struct ProfileResult<'a> {
    error: bool,
    content: &'a str,
}

pub struct HttpManagerClient {
    base_url: String,
    http_client: reqwest::Client,
    signer: TokenSigner,
}

impl HttpManagerClient {
    /// Create a client for the configured manager
    pub fn new(config: &ManagerConfig) -> DaemonResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| {
                DaemonError::ConnectionError(format!("Failed to create HTTP client: {}", e))
            })?;

        let mut base_url = config.url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(HttpManagerClient {
            base_url,
            http_client,
            signer: TokenSigner::new(
                &config.account_id,
                &config.account_secret,
                config.token_expiry_secs,
            ),
        })
    }

    fn request(&self, method: Method, path: &str, account_id: &str) -> ManagerResult<RequestBuilder> {
        let token = self
            .signer
            .token()
            .map_err(|e| ManagerError::Rejected(e.to_string()))?;
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        Ok(self
            .http_client
            .request(method, url)
            .query(&[("accountId", account_id)])
            .header("Authorization", format!("Delegate {}", token)))
    }

    /// Sends the request and returns the body of a successful response.
    async fn fetch(&self, request: RequestBuilder) -> ManagerResult<String> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ManagerError::Timeout
            } else {
                ManagerError::ConnectionError(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ManagerError::ConnectionError(e.to_string()))?;

        if !status.is_success() {
            return Err(ManagerError::from_body(status.as_u16(), &body));
        }
        Ok(body)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ManagerResult<Option<T>> {
        let body = self.fetch(request).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let envelope: RestResponse<T> = serde_json::from_str(&body)?;
        Ok(envelope.resource)
    }

    async fn send_unit(&self, request: RequestBuilder) -> ManagerResult<()> {
        self.fetch(request).await.map(|_| ())
    }
}

#[async_trait]
impl ManagerClient for HttpManagerClient {
    async fn register(&self, params: &DelegateParams) -> ManagerResult<DelegateRegisterResponse> {
        let request = self
            .request(Method::POST, "agent/delegates/register", &params.account_id)?
            .json(params);
        self.send(request)
            .await?
            .ok_or_else(|| ManagerError::InvalidResponse("empty registration response".into()))
    }

    async fn unregister(&self, params: &DelegateParams) -> ManagerResult<()> {
        let request = self
            .request(Method::POST, "agent/delegates/unregister", &params.account_id)?
            .json(params);
        self.send_unit(request).await
    }

    async fn heartbeat(&self, params: &DelegateParams) -> ManagerResult<HeartbeatResponse> {
        let request = self
            .request(Method::POST, "agent/delegates/heartbeat-with-polling", &params.account_id)?
            .json(params);
        self.send(request)
            .await?
            .ok_or_else(|| ManagerError::InvalidResponse("empty heartbeat response".into()))
    }

    async fn connection_heartbeat(
        &self,
        delegate_id: &str,
        account_id: &str,
        heartbeat: &ConnectionHeartbeat,
    ) -> ManagerResult<()> {
        let path = format!("agent/delegates/connectionHeartbeat/{}", delegate_id);
        let request = self.request(Method::POST, &path, account_id)?.json(heartbeat);
        self.send_unit(request).await
    }

    async fn poll_task_events(&self, delegate_id: &str, account_id: &str) -> ManagerResult<Vec<TaskEvent>> {
        let path = format!("agent/delegates/{}/task-events", delegate_id);
        let request = self.request(Method::GET, &path, account_id)?;
        Ok(self
            .send::<TaskEventsResponse>(request)
            .await?
            .map(|r| r.delegate_task_events)
            .unwrap_or_default())
    }

    async fn acquire_task(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
    ) -> ManagerResult<Option<Task>> {
        let path = format!("agent/delegates/{}/tasks/{}/acquire", delegate_id, task_id);
        let request = self.request(Method::PUT, &path, account_id)?;
        self.send(request).await
    }

    async fn report_validation_results(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
        results: &[ValidationResult],
    ) -> ManagerResult<Option<Task>> {
        let path = format!("agent/delegates/{}/tasks/{}/report", delegate_id, task_id);
        let request = self.request(Method::POST, &path, account_id)?.json(results);
        self.send(request).await
    }

    async fn fail_if_all_delegates_failed(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
    ) -> ManagerResult<()> {
        let path = format!("agent/delegates/{}/tasks/{}/fail", delegate_id, task_id);
        let request = self.request(Method::GET, &path, account_id)?;
        self.send_unit(request).await
    }

    async fn send_task_status(
        &self,
        delegate_id: &str,
        task_id: &str,
        account_id: &str,
        response: &TaskResponse,
    ) -> ManagerResult<()> {
        let path = format!("agent/tasks/{}/delegates/{}", task_id, delegate_id);
        let request = self.request(Method::POST, &path, account_id)?.json(response);
        self.send_unit(request).await
    }

    async fn get_upgrade_scripts(&self, account_id: &str, version: &str) -> ManagerResult<Option<ScriptBundle>> {
        let request = self
            .request(Method::GET, "agent/delegates/upgrade", account_id)?
            .query(&[("delegateVersion", version)]);
        self.send(request).await
    }

    async fn get_delegate_scripts(&self, account_id: &str, version: &str) -> ManagerResult<Option<ScriptBundle>> {
        let request = self
            .request(Method::GET, "agent/delegates/delegateScripts", account_id)?
            .query(&[("delegateVersion", version)]);
        self.send(request).await
    }

    async fn check_for_profile(
        &self,
        delegate_id: &str,
        account_id: &str,
        profile_id: &str,
        last_updated_at: i64,
    ) -> ManagerResult<Option<ProfileParams>> {
        let path = format!("agent/delegates/{}/profile", delegate_id);
        let request = self
            .request(Method::GET, &path, account_id)?
            .query(&[("profileId", profile_id)])
            .query(&[("lastUpdatedAt", last_updated_at)]);
        self.send(request).await
    }

    async fn save_profile_result(
        &self,
        delegate_id: &str,
        account_id: &str,
        error: bool,
        content: String,
    ) -> ManagerResult<()> {
        let path = format!("agent/delegates/{}/profile-result", delegate_id);
        let request = self
            .request(Method::POST, &path, account_id)?
            .json(&ProfileResult {
                error,
                content: &content,
            });
        self.send_unit(request).await
    }
}
