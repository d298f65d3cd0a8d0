/// Registration with the manager.
use crate::errors::{DaemonError, DaemonResult};
use crate::state::AgentState;
use crate::time_limit::call_with_timeout;
use delegate_core::message_store::keys;
use delegate_core::{DelegateParams, ManagerClient, MessageStore, RegisterAction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Registrar {
    client: Arc<dyn ManagerClient>,
    state: Arc<AgentState>,
    store: Arc<MessageStore>,
    record: String,
    retry_delay: Duration,
    call_timeout: Duration,
}

impl Registrar {
    pub fn new(
        client: Arc<dyn ManagerClient>,
        state: Arc<AgentState>,
        store: Arc<MessageStore>,
        record: impl Into<String>,
        retry_delay: Duration,
        call_timeout: Duration,
    ) -> Self {
        Registrar {
            client,
            state,
            store,
            record: record.into(),
            retry_delay,
            call_timeout,
        }
    }

    /// Registers, retrying every `retry_delay` until the manager assigns an id.
    ///
    /// Gives up once acquisition stops or self destruct starts.
    pub async fn register(&self, params: &DelegateParams) -> DaemonResult<String> {
        let mut attempt = 0u32;

        let shutdown = self.state.shutdown_token();
        while self.state.is_acquiring() && !self.state.is_self_destructed() && !shutdown.is_cancelled() {
            attempt += 1;
            let client = Arc::clone(&self.client);
            let request = params.clone();
            let result = call_with_timeout(self.call_timeout, async move {
                client.register(&request).await
            })
            .await;

            match result {
                Ok(response) => match response.action {
                    Some(RegisterAction::SelfDestruct) => {
                        warn!("Manager asked this delegate to self destruct");
                        self.state.initiate_self_destruct();
                    }
                    Some(RegisterAction::Migrate) => {
                        self.record_migration(response.migrate_url.as_deref());
                    }
                    None => match response.delegate_id {
                        Some(id) if !id.is_empty() => {
                            info!("Delegate registered with id {} (attempt {})", id, attempt);
                            return Ok(id);
                        }
                        _ => warn!("Registration response carried no delegate id (attempt {})", attempt),
                    },
                },
                Err(e) => {
                    warn!("Registration failed (attempt {}): {}", attempt, e);
                    if let Some(manager_error) = e.as_manager_error() {
                        self.state.apply_manager_error(manager_error);
                    }
                }
            }

            if self.state.is_self_destructed() {
                break;
            }
            info!("Retrying registration in {:?}", self.retry_delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        Err(DaemonError::RegistrationError(format!(
            "gave up after {} attempts",
            attempt
        )))
    }

    fn record_migration(&self, url: Option<&str>) {
        let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
            warn!("Migrate action without a URL ignored");
            return;
        };
        let url = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{}/", url)
        };
        info!("Manager asked this delegate to migrate to {}", url);
        if let Err(e) = self.store.put_data(&self.record, keys::MIGRATE, url) {
            warn!("Unable to record migration target: {}", e);
        }
    }
}
