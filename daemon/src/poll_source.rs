/// Pull-mode task intake.
use crate::errors::DaemonResult;
use crate::frame::StreamFrame;
use crate::intake::TaskSource;
use crate::manager::ManagerHandle;
use crate::state::AgentState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PollTaskSource {
    manager: Arc<ManagerHandle>,
    state: Arc<AgentState>,
    interval: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl PollTaskSource {
    pub fn new(manager: Arc<ManagerHandle>, state: Arc<AgentState>, interval: Duration) -> Self {
        PollTaskSource {
            manager,
            state,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    async fn poll_loop(self: Arc<Self>, sink: mpsc::Sender<StreamFrame>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.state.is_self_destructed() || self.state.is_frozen() {
                continue;
            }

            match self.manager.poll_task_events().await {
                Ok(events) => {
                    if !events.is_empty() {
                        debug!("Polled {} task events", events.len());
                    }
                    for event in events {
                        if sink.send(StreamFrame::Task(event)).await.is_err() {
                            info!("Frame channel closed, stopping task poller");
                            return;
                        }
                    }
                }
                Err(e) => warn!("Unable to poll task events: {}", e),
            }
        }
        debug!("Task poller stopped");
    }
}

#[async_trait]
impl TaskSource for PollTaskSource {
    fn name(&self) -> &'static str {
        "poll"
    }

    async fn start(self: Arc<Self>, sink: mpsc::Sender<StreamFrame>) -> DaemonResult<()> {
        let cancel = {
            let mut running = self.running.lock();
            if running.is_some() {
                debug!("Task poller already running");
                return Ok(());
            }
            let cancel = CancellationToken::new();
            *running = Some(cancel.clone());
            cancel
        };
        info!("Polling for task events every {:?}", self.interval);
        tokio::spawn(Arc::clone(&self).poll_loop(sink, cancel));
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
    }
}
