/// Heartbeat and self-upgrade supervisor.
///
/// Periodic timers report liveness to the manager and the watcher, pick up
/// upgrades, read watcher messages, and run the drain-then-stop sequence.
/// A failing or panicking tick is logged and the timer keeps going.
use crate::config::DelegateConfig;
use crate::errors::DaemonResult;
use crate::frame::StreamFrame;
use crate::intake::TaskSource;
use crate::manager::ManagerHandle;
use crate::metrics::DelegateMetrics;
use crate::registry::TaskRegistry;
use crate::scripts::write_scripts;
use crate::socket_source::SocketTaskSource;
use crate::state::{now_millis, AgentState, HEARTBEAT_SOCKET_TIMEOUT_MS};
use delegate_core::message_store::{keys, messages};
use delegate_core::task::{DELEGATE_SCRIPT, SETUP_PROXY_SCRIPT, START_SCRIPT, STOP_SCRIPT};
use delegate_core::{AgentSession, DelegateStatus, MessageStore};
use serde_json::{Map, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scripts replaced on upgrade.
pub const UPGRADE_SCRIPTS: [&str; 4] = [START_SCRIPT, STOP_SCRIPT, DELEGATE_SCRIPT, SETUP_PROXY_SCRIPT];

/// Runs `tick` every `period` until `shutdown` fires.
///
/// Each tick runs in its own task so an error or panic only loses that tick.
pub fn spawn_timer<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DaemonResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match tokio::spawn(tick()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} tick failed: {}", name, e),
                Err(e) => error!("{} tick panicked: {}", name, e),
            }
        }
        debug!("{} timer stopped", name);
    })
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub polling_mode: bool,
    pub watched: bool,
    pub auto_upgrade: bool,
    pub working_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub upgrade_check_interval: Duration,
    pub local_heartbeat_interval: Duration,
    pub input_check_interval: Duration,
    pub drain_poll_interval: Duration,
    pub drain_ceiling: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig::from_config(&DelegateConfig::default())
    }
}

impl SupervisorConfig {
    pub fn from_config(config: &DelegateConfig) -> Self {
        SupervisorConfig {
            polling_mode: config.agent.polling_mode,
            watched: config.agent.watched,
            auto_upgrade: config.agent.auto_upgrade,
            working_dir: config.agent.working_dir.clone(),
            heartbeat_interval: config.agent.heartbeat_interval(),
            upgrade_check_interval: Duration::from_secs(config.agent.upgrade_check_interval_secs),
            local_heartbeat_interval: Duration::from_secs(config.timing.local_heartbeat_interval_secs),
            input_check_interval: Duration::from_millis(config.timing.input_check_interval_ms),
            drain_poll_interval: Duration::from_millis(config.timing.drain_poll_interval_ms),
            drain_ceiling: Duration::from_secs(config.timing.drain_ceiling_secs),
        }
    }
}

pub struct Supervisor {
    session: Arc<AgentSession>,
    state: Arc<AgentState>,
    manager: Arc<ManagerHandle>,
    registry: Arc<TaskRegistry>,
    store: Arc<MessageStore>,
    record: String,
    socket: Option<Arc<SocketTaskSource>>,
    frames: mpsc::Sender<StreamFrame>,
    metrics: Arc<DelegateMetrics>,
    config: SupervisorConfig,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<AgentSession>,
        state: Arc<AgentState>,
        manager: Arc<ManagerHandle>,
        registry: Arc<TaskRegistry>,
        store: Arc<MessageStore>,
        record: impl Into<String>,
        socket: Option<Arc<SocketTaskSource>>,
        frames: mpsc::Sender<StreamFrame>,
        metrics: Arc<DelegateMetrics>,
        config: SupervisorConfig,
    ) -> Self {
        Supervisor {
            session,
            state,
            manager,
            registry,
            store,
            record: record.into(),
            socket,
            frames,
            metrics,
            config,
        }
    }

    /// Starts the heartbeat, upgrade, local status and input timers.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let shutdown = self.state.shutdown_token();
        let mut timers = Vec::new();

        let this = Arc::clone(self);
        timers.push(spawn_timer("heartbeat", self.config.heartbeat_interval, shutdown.clone(), move || {
            let this = Arc::clone(&this);
            async move { this.send_heartbeat().await }
        }));

        if self.config.auto_upgrade {
            let this = Arc::clone(self);
            timers.push(spawn_timer(
                "upgrade check",
                self.config.upgrade_check_interval,
                shutdown.clone(),
                move || {
                    let this = Arc::clone(&this);
                    async move { this.check_upgrade().await }
                },
            ));
        } else {
            info!("Auto upgrade is disabled");
        }

        let this = Arc::clone(self);
        timers.push(spawn_timer(
            "local status",
            self.config.local_heartbeat_interval,
            shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move { this.write_local_status() }
            },
        ));

        let this = Arc::clone(self);
        timers.push(spawn_timer("input check", self.config.input_check_interval, shutdown, move || {
            let this = Arc::clone(&this);
            async move { this.check_input().await }
        }));

        timers
    }

    // ============================================================================
    // HEARTBEAT
    // ============================================================================

    pub async fn send_heartbeat(&self) -> DaemonResult<()> {
        if self.state.is_self_destructed() || !self.state.is_acquiring() || self.state.is_frozen() {
            debug!("Skipping heartbeat");
            return Ok(());
        }
        if self.config.polling_mode {
            self.send_polling_heartbeat().await
        } else {
            self.send_socket_heartbeat()
        }
    }

    async fn send_polling_heartbeat(&self) -> DaemonResult<()> {
        let response = self.manager.heartbeat(now_millis()).await?;
        self.state.mark_heartbeat_exchanged(now_millis());
        self.metrics.heartbeats_sent.inc();

        if !self.session.is_self(&response.delegate_id) {
            warn!(
                "Heartbeat echoed delegate id {}, expected {}",
                response.delegate_id,
                self.session.delegate_id()
            );
        } else if response.status == DelegateStatus::Deleted {
            warn!("Delegate was deleted by the manager");
            self.state.initiate_self_destruct();
            return Ok(());
        }

        self.manager.connection_heartbeat().await
    }

    fn send_socket_heartbeat(&self) -> DaemonResult<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        let now = now_millis();
        let last_received = self.state.heartbeat().last_received_at;
        if now - last_received > HEARTBEAT_SOCKET_TIMEOUT_MS && !self.state.is_closing_socket() {
            warn!(
                "No heartbeat response for {}ms, reopening delegate stream",
                now - last_received
            );
            self.state.set_closing_socket(true);
            socket.request_reconnect();
            return Ok(());
        }
        if !socket.is_open() {
            debug!("Delegate stream not open, heartbeat skipped");
            return Ok(());
        }

        let payload = serde_json::to_string(&self.session.heartbeat_params(now, false))?;
        if socket.send_text(payload) {
            self.state.mark_heartbeat_sent(now);
            self.metrics.heartbeats_sent.inc();
        }
        Ok(())
    }

    // ============================================================================
    // UPGRADE
    // ============================================================================

    pub async fn check_upgrade(&self) -> DaemonResult<()> {
        if self.state.is_upgrade_pending() {
            debug!("Upgrade already pending");
            return Ok(());
        }
        if !self.state.should_contact_manager() || self.state.is_frozen() {
            return Ok(());
        }

        let Some(bundle) = self.manager.get_upgrade_scripts().await? else {
            return Ok(());
        };
        if !bundle.do_upgrade {
            debug!("Delegate is up to date");
            return Ok(());
        }

        info!(
            "Upgrading delegate from {} to {}",
            self.session.version(),
            bundle.version
        );
        self.state.set_upgrade_pending(true);
        self.store.put_data(&self.record, keys::UPGRADE_PENDING, true)?;

        if let Err(e) = write_scripts(&self.config.working_dir, &bundle, &UPGRADE_SCRIPTS) {
            error!("Unable to replace run scripts: {}", e);
            self.state.set_upgrade_pending(false);
            self.store.put_data(&self.record, keys::UPGRADE_PENDING, false)?;
            return Err(e);
        }

        self.state.set_upgrade_needed(true);
        self.store.put_data(&self.record, keys::UPGRADE_NEEDED, true)?;
        info!("Run scripts replaced, waiting for the watcher to restart");
        Ok(())
    }

    // ============================================================================
    // LOCAL STATUS
    // ============================================================================

    /// Publishes this process's status record for the watcher.
    pub fn write_local_status(&self) -> DaemonResult<()> {
        if self.state.is_self_destructed() {
            let mut record = Map::new();
            record.insert(keys::SELF_DESTRUCT.to_string(), Value::Bool(true));
            self.store.replace_data(&self.record, record)?;
            return Ok(());
        }

        let now = now_millis();
        let entries: [(&str, Value); 9] = [
            (keys::HEARTBEAT, now.into()),
            (keys::VERSION, self.session.version().into()),
            (keys::IS_NEW, false.into()),
            (
                keys::RESTART_NEEDED,
                self.state.restart_required(self.config.watched, now).into(),
            ),
            (keys::UPGRADE_PENDING, self.state.is_upgrade_pending().into()),
            (keys::UPGRADE_NEEDED, self.state.is_upgrade_needed().into()),
            (keys::SHUTDOWN_PENDING, (!self.state.is_acquiring()).into()),
            (keys::SHUTDOWN_STARTED, self.state.shutdown_started_at().into()),
            (keys::DELEGATE_ID, self.session.delegate_id().into()),
        ];
        let record: Map<String, Value> = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.store.put_all_data(&self.record, record)?;
        Ok(())
    }

    // ============================================================================
    // WATCHER INPUT
    // ============================================================================

    pub async fn check_input(self: &Arc<Self>) -> DaemonResult<()> {
        for message in self.store.read_messages()? {
            match message.message.as_str() {
                messages::STOP_ACQUIRING => {
                    self.begin_drain();
                }
                messages::RESUME => self.resume().await,
                messages::GO_AHEAD => info!("Go ahead received from watcher"),
                other => warn!(
                    "Unknown message {} from {:?} {}",
                    other, message.from, message.from_process
                ),
            }
        }
        Ok(())
    }

    // ============================================================================
    // DRAIN / PAUSE / RESUME
    // ============================================================================

    /// Stops acquiring and waits for executing tasks, then stops the process.
    ///
    /// Returns the waiter, or None if a drain was already under way.
    pub fn begin_drain(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.state.stop_acquiring() {
            debug!("Task acquisition already stopped");
            return None;
        }
        let now = now_millis();
        self.state.mark_shutdown_started(now);
        if let Err(e) = self.store.put_data(&self.record, keys::SHUTDOWN_PENDING, true) {
            warn!("Unable to record pending shutdown: {}", e);
        }
        if let Err(e) = self.store.put_data(&self.record, keys::SHUTDOWN_STARTED, now) {
            warn!("Unable to record shutdown start: {}", e);
        }
        info!(
            "Stopped acquiring tasks, draining {} executing tasks",
            self.registry.executing_count()
        );

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let deadline = Instant::now() + this.config.drain_ceiling;
            while this.registry.has_executing() && Instant::now() < deadline {
                tokio::time::sleep(this.config.drain_poll_interval).await;
                if this.state.is_acquiring() {
                    info!("Drain cancelled, task acquisition resumed");
                    return;
                }
            }
            if this.registry.has_executing() {
                warn!(
                    "Drain ceiling reached with {} tasks still executing",
                    this.registry.executing_count()
                );
            } else {
                info!("All executing tasks finished");
            }
            this.pause().await;
            this.state.stop();
        }))
    }

    /// Closes the delegate stream, if any.
    pub async fn pause(&self) {
        if let Some(socket) = &self.socket {
            socket.stop().await;
        }
    }

    /// Resumes acquisition and reopens the stream in push mode.
    pub async fn resume(&self) {
        info!("Resuming task acquisition");
        self.state.resume_acquiring();
        if let Err(e) = self.store.put_data(&self.record, keys::SHUTDOWN_PENDING, false) {
            warn!("Unable to clear pending shutdown: {}", e);
        }
        if self.config.polling_mode {
            return;
        }
        if let Some(socket) = &self.socket {
            if let Err(e) = Arc::clone(socket).start(self.frames.clone()).await {
                error!("Unable to reopen delegate stream: {}", e);
            }
        }
    }
}
