/// The delegate process: registration, wiring and lifecycle.
use crate::auth::TokenSigner;
use crate::config::DelegateConfig;
use crate::dispatch::{DispatchConfig, TaskDispatcher};
use crate::errors::DaemonResult;
use crate::executor::{ExecutionReporter, StatusRetryPolicy, TaskExecutor};
use crate::frame::StreamFrame;
use crate::intake::{FrameRouter, TaskSource, FRAME_CHANNEL_CAPACITY};
use crate::manager::ManagerHandle;
use crate::metrics::DelegateMetrics;
use crate::pool::ExecutorPools;
use crate::poll_source::PollTaskSource;
use crate::profile::ProfileManager;
use crate::registration::Registrar;
use crate::registry::TaskRegistry;
use crate::socket_source::{SocketConfig, SocketTaskSource};
use crate::state::{now_millis, AgentState};
use crate::supervisor::{spawn_timer, Supervisor, SupervisorConfig};
use crate::timeout::TimeoutPolicy;
use crate::watcher::{WatcherConfig, WatcherMonitor, WatcherStatus};
use delegate_core::message_store::{keys, messages, UNREGISTERED};
use delegate_core::{
    AgentIdentity, AgentSession, ManagerClient, MessageStore, MessengerType, TaskFactoryRegistry,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything that runs once the delegate is registered.
pub struct DelegateRuntime {
    pub session: Arc<AgentSession>,
    pub manager: Arc<ManagerHandle>,
    pub registry: Arc<TaskRegistry>,
    pub executor: Arc<TaskExecutor>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub router: Arc<FrameRouter>,
    pub poller: Arc<PollTaskSource>,
    pub socket: Option<Arc<SocketTaskSource>>,
    pub supervisor: Arc<Supervisor>,
    pub frames: mpsc::Sender<StreamFrame>,
}

impl DelegateRuntime {
    /// Wires the components for a registered session.
    ///
    /// Returns the runtime and the receiving end of the frame channel.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        config: &DelegateConfig,
        client: Arc<dyn ManagerClient>,
        session: Arc<AgentSession>,
        state: Arc<AgentState>,
        store: Arc<MessageStore>,
        record: &str,
        factories: Arc<TaskFactoryRegistry>,
        metrics: Arc<DelegateMetrics>,
    ) -> (Self, mpsc::Receiver<StreamFrame>) {
        let polling = config.agent.polling_mode;
        let call_timeout = Duration::from_secs(config.manager.call_timeout_secs);
        let manager = Arc::new(ManagerHandle::new(
            client,
            Arc::clone(&session),
            Arc::clone(&state),
            polling,
            call_timeout,
        ));
        let registry = Arc::new(TaskRegistry::new());
        let pools = Arc::new(ExecutorPools::new(&config.pools));

        let reporter = Arc::new(ExecutionReporter::new(
            Arc::clone(&manager),
            Arc::clone(&registry),
            StatusRetryPolicy {
                attempts: config.timing.status_retry_attempts,
                delay: Duration::from_millis(config.timing.status_retry_delay_ms),
            },
            Arc::clone(&metrics),
        ));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&factories),
            Arc::clone(&pools),
            reporter,
            TimeoutPolicy::from_config(&config.timing),
            Arc::clone(&metrics),
        ));

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&session),
            Arc::clone(&state),
            Arc::clone(&manager),
            Arc::clone(&registry),
            factories,
            pools,
            Arc::clone(&executor),
            Arc::clone(&metrics),
            DispatchConfig {
                throttle_step: Duration::from_millis(config.timing.throttle_step_ms),
                throttle_cap: config.timing.throttle_cap,
                poll_interval: config.agent.poll_interval(),
                fairness_extra: Duration::from_millis(config.timing.fairness_extra_delay_ms),
                supported_task_types: config.agent.supported_task_types.iter().cloned().collect(),
            },
        ));

        let (frames, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let router = Arc::new(FrameRouter::new(
            Arc::clone(&session),
            Arc::clone(&state),
            Arc::clone(&dispatcher),
            Arc::clone(&store),
            record,
        ));

        let poller = Arc::new(PollTaskSource::new(
            Arc::clone(&manager),
            Arc::clone(&state),
            config.agent.poll_interval(),
        ));
        let socket = (!polling).then(|| {
            let signer = Arc::new(TokenSigner::new(
                &config.manager.account_id,
                &config.manager.account_secret,
                config.manager.token_expiry_secs,
            ));
            Arc::new(
                SocketTaskSource::new(
                    SocketConfig {
                        base_url: config.manager.stream_base(),
                        connect_timeout: call_timeout,
                        max_connect_attempts: config.agent.socket_connect_attempts,
                        ..SocketConfig::default()
                    },
                    Arc::clone(&session),
                    Arc::clone(&state),
                    signer,
                    Arc::clone(&metrics),
                )
                .with_fallback(Arc::clone(&poller)),
            )
        });

        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&session),
            state,
            Arc::clone(&manager),
            Arc::clone(&registry),
            store,
            record,
            socket.clone(),
            frames.clone(),
            metrics,
            SupervisorConfig::from_config(config),
        ));

        let runtime = DelegateRuntime {
            session,
            manager,
            registry,
            executor,
            dispatcher,
            router,
            poller,
            socket,
            supervisor,
            frames,
        };
        (runtime, frames_rx)
    }

    /// Starts the configured task source.
    pub async fn start_intake(&self) -> DaemonResult<()> {
        match &self.socket {
            Some(socket) => Arc::clone(socket).start(self.frames.clone()).await,
            None => Arc::clone(&self.poller).start(self.frames.clone()).await,
        }
    }

    pub async fn stop_intake(&self) {
        if let Some(socket) = &self.socket {
            socket.stop().await;
        }
        self.poller.stop().await;
    }
}

pub struct DelegateService {
    config: DelegateConfig,
    client: Arc<dyn ManagerClient>,
    factories: Arc<TaskFactoryRegistry>,
    state: Arc<AgentState>,
    store: Arc<MessageStore>,
    record: String,
    metrics: Arc<DelegateMetrics>,
    identity: AgentIdentity,
}

impl DelegateService {
    pub fn new(
        config: DelegateConfig,
        client: Arc<dyn ManagerClient>,
        factories: Arc<TaskFactoryRegistry>,
    ) -> DaemonResult<Self> {
        let host_name = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
        let identity = AgentIdentity::new(
            config.manager.account_id.clone(),
            host_name,
            config.agent.name.clone(),
            config.agent.version(),
        );
        let process_id = std::process::id().to_string();
        let store = Arc::new(MessageStore::open(
            &config.store.dir,
            MessengerType::Delegate,
            process_id.clone(),
        )?);

        Ok(DelegateService {
            config,
            client,
            factories,
            state: Arc::new(AgentState::new()),
            store,
            record: format!("delegate-{}", process_id),
            metrics: Arc::new(DelegateMetrics::new()?),
            identity,
        })
    }

    /// Process-wide flags; `stop()` on it ends [`DelegateService::run`].
    pub fn state(&self) -> Arc<AgentState> {
        Arc::clone(&self.state)
    }

    pub fn metrics(&self) -> Arc<DelegateMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Registers and runs until stopped.
    pub async fn run(self) -> DaemonResult<()> {
        self.announce_start()?;

        let supported_task_types = if self.config.agent.supported_task_types.is_empty() {
            self.factories.task_types()
        } else {
            self.config.agent.supported_task_types.clone()
        };
        let registrar = Registrar::new(
            Arc::clone(&self.client),
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            self.record.clone(),
            Duration::from_secs(self.config.timing.register_retry_delay_secs),
            Duration::from_secs(self.config.manager.call_timeout_secs),
        );
        let params = self
            .identity
            .register_params(self.config.agent.polling_mode, supported_task_types);
        let delegate_id = registrar.register(&params).await?;
        self.store
            .put_data(&self.record, keys::DELEGATE_ID, delegate_id.clone())?;

        let session = Arc::new(self.identity.clone().into_session(delegate_id));
        let (runtime, frames_rx) = DelegateRuntime::assemble(
            &self.config,
            Arc::clone(&self.client),
            Arc::clone(&session),
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            &self.record,
            Arc::clone(&self.factories),
            Arc::clone(&self.metrics),
        );

        let shutdown = self.state.shutdown_token();
        let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(
            Arc::clone(&runtime.router).run(frames_rx, shutdown.clone()),
        )];
        runtime.start_intake().await?;
        tasks.extend(runtime.supervisor.start());
        tasks.extend(self.start_monitors(&runtime));

        info!(
            "Delegate {} started ({} mode)",
            session.delegate_id(),
            if self.config.agent.polling_mode { "polling" } else { "streaming" }
        );

        shutdown.cancelled().await;
        info!("Delegate stopping");

        runtime.stop_intake().await;
        if self.state.should_contact_manager() {
            if let Err(e) = runtime.manager.unregister().await {
                warn!("Unable to unregister delegate: {}", e);
            }
        }
        if let Err(e) = self.store.close_channel() {
            warn!("Unable to close message channel: {}", e);
        }
        for task in tasks {
            task.abort();
        }
        info!("Delegate {} stopped", session.delegate_id());
        Ok(())
    }

    /// Seeds the status record and tells the watcher this process is up.
    fn announce_start(&self) -> DaemonResult<()> {
        let entries: Map<String, Value> = [
            (keys::DELEGATE_ID, Value::from(UNREGISTERED)),
            (keys::VERSION, Value::from(self.identity.version.clone())),
            (keys::IS_NEW, Value::from(true)),
            (keys::HEARTBEAT, Value::from(now_millis())),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
        self.store.put_all_data(&self.record, entries)?;

        if self.config.agent.watched {
            match WatcherStatus::read(&self.store)?.pid {
                Some(pid) => {
                    let own_pid = std::process::id().to_string();
                    self.store.write_message(
                        MessengerType::Watcher,
                        &pid.to_string(),
                        messages::DELEGATE_STARTED,
                        &[own_pid.as_str()],
                    )?;
                }
                None => warn!("Watcher process unknown, start not announced"),
            }
        }
        Ok(())
    }

    fn start_monitors(&self, runtime: &DelegateRuntime) -> Vec<JoinHandle<()>> {
        let shutdown = self.state.shutdown_token();
        let mut timers = Vec::new();

        if self.config.agent.watched {
            let monitor = Arc::new(WatcherMonitor::new(
                Arc::clone(&runtime.manager),
                Arc::clone(&self.state),
                Arc::clone(&self.store),
                WatcherConfig {
                    working_dir: self.config.agent.working_dir.clone(),
                    expected_version: self.config.agent.expected_watcher_version.clone(),
                    launch_command: self.config.agent.watcher_launch_command.clone(),
                    ..WatcherConfig::default()
                },
            ));
            timers.push(spawn_timer(
                "watcher monitor",
                Duration::from_secs(self.config.timing.watcher_check_interval_secs),
                shutdown.clone(),
                move || {
                    let monitor = Arc::clone(&monitor);
                    async move { monitor.check().await }
                },
            ));
        }

        let profile = Arc::new(ProfileManager::new(
            Arc::clone(&runtime.manager),
            Arc::clone(&self.state),
            self.config.agent.working_dir.clone(),
        ));
        timers.push(spawn_timer(
            "profile check",
            Duration::from_secs(self.config.timing.profile_check_interval_secs),
            shutdown,
            move || {
                let profile = Arc::clone(&profile);
                async move { profile.check().await }
            },
        ));

        if self.state.is_self_destructed() {
            error!("Self destruct started during startup");
        }
        timers
    }
}
