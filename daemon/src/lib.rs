/// Delegate agent: acquires, validates and executes tasks handed out by a
/// remote manager, reporting results back and cooperating with a watcher process.
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod executor;
pub mod frame;
pub mod intake; // Frame channel shared by socket and poll sources
pub mod manager;
pub mod manager_client;
pub mod metrics;
pub mod poll_source;
pub mod pool;
pub mod profile;
pub mod registration;
pub mod registry;
pub mod scripts;
pub mod service;
pub mod socket_source;
pub mod state;
pub mod supervisor; // Heartbeat, upgrade, local status and drain timers
pub mod tasks;
pub mod time_limit;
pub mod timeout;
pub mod watcher;

// Re-export commonly used types
pub use config::DelegateConfig;
pub use dispatch::{DispatchConfig, DispatchOutcome, TaskDispatcher};
pub use errors::{DaemonError, DaemonResult};
pub use executor::{ExecutionReporter, StatusRetryPolicy, TaskExecutor};
pub use frame::{decode_frame, StreamFrame};
pub use intake::{FrameRouter, TaskSource};
pub use manager::ManagerHandle;
pub use manager_client::HttpManagerClient;
pub use metrics::DelegateMetrics;
pub use registry::{TaskHandle, TaskRegistry};
pub use service::{DelegateRuntime, DelegateService};
pub use state::AgentState;
pub use supervisor::Supervisor;
pub use tasks::ShellScriptFactory;

/// Agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
