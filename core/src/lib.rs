// Delegate: task dispatch agent
// Core library providing the task model, manager contract and watcher side channel

pub mod errors;
pub mod message_store;
pub mod session;
pub mod task;
pub mod task_factory;
pub mod traits;
pub mod wire;

// Re-export commonly used types
pub use errors::{
    ManagerError, ManagerResult, StoreError, StoreResult, TaskError, TaskResult,
};

pub use message_store::{Message, MessageStore, MessengerType};

pub use session::{AgentIdentity, AgentSession};

pub use task::{
    is_validated, PoolKind, ResponseCode, ScriptBundle, Task, TaskEvent, TaskEventKind,
    TaskResponse, ValidationResult,
};

pub use task_factory::TaskFactoryRegistry;

pub use traits::{
    DelegateRunnableTask, DelegateValidateTask, ExecutionHooks, ManagerClient, TaskContext,
    TaskFactory,
};

pub use wire::{
    ConnectionHeartbeat, DelegateParams, DelegateRegisterResponse, DelegateStatus,
    HeartbeatResponse, ProfileParams, RegisterAction,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
