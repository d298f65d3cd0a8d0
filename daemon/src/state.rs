/// Process-wide agent flags and heartbeat timestamps.
///
/// Everything here is written from several tasks at once. Identity lives in
/// [`delegate_core::AgentSession`] and never changes; this type holds only the
/// timestamps and the acquisition/upgrade/shutdown flags.
use delegate_core::ManagerError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Heartbeat received this long ago (unfrozen) means restart.
pub const HEARTBEAT_TIMEOUT_MS: i64 = 15 * 60 * 1000;
/// Socket considered dead when no heartbeat ack arrived for this long.
pub const HEARTBEAT_SOCKET_TIMEOUT_MS: i64 = 5 * 60 * 1000;
/// Frozen this long means restart.
pub const FROZEN_TIMEOUT_MS: i64 = 2 * 60 * 60 * 1000;
/// An ack arriving this long after the last send is logged.
pub const HEARTBEAT_ACK_WARN_MS: i64 = 3 * 60 * 1000;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Why a task event was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    SelfDestructed,
    NotAcquiring,
    Frozen,
    UpgradeInProgress,
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::SelfDestructed => write!(f, "self destruct in progress"),
            Refusal::NotAcquiring => write!(f, "not acquiring tasks"),
            Refusal::Frozen => write!(f, "delegate is frozen"),
            Refusal::UpgradeInProgress => write!(f, "upgrade pending"),
        }
    }
}

/// Last heartbeat sent/received, epoch millis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatClock {
    pub last_sent_at: i64,
    pub last_received_at: i64,
}

pub struct AgentState {
    acquire_tasks: AtomicBool,
    frozen: AtomicBool,
    frozen_at: AtomicI64,
    restart_needed: AtomicBool,
    upgrade_pending: AtomicBool,
    upgrade_needed: AtomicBool,
    closing_socket: AtomicBool,
    shutdown_started_at: AtomicI64,
    heartbeat: Mutex<HeartbeatClock>,
    self_destruct: CancellationToken,
    shutdown: CancellationToken,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    pub fn new() -> Self {
        let now = now_millis();
        AgentState {
            acquire_tasks: AtomicBool::new(true),
            frozen: AtomicBool::new(false),
            frozen_at: AtomicI64::new(0),
            restart_needed: AtomicBool::new(false),
            upgrade_pending: AtomicBool::new(false),
            upgrade_needed: AtomicBool::new(false),
            closing_socket: AtomicBool::new(false),
            shutdown_started_at: AtomicI64::new(0),
            heartbeat: Mutex::new(HeartbeatClock {
                last_sent_at: now,
                last_received_at: now,
            }),
            self_destruct: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    // ============================================================================
    // ACQUISITION GATE
    // ============================================================================

    /// Decides whether a new task event may enter the pipeline.
    ///
    /// Stopping acquisition blocks everything; a pending upgrade blocks only
    /// asynchronous work.
    pub fn admit(&self, sync: bool) -> Result<(), Refusal> {
        if self.is_self_destructed() {
            return Err(Refusal::SelfDestructed);
        }
        if !self.is_acquiring() {
            return Err(Refusal::NotAcquiring);
        }
        if self.is_frozen() {
            return Err(Refusal::Frozen);
        }
        if !sync && (self.is_upgrade_pending() || self.is_upgrade_needed()) {
            return Err(Refusal::UpgradeInProgress);
        }
        Ok(())
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquire_tasks.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that actually stopped acquisition.
    pub fn stop_acquiring(&self) -> bool {
        self.acquire_tasks.swap(false, Ordering::SeqCst)
    }

    pub fn resume_acquiring(&self) {
        self.restart_needed.store(false, Ordering::SeqCst);
        self.acquire_tasks.store(true, Ordering::SeqCst);
    }

    pub fn should_contact_manager(&self) -> bool {
        !self.is_self_destructed()
    }

    // ============================================================================
    // SELF DESTRUCT / FREEZE
    // ============================================================================

    pub fn initiate_self_destruct(&self) {
        if self.self_destruct.is_cancelled() {
            return;
        }
        info!("Self destruct sequence initiated...");
        self.acquire_tasks.store(false, Ordering::SeqCst);
        self.restart_needed.store(false, Ordering::SeqCst);
        self.self_destruct.cancel();
    }

    pub fn is_self_destructed(&self) -> bool {
        self.self_destruct.is_cancelled()
    }

    /// Cancelled once self destruct starts.
    pub fn self_destruct_token(&self) -> CancellationToken {
        self.self_destruct.clone()
    }

    pub fn freeze(&self, now: i64) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            self.frozen_at.store(now, Ordering::SeqCst);
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn frozen_at(&self) -> i64 {
        self.frozen_at.load(Ordering::SeqCst)
    }

    /// Reacts to token errors reported by the manager.
    pub fn apply_manager_error(&self, error: &ManagerError) {
        match error {
            ManagerError::InvalidToken => {
                warn!("Delegate used invalid token. Self destruct procedure will be initiated.");
                self.initiate_self_destruct();
            }
            ManagerError::ExpiredToken => {
                warn!("Delegate used expired token. It will be frozen and drained.");
                self.freeze(now_millis());
            }
            ManagerError::RevokedToken => {
                warn!("Delegate used revoked token. It will be frozen and drained.");
                self.freeze(now_millis());
            }
            _ => {}
        }
    }

    // ============================================================================
    // RESTART / UPGRADE / SHUTDOWN FLAGS
    // ============================================================================

    pub fn is_restart_needed(&self) -> bool {
        self.restart_needed.load(Ordering::SeqCst)
    }

    pub fn set_restart_needed(&self, needed: bool) {
        self.restart_needed.store(needed, Ordering::SeqCst);
    }

    pub fn is_upgrade_pending(&self) -> bool {
        self.upgrade_pending.load(Ordering::SeqCst)
    }

    pub fn set_upgrade_pending(&self, pending: bool) {
        self.upgrade_pending.store(pending, Ordering::SeqCst);
    }

    pub fn is_upgrade_needed(&self) -> bool {
        self.upgrade_needed.load(Ordering::SeqCst)
    }

    pub fn set_upgrade_needed(&self, needed: bool) {
        self.upgrade_needed.store(needed, Ordering::SeqCst);
    }

    pub fn is_closing_socket(&self) -> bool {
        self.closing_socket.load(Ordering::SeqCst)
    }

    pub fn set_closing_socket(&self, closing: bool) {
        self.closing_socket.store(closing, Ordering::SeqCst);
    }

    pub fn mark_shutdown_started(&self, now: i64) {
        self.shutdown_started_at.store(now, Ordering::SeqCst);
    }

    pub fn shutdown_started_at(&self) -> i64 {
        self.shutdown_started_at.load(Ordering::SeqCst)
    }

    /// Whether the watcher should restart this process.
    pub fn restart_required(&self, watched: bool, now: i64) -> bool {
        if !self.is_acquiring() {
            return true;
        }
        if !watched {
            return false;
        }
        let last_received = self.heartbeat().last_received_at;
        let frozen = self.is_frozen();
        self.is_restart_needed()
            || (!frozen && now - last_received > HEARTBEAT_TIMEOUT_MS)
            || (frozen && now - self.frozen_at() > FROZEN_TIMEOUT_MS)
    }

    // ============================================================================
    // HEARTBEAT CLOCK
    // ============================================================================

    pub fn heartbeat(&self) -> HeartbeatClock {
        *self.heartbeat.lock()
    }

    pub fn mark_heartbeat_sent(&self, now: i64) {
        self.heartbeat.lock().last_sent_at = now;
    }

    pub fn mark_heartbeat_received(&self, now: i64) {
        self.heartbeat.lock().last_received_at = now;
    }

    /// Records a round trip: both timestamps move together.
    pub fn mark_heartbeat_exchanged(&self, now: i64) {
        let mut clock = self.heartbeat.lock();
        clock.last_sent_at = now;
        clock.last_received_at = now;
    }

    // ============================================================================
    // PROCESS STOP
    // ============================================================================

    /// Releases the main wait so the process can exit.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_gating_matrix() {
        let state = AgentState::new();
        assert_eq!(state.admit(true), Ok(()));
        assert_eq!(state.admit(false), Ok(()));

        state.set_upgrade_pending(true);
        assert_eq!(state.admit(true), Ok(()));
        assert_eq!(state.admit(false), Err(Refusal::UpgradeInProgress));

        state.set_upgrade_pending(false);
        state.set_upgrade_needed(true);
        assert_eq!(state.admit(true), Ok(()));
        assert_eq!(state.admit(false), Err(Refusal::UpgradeInProgress));

        assert!(state.stop_acquiring());
        assert_eq!(state.admit(true), Err(Refusal::NotAcquiring));
        assert_eq!(state.admit(false), Err(Refusal::NotAcquiring));
    }

    #[test]
    fn test_stop_acquiring_only_once() {
        let state = AgentState::new();
        assert!(state.stop_acquiring());
        assert!(!state.stop_acquiring());
        state.resume_acquiring();
        assert!(state.is_acquiring());
    }

    #[test]
    fn test_self_destruct_blocks_everything() {
        let state = AgentState::new();
        state.set_restart_needed(true);
        state.initiate_self_destruct();
        assert!(state.is_self_destructed());
        assert!(!state.is_acquiring());
        assert!(!state.is_restart_needed());
        assert!(!state.should_contact_manager());
        assert_eq!(state.admit(true), Err(Refusal::SelfDestructed));
    }

    #[test]
    fn test_token_errors() {
        let state = AgentState::new();
        state.apply_manager_error(&ManagerError::Timeout);
        assert!(!state.is_frozen());

        state.apply_manager_error(&ManagerError::RevokedToken);
        assert!(state.is_frozen());
        assert!(state.frozen_at() > 0);
        assert_eq!(state.admit(true), Err(Refusal::Frozen));

        state.apply_manager_error(&ManagerError::InvalidToken);
        assert!(state.is_self_destructed());
    }

    #[test]
    fn test_restart_required_truth_table() {
        let now = now_millis();

        // not acquiring always restarts
        let state = AgentState::new();
        state.stop_acquiring();
        assert!(state.restart_required(false, now));

        // unwatched agents never ask otherwise
        let state = AgentState::new();
        state.set_restart_needed(true);
        assert!(!state.restart_required(false, now));
        assert!(state.restart_required(true, now));

        // stale heartbeat while not frozen
        let state = AgentState::new();
        state.mark_heartbeat_received(now - HEARTBEAT_TIMEOUT_MS - 1);
        assert!(state.restart_required(true, now));
        state.mark_heartbeat_received(now);
        assert!(!state.restart_required(true, now));

        // frozen ignores heartbeat staleness until the frozen timeout
        let state = AgentState::new();
        state.mark_heartbeat_received(now - HEARTBEAT_TIMEOUT_MS - 1);
        state.freeze(now - 1000);
        assert!(!state.restart_required(true, now));
        assert!(state.restart_required(true, now + FROZEN_TIMEOUT_MS));
    }

    #[test]
    fn test_heartbeat_exchange_moves_both() {
        let state = AgentState::new();
        state.mark_heartbeat_exchanged(1234);
        assert_eq!(
            state.heartbeat(),
            HeartbeatClock {
                last_sent_at: 1234,
                last_received_at: 1234
            }
        );
        state.mark_heartbeat_sent(2000);
        assert_eq!(state.heartbeat().last_received_at, 1234);
    }
}
