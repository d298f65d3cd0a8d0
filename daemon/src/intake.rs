/// Task intake: the transport-agnostic side of event delivery.
///
/// A [`TaskSource`] (socket or poll) pushes [`StreamFrame`]s into one channel.
/// The [`FrameRouter`] drains it, forwarding task events to the dispatcher and
/// handling control frames (heartbeat acks, self destruct, migrate, token
/// errors) itself.
use crate::dispatch::TaskDispatcher;
use crate::errors::DaemonResult;
use crate::frame::StreamFrame;
use crate::state::{now_millis, AgentState, HEARTBEAT_ACK_WARN_MS};
use async_trait::async_trait;
use delegate_core::message_store::keys;
use delegate_core::{AgentSession, DelegateStatus, HeartbeatResponse, MessageStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound of the frame channel between sources and the router.
pub const FRAME_CHANNEL_CAPACITY: usize = 1024;

/// Something that delivers task events.
#[async_trait]
pub trait TaskSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts delivering frames into `sink`. Returns once delivery is running.
    async fn start(self: Arc<Self>, sink: mpsc::Sender<StreamFrame>) -> DaemonResult<()>;

    /// Stops delivery. Safe to call when not running.
    async fn stop(&self);
}

pub struct FrameRouter {
    session: Arc<AgentSession>,
    state: Arc<AgentState>,
    dispatcher: Arc<TaskDispatcher>,
    store: Arc<MessageStore>,
    record: String,
}

impl FrameRouter {
    pub fn new(
        session: Arc<AgentSession>,
        state: Arc<AgentState>,
        dispatcher: Arc<TaskDispatcher>,
        store: Arc<MessageStore>,
        record: impl Into<String>,
    ) -> Self {
        FrameRouter {
            session,
            state,
            dispatcher,
            store,
            record: record.into(),
        }
    }

    /// Drains `frames` until the channel closes or `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut frames: mpsc::Receiver<StreamFrame>, shutdown: CancellationToken) {
        info!("Frame router started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => self.route(frame),
                    None => break,
                },
            }
        }
        info!("Frame router stopped");
    }

    pub fn route(&self, frame: StreamFrame) {
        match frame {
            StreamFrame::Keepalive => debug!("Keepalive received"),
            StreamFrame::Task(event) => self.dispatcher.dispatch(event),
            StreamFrame::HeartbeatAck(delegate_id) => self.on_heartbeat(&delegate_id),
            StreamFrame::HeartbeatResponse(response) => self.on_heartbeat_response(&response),
            StreamFrame::SelfDestruct(target) => self.on_self_destruct(&target),
            StreamFrame::Migrate(url) => self.on_migrate(&url),
            StreamFrame::Unknown(text) => warn!("Unknown message received on stream: {}", text),
            token @ (StreamFrame::InvalidToken | StreamFrame::ExpiredToken | StreamFrame::RevokedToken) => {
                if let Some(e) = token.token_error() {
                    self.state.apply_manager_error(&e);
                }
            }
        }
    }

    fn on_heartbeat(&self, delegate_id: &str) {
        if !self.session.is_self(delegate_id) {
            info!(
                "Heartbeat response for another delegate id {}, this delegate is {}",
                delegate_id,
                self.session.delegate_id()
            );
            return;
        }
        let now = now_millis();
        let last_sent = self.state.heartbeat().last_sent_at;
        if now - last_sent > HEARTBEAT_ACK_WARN_MS {
            warn!(
                "Heartbeat response received {}ms after the last heartbeat was sent",
                now - last_sent
            );
        }
        self.state.mark_heartbeat_received(now);
    }

    fn on_heartbeat_response(&self, response: &HeartbeatResponse) {
        self.on_heartbeat(&response.delegate_id);
        if response.status == DelegateStatus::Deleted && self.session.is_self(&response.delegate_id) {
            warn!("Delegate was deleted by the manager");
            self.state.initiate_self_destruct();
        }
    }

    fn on_self_destruct(&self, target: &str) {
        let with_connection = format!(
            "{}-{}",
            self.session.delegate_id(),
            self.session.connection_id()
        );
        if target.is_empty() || self.session.is_self(target) || target == with_connection {
            warn!("Self destruct message received");
            self.state.initiate_self_destruct();
        } else {
            debug!("Self destruct for another delegate ignored: {}", target);
        }
    }

    fn on_migrate(&self, url: &str) {
        let mut url = url.trim().to_string();
        if url.is_empty() {
            warn!("Migrate message without a URL ignored");
            return;
        }
        if !url.ends_with('/') {
            url.push('/');
        }
        info!("Delegate asked to migrate to {}", url);
        if let Err(e) = self.store.put_data(&self.record, keys::MIGRATE, url) {
            error!("Unable to record migration target: {}", e);
        }
    }
}
