/// Push-mode task intake over the delegate stream (WebSocket).
///
/// Frames are decoded on the reader task and handed to the frame channel; the
/// router and dispatcher never run on the socket's own I/O path.
use crate::auth::TokenSigner;
use crate::errors::{DaemonError, DaemonResult};
use crate::frame::{decode_frame, StreamFrame};
use crate::intake::TaskSource;
use crate::metrics::DelegateMetrics;
use crate::poll_source::PollTaskSource;
use crate::state::{now_millis, AgentState};
use async_trait::async_trait;
use delegate_core::AgentSession;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ceiling of the secure-channel reconnect backoff
const MAX_TLS_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Configuration for the stream connection
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Stream base URL (ws/wss), without trailing slash
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Plain connect failures tolerated before asking for a restart
    pub max_connect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            base_url: "wss://localhost:9090/api".to_string(),
            connect_timeout: Duration::from_secs(15),
            max_connect_attempts: 5,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// How one connected session ended.
enum SessionEnd {
    Stopped,
    Reconnect,
    ClosedByServer,
    Failed(WsError),
}

pub struct SocketTaskSource {
    config: SocketConfig,
    session: Arc<AgentSession>,
    state: Arc<AgentState>,
    signer: Arc<TokenSigner>,
    metrics: Arc<DelegateMetrics>,
    fallback: Option<Arc<PollTaskSource>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reconnect: Notify,
    running: Mutex<Option<CancellationToken>>,
}

impl SocketTaskSource {
    pub fn new(
        config: SocketConfig,
        session: Arc<AgentSession>,
        state: Arc<AgentState>,
        signer: Arc<TokenSigner>,
        metrics: Arc<DelegateMetrics>,
    ) -> Self {
        SocketTaskSource {
            config,
            session,
            state,
            signer,
            metrics,
            fallback: None,
            outbound: Mutex::new(None),
            reconnect: Notify::new(),
            running: Mutex::new(None),
        }
    }

    /// Poller started when the manager closes the stream.
    pub fn with_fallback(mut self, fallback: Arc<PollTaskSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn is_open(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Queues a text frame. Returns false when no session is open.
    pub fn send_text(&self, text: String) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    /// Closes the current session and opens a new one.
    pub fn request_reconnect(&self) {
        info!("Stream reconnect requested");
        self.reconnect.notify_one();
    }

    fn stream_url(&self) -> DaemonResult<String> {
        let token = self.signer.token()?;
        Ok(format!(
            "{}/stream/delegate/{}?delegateId={}&delegateConnectionId={}&token={}&version={}",
            self.config.base_url,
            self.session.account_id(),
            self.session.delegate_id(),
            self.session.connection_id(),
            token,
            self.session.version()
        ))
    }

    async fn run(self: Arc<Self>, sink: mpsc::Sender<StreamFrame>, cancel: CancellationToken) {
        let mut failed_attempts = 0u32;
        let mut tls_backoff = self.config.reconnect_delay;
        let self_destruct = self.state.self_destruct_token();

        loop {
            if cancel.is_cancelled() || self_destruct.is_cancelled() {
                break;
            }

            let url = match self.stream_url() {
                Ok(url) => url,
                Err(e) => {
                    error!("Unable to build stream URL: {}", e);
                    self.state.set_restart_needed(true);
                    break;
                }
            };

            let connected =
                match tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str())).await {
                    Ok(result) => result,
                    Err(_) => Err(WsError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "stream connect timed out",
                    ))),
                };

            let end = match connected {
                Ok((stream, _)) => {
                    info!("Connected to delegate stream");
                    failed_attempts = 0;
                    tls_backoff = self.config.reconnect_delay;
                    self.state.set_closing_socket(false);
                    self.metrics.connected.set(1);
                    let end = self.pump(stream, &sink, &cancel, &self_destruct).await;
                    *self.outbound.lock() = None;
                    self.metrics.connected.set(0);
                    end
                }
                Err(e) => SessionEnd::Failed(e),
            };

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Reconnect => {
                    self.metrics.socket_reconnects.inc();
                }
                SessionEnd::ClosedByServer => {
                    info!("Delegate stream closed by manager");
                    if let Some(fallback) = &self.fallback {
                        info!("Falling back to polling for task events");
                        if let Err(e) = Arc::clone(fallback).start(sink.clone()).await {
                            error!("Unable to start task poller: {}", e);
                        }
                    }
                    break;
                }
                SessionEnd::Failed(e) => match failure_policy(&e) {
                    FailurePolicy::Reopen => {
                        warn!(
                            "Secure channel failure on delegate stream: {}, reopening in {:?}",
                            e, tls_backoff
                        );
                        self.metrics.socket_reconnects.inc();
                        if self.wait(tls_backoff, &cancel).await {
                            break;
                        }
                        tls_backoff = (tls_backoff * 2).min(MAX_TLS_BACKOFF);
                    }
                    FailurePolicy::Retry => {
                        failed_attempts += 1;
                        warn!(
                            "Unable to connect to delegate stream (attempt {}/{}): {}",
                            failed_attempts, self.config.max_connect_attempts, e
                        );
                        if failed_attempts >= self.config.max_connect_attempts {
                            error!("Giving up on delegate stream, restart needed");
                            self.state.set_restart_needed(true);
                            break;
                        }
                        if self.wait(self.config.reconnect_delay, &cancel).await {
                            break;
                        }
                    }
                    FailurePolicy::Restart => {
                        error!("Delegate stream failed: {}, restart needed", e);
                        self.state.set_restart_needed(true);
                        break;
                    }
                },
            }
        }

        // Ended on its own: nobody called stop(), so the slot still holds our token
        if !cancel.is_cancelled() {
            self.running.lock().take();
            cancel.cancel();
        }
        debug!("Delegate stream task ended");
    }

    /// Returns true if cancelled while waiting.
    async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn pump(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        sink: &mpsc::Sender<StreamFrame>,
        cancel: &CancellationToken,
        self_destruct: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);

        // Re-announce identity on every (re)connect
        let now = now_millis();
        match serde_json::to_string(&self.session.heartbeat_params(now, false)) {
            Ok(announce) => {
                if let Err(e) = write.send(WsMessage::Text(announce)).await {
                    return SessionEnd::Failed(e);
                }
                self.state.mark_heartbeat_exchanged(now);
            }
            Err(e) => warn!("Unable to encode stream announcement: {}", e),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Stopped;
                }
                _ = self_destruct.cancelled() => {
                    info!("Closing delegate stream for self destruct");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Stopped;
                }
                _ = self.reconnect.notified() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Reconnect;
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        return SessionEnd::Failed(e);
                    }
                }
                message = read.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        if sink.send(decode_frame(&text)).await.is_err() {
                            return SessionEnd::Stopped;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if let Err(e) = write.send(WsMessage::Pong(payload)).await {
                            return SessionEnd::Failed(e);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::ClosedByServer,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Failed(e),
                },
            }
        }
    }
}

/// What the stream loop does after a failed connect or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePolicy {
    /// Secure-channel failure: reopen with growing backoff, indefinitely
    Reopen,
    /// Could not connect: retry until the attempt budget runs out
    Retry,
    /// Close and ask the watcher for a restart
    Restart,
}

fn failure_policy(error: &WsError) -> FailurePolicy {
    match error {
        WsError::Tls(_) => FailurePolicy::Reopen,
        WsError::Io(_) | WsError::Http(_) | WsError::Url(_) => FailurePolicy::Retry,
        _ => FailurePolicy::Restart,
    }
}

#[async_trait]
impl TaskSource for SocketTaskSource {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn start(self: Arc<Self>, sink: mpsc::Sender<StreamFrame>) -> DaemonResult<()> {
        if self.state.is_self_destructed() {
            return Err(DaemonError::SecureChannelError(
                "not opening stream during self destruct".to_string(),
            ));
        }
        let cancel = {
            let mut running = self.running.lock();
            if running.is_some() {
                debug!("Delegate stream already running");
                return Ok(());
            }
            let cancel = CancellationToken::new();
            *running = Some(cancel.clone());
            cancel
        };
        tokio::spawn(Arc::clone(&self).run(sink, cancel));
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            info!("Closing delegate stream");
            self.state.set_closing_socket(true);
            cancel.cancel();
        }
        if let Some(fallback) = &self.fallback {
            fallback.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delegate_core::AgentIdentity;

    fn source() -> SocketTaskSource {
        let session = Arc::new(
            AgentIdentity::new("acc", "host", "delegate", "1.0.0").into_session("d1"),
        );
        SocketTaskSource::new(
            SocketConfig {
                base_url: "wss://manager/api".to_string(),
                ..SocketConfig::default()
            },
            session,
            Arc::new(AgentState::new()),
            Arc::new(TokenSigner::new("acc", "secret", 300)),
            Arc::new(DelegateMetrics::new().unwrap()),
        )
    }

    #[test]
    fn test_stream_url_carries_identity_and_token() {
        let source = source();
        let url = source.stream_url().unwrap();
        assert!(url.starts_with("wss://manager/api/stream/delegate/acc?delegateId=d1&"));
        assert!(url.contains(&format!("delegateConnectionId={}", source.session.connection_id())));
        assert!(url.contains("&token="));
        assert!(url.ends_with("&version=1.0.0"));
    }

    #[test]
    fn test_send_text_without_session() {
        let source = source();
        assert!(!source.is_open());
        assert!(!source.send_text("hello".to_string()));
    }

    #[test]
    fn test_failure_policy() {
        use tokio_tungstenite::tungstenite::error::{ProtocolError, TlsError};

        assert_eq!(
            failure_policy(&WsError::Tls(TlsError::InvalidDnsName)),
            FailurePolicy::Reopen
        );
        let io = WsError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(failure_policy(&io), FailurePolicy::Retry);
        assert_eq!(
            failure_policy(&WsError::Protocol(ProtocolError::NonZeroReservedBits)),
            FailurePolicy::Restart
        );
        assert_eq!(failure_policy(&WsError::ConnectionClosed), FailurePolicy::Restart);
    }
}
