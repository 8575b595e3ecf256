//! WebSocket transport manager.
//!
//! [`TransportManager`] is a cheap, cloneable handle. All socket I/O,
//! timers and state changes live in one driver task that multiplexes the
//! command channel, the connect future, the socket stream and three
//! deadlines (reconnect, liveness, ping) with `tokio::select!`. Because
//! every timer is a field of the driver, none can outlive a reconnect
//! cycle.
//!
//! ```text
//!   handle ──Command──► driver ──TransportEvent──► events receiver
//!                          │ ▲
//!              ws frames   ▼ │   ws frames
//!                        server
//! ```

use std::collections::VecDeque;
use std::future::Future;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::codec::MdiCodec;
use crate::config::TransportConfig;
use crate::error::MdiError;
use crate::offload::WorkerOffload;
use crate::protocol::{ClientRequest, DecodedFrame, HeartbeatPayload, Message, ServerText};
use crate::state::ConnectionState;
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::events::TransportEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A frame queued for the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
}

impl Outbound {
    fn into_ws(self) -> WsMessage {
        match self {
            Outbound::Text(text) => WsMessage::text(text),
            Outbound::Binary(bytes) => WsMessage::Binary(bytes),
        }
    }
}

/// Snapshot of driver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames waiting for the next successful connection.
    pub queued: usize,
    /// Consecutive reconnection attempts since the last success.
    pub reconnect_attempts: u32,
    pub frames_received: u64,
    pub frames_rejected: u64,
    /// Queued frames discarded because the queue was full.
    pub frames_dropped: u64,
}

enum Command {
    Connect,
    Disconnect { done: oneshot::Sender<()> },
    Send(Outbound),
    Stats { reply: oneshot::Sender<TransportStats> },
    Shutdown,
}

// ── Handle ───────────────────────────────────────────────────────

/// Handle to the transport driver task.
#[derive(Debug, Clone)]
pub struct TransportManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    heartbeat: watch::Receiver<Option<HeartbeatPayload>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect => write!(f, "Connect"),
            Command::Disconnect { .. } => write!(f, "Disconnect"),
            Command::Send(o) => write!(f, "Send({o:?})"),
            Command::Stats { .. } => write!(f, "Stats"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl TransportManager {
    /// Start the driver task. The socket is not opened until [`connect`].
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// [`connect`]: TransportManager::connect
    pub fn spawn(
        config: TransportConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), MdiError> {
        Self::spawn_with_offload(config, None)
    }

    /// As [`spawn`](TransportManager::spawn), decoding binary frames
    /// through `offload` when given.
    pub fn spawn_with_offload(
        config: TransportConfig,
        offload: Option<WorkerOffload>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), MdiError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (hb_tx, hb_rx) = watch::channel(None);

        let driver = Driver {
            policy: ReconnectPolicy::from_config(&config),
            config,
            codec: MdiCodec::new(),
            offload,
            commands: cmd_rx,
            events: event_tx,
            state: ConnectionState::Disconnected,
            state_tx,
            heartbeat_tx: hb_tx,
            socket: None,
            connecting: None,
            queue: VecDeque::new(),
            attempts: 0,
            suppressed: false,
            reconnect_at: None,
            liveness_deadline: None,
            next_ping: None,
            stats: TransportStats::default(),
        };
        tokio::spawn(driver.run());

        Ok((
            Self {
                commands: cmd_tx,
                state: state_rx,
                heartbeat: hb_rx,
            },
            event_rx,
        ))
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open the connection. No-op while connecting or connected.
    pub async fn connect(&self) -> Result<(), MdiError> {
        self.command(Command::Connect).await
    }

    /// Close the connection and suppress reconnection until the next
    /// [`connect`](TransportManager::connect).
    pub async fn disconnect(&self) -> Result<(), MdiError> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Disconnect { done }).await?;
        rx.await.map_err(|_| MdiError::ChannelClosed)
    }

    /// Disconnect and stop the driver. Later calls on any clone fail with
    /// [`MdiError::ChannelClosed`].
    pub async fn shutdown(&self) -> Result<(), MdiError> {
        self.command(Command::Shutdown).await
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Send now if connected, otherwise queue until the next open.
    pub async fn send(&self, frame: Outbound) -> Result<(), MdiError> {
        self.command(Command::Send(frame)).await
    }

    pub async fn send_structured(&self, request: &ClientRequest) -> Result<(), MdiError> {
        let text = serde_json::to_string(request).map_err(|e| MdiError::Encoding(e.to_string()))?;
        self.send(Outbound::Text(text)).await
    }

    pub async fn request_slice(&self, file_id: &str, slice_index: u32) -> Result<(), MdiError> {
        self.send_structured(&ClientRequest::slice(file_id, slice_index))
            .await
    }

    pub async fn request_metadata(&self, file_id: &str) -> Result<(), MdiError> {
        self.send_structured(&ClientRequest::metadata(file_id)).await
    }

    pub async fn ping(&self) -> Result<(), MdiError> {
        self.send_structured(&ClientRequest::Ping).await
    }

    // ── Observables ──────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn last_heartbeat(&self) -> Option<HeartbeatPayload> {
        *self.heartbeat.borrow()
    }

    pub fn subscribe_heartbeat(&self) -> watch::Receiver<Option<HeartbeatPayload>> {
        self.heartbeat.clone()
    }

    pub async fn stats(&self) -> Result<TransportStats, MdiError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stats { reply }).await?;
        rx.await.map_err(|_| MdiError::ChannelClosed)
    }

    /// Wait until the state satisfies `pred`, returning that state.
    pub async fn wait_for_state(
        &self,
        pred: impl Fn(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, MdiError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| MdiError::ChannelClosed)?;
        Ok(state.clone())
    }

    async fn command(&self, cmd: Command) -> Result<(), MdiError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| MdiError::ChannelClosed)
    }
}

// ── Driver ───────────────────────────────────────────────────────

struct Driver {
    config: TransportConfig,
    policy: ReconnectPolicy,
    codec: MdiCodec,
    offload: Option<WorkerOffload>,

    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat_tx: watch::Sender<Option<HeartbeatPayload>>,

    socket: Option<WsStream>,
    connecting: Option<BoxFuture<'static, Result<WsStream, MdiError>>>,
    queue: VecDeque<Outbound>,

    attempts: u32,
    /// Set by `disconnect()`; cleared by `connect()`.
    suppressed: bool,

    reconnect_at: Option<Instant>,
    liveness_deadline: Option<Instant>,
    next_ping: Option<Instant>,

    stats: TransportStats,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                result = next_opt(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result).await;
                }
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
                _ = sleep_until_opt(self.liveness_deadline) => self.on_liveness_timeout().await,
                _ = sleep_until_opt(self.next_ping) => self.on_ping_due().await,
            }
        }

        self.close_manually().await;
        debug!("transport driver stopped");
    }

    // ── Commands ─────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                self.suppressed = false;
                if self.state.is_active() {
                    return;
                }
                if matches!(self.state, ConnectionState::Error) {
                    self.attempts = 0;
                }
                self.reconnect_at = None;
                self.start_connect();
            }
            Command::Disconnect { done } => {
                self.close_manually().await;
                let _ = done.send(());
            }
            Command::Send(frame) => self.send_or_queue(frame).await,
            Command::Stats { reply } => {
                let mut stats = self.stats;
                stats.queued = self.queue.len();
                stats.reconnect_attempts = self.attempts;
                let _ = reply.send(stats);
            }
            Command::Shutdown => {}
        }
    }

    async fn send_or_queue(&mut self, frame: Outbound) {
        let Some(ws) = self.socket.as_mut() else {
            let limit = self.config.max_queued;
            if limit > 0 && self.queue.len() >= limit {
                self.queue.pop_front();
                self.stats.frames_dropped += 1;
                warn!(limit, "outbound queue full; dropped oldest frame");
            }
            debug!(queued = self.queue.len() + 1, "not connected; queueing frame");
            self.queue.push_back(frame);
            return;
        };
        if let Err(e) = ws.send(frame.clone().into_ws()).await {
            warn!("send failed: {e}");
            self.queue.push_front(frame);
            self.emit(TransportEvent::ConnectionError(e.into()));
            self.on_closed(None, "send failed".into());
        }
    }

    // ── Connecting ───────────────────────────────────────────────

    fn start_connect(&mut self) {
        if self.state.begin_connect().is_err() {
            return;
        }
        self.publish_state();
        info!(url = %self.config.url, attempt = self.attempts, "connecting");

        let url = self.config.url.clone();
        let timeout = self.config.connect_timeout();
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, connect_async(url)).await {
                Ok(Ok((ws, _response))) => Ok(ws),
                Ok(Err(e)) => Err(MdiError::from(e)),
                Err(_) => Err(MdiError::Timeout(timeout)),
            }
        }));
    }

    async fn on_connect_result(&mut self, result: Result<WsStream, MdiError>) {
        match result {
            Ok(ws) => {
                if self.state.complete_connect().is_err() {
                    return;
                }
                self.socket = Some(ws);
                self.attempts = 0;
                self.arm_timers();
                info!(url = %self.config.url, "connected");
                self.emit(TransportEvent::Open);
                self.flush_queue().await;
                self.publish_state();
            }
            Err(e) => {
                warn!("connect failed: {e}");
                self.emit(TransportEvent::ConnectionError(e));
                self.schedule_reconnect();
            }
        }
    }

    async fn flush_queue(&mut self) {
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "flushing queued frames");
        }
        while let Some(frame) = self.queue.pop_front() {
            let Some(ws) = self.socket.as_mut() else {
                self.queue.push_front(frame);
                return;
            };
            if let Err(e) = ws.send(frame.clone().into_ws()).await {
                warn!("flush failed: {e}");
                self.queue.push_front(frame);
                self.emit(TransportEvent::ConnectionError(e.into()));
                self.on_closed(None, "send failed".into());
                return;
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>) {
        match frame {
            Some(Ok(WsMessage::Binary(bytes))) => self.on_binary(bytes).await,
            Some(Ok(WsMessage::Text(text))) => match ServerText::parse(text.as_str()) {
                ServerText::Pong { timestamp } => {
                    self.refresh_liveness();
                    self.emit(TransportEvent::Pong { timestamp });
                }
                other => self.emit(TransportEvent::Text(other)),
            },
            Some(Ok(WsMessage::Close(frame))) => {
                let (code, reason) = close_parts(frame);
                self.socket = None;
                self.on_closed(code, reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("socket error: {e}");
                self.socket = None;
                let reason = e.to_string();
                self.emit(TransportEvent::ConnectionError(e.into()));
                self.on_closed(None, reason);
            }
            None => {
                self.socket = None;
                self.on_closed(None, "connection reset".into());
            }
        }
    }

    async fn on_binary(&mut self, bytes: Bytes) {
        self.stats.frames_received += 1;
        let decoded = match &self.offload {
            Some(offload) => offload.decode(bytes).await,
            None => self.codec.decode_frame(bytes).map_err(MdiError::from),
        };
        match decoded {
            Ok(frame) => self.on_message(frame),
            Err(e) => {
                self.stats.frames_rejected += 1;
                warn!("dropping frame: {e}");
                self.emit(TransportEvent::ProtocolError(e));
            }
        }
    }

    fn on_message(&mut self, frame: DecodedFrame) {
        let sequence = frame.sequence;
        let event = match frame.message {
            Message::SliceData(slice) => TransportEvent::SliceData { sequence, slice },
            Message::Metadata(metadata) => TransportEvent::Metadata { sequence, metadata },
            Message::Error(error) => TransportEvent::Error { sequence, error },
            Message::Heartbeat(heartbeat) => {
                self.refresh_liveness();
                self.heartbeat_tx.send_replace(Some(heartbeat));
                TransportEvent::Heartbeat {
                    sequence,
                    heartbeat,
                }
            }
            Message::Ack(payload) => TransportEvent::Ack { sequence, payload },
        };
        self.emit(event);
    }

    // ── Timers ───────────────────────────────────────────────────

    fn arm_timers(&mut self) {
        let now = Instant::now();
        self.liveness_deadline = self.config.heartbeat_timeout().map(|d| now + d);
        self.next_ping = self.config.ping_interval().map(|d| now + d);
    }

    fn clear_timers(&mut self) {
        self.liveness_deadline = None;
        self.next_ping = None;
    }

    fn refresh_liveness(&mut self) {
        if self.socket.is_some() {
            self.liveness_deadline = self.config.heartbeat_timeout().map(|d| Instant::now() + d);
        }
    }

    async fn on_liveness_timeout(&mut self) {
        warn!(
            timeout_ms = self.config.heartbeat_timeout_ms,
            "no heartbeat received; closing connection"
        );
        if let Some(mut ws) = self.socket.take() {
            let _ = ws.close(None).await;
        }
        self.on_closed(None, "heartbeat timeout".into());
    }

    async fn on_ping_due(&mut self) {
        self.next_ping = self.config.ping_interval().map(|d| Instant::now() + d);
        let Some(ws) = self.socket.as_mut() else {
            return;
        };
        let ping = match serde_json::to_string(&ClientRequest::Ping) {
            Ok(text) => text,
            Err(_) => return,
        };
        if let Err(e) = ws.send(WsMessage::text(ping)).await {
            warn!("ping failed: {e}");
            self.socket = None;
            self.emit(TransportEvent::ConnectionError(e.into()));
            self.on_closed(None, "ping failed".into());
        }
    }

    // ── Closing / reconnection ───────────────────────────────────

    /// The socket went away without `disconnect()`.
    fn on_closed(&mut self, code: Option<u16>, reason: String) {
        self.socket = None;
        self.clear_timers();
        info!(?code, %reason, "connection closed");
        self.emit(TransportEvent::Close {
            code,
            reason,
            manual: false,
        });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.config.auto_reconnect || self.suppressed {
            self.state.force_disconnect();
            self.publish_state();
            return;
        }
        if !self.policy.allows(self.attempts) {
            warn!(attempts = self.attempts, "reconnection attempts exhausted");
            self.emit(TransportEvent::ConnectionError(MdiError::ReconnectExhausted(
                self.attempts,
            )));
            let _ = self.state.fail();
            self.publish_state();
            return;
        }

        let delay = self.policy.delay(self.attempts);
        self.attempts += 1;
        if self.state.schedule_reconnect(self.attempts).is_err() {
            return;
        }
        self.reconnect_at = Some(Instant::now() + delay);
        info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.emit(TransportEvent::Reconnecting {
            attempt: self.attempts,
            delay,
        });
        self.publish_state();
    }

    async fn close_manually(&mut self) {
        self.suppressed = true;
        self.reconnect_at = None;
        self.connecting = None;
        self.clear_timers();
        self.attempts = 0;

        if let Some(mut ws) = self.socket.take() {
            let _ = ws.close(None).await;
            info!("disconnected");
            self.emit(TransportEvent::Close {
                code: Some(1000),
                reason: "client disconnect".into(),
                manual: true,
            });
        }
        if !self.state.is_disconnected() {
            self.state.force_disconnect();
            self.publish_state();
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

fn close_parts(frame: Option<CloseFrame>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
        None => (None, String::new()),
    }
}

async fn next_opt<F: Future + Unpin>(fut: &mut Option<F>) -> F::Output {
    match fut {
        Some(f) => f.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
