//! Per-session connection handling.
//!
//! Each upgraded connection gets a `ConnectionHandler` that runs four tasks:
//! - the reader (this task): parses frames and routes them
//! - a dispatch worker: runs requests one at a time, preserving order
//! - a writer: drains the outbound queue through the send pipeline
//! - a heartbeat monitor: probes the peer and declares death
//!
//! ```text
//!   socket ──▶ reader ──requests──▶ worker ──responses──┐
//!                │                                      ▼
//!                └──pongs──▶ heartbeat ──probes──▶ outbound queue ──▶ writer ──▶ socket
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel closure ends the owning task instead of failing
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hostlink_core::{BridgeConfig, BridgeError};
use hostlink_protocol::{ClientMessage, RequestEnvelope, ResponseEnvelope, ServerMessage};

use super::handshake::{HandshakeError, HandshakeSettings};
use super::heartbeat::{HeartbeatMonitor, HeartbeatOutcome};
use super::send::{Outbound, Outgoing, SendError, SendPipeline, SendPolicy};
use super::SessionId;
use crate::compilation::CompilationCoordinator;
use crate::dispatch::Dispatcher;

/// Outbound frames buffered per session
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Requests buffered per session ahead of the dispatch worker
const REQUEST_QUEUE_DEPTH: usize = 64;

/// Version reported in the welcome message
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-session limits derived from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub send: SendPolicy,
    pub handshake: HandshakeSettings,
}

impl SessionSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            heartbeat_interval: config.timing.heartbeat_interval(),
            heartbeat_timeout: config.timing.heartbeat_timeout(),
            send: SendPolicy::from_config(config),
            handshake: HandshakeSettings::from_config(config),
        }
    }
}

/// Transport-owned view of a live session.
pub struct SessionHandle {
    pub outbound: mpsc::Sender<Outgoing>,
    pub token: CancellationToken,
    pub connected_at: DateTime<Utc>,
}

/// Type alias for the live sessions table
pub type SessionsMap = Arc<RwLock<HashMap<SessionId, SessionHandle>>>;

/// Errors that end a session abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Heartbeat timed out")]
    HeartbeatTimeout,

    #[error("Send failed: {0}")]
    Send(#[from] SendError),
}

/// Connection handler for a single upgraded session.
pub struct ConnectionHandler<S> {
    ws: WebSocketStream<S>,
    session_id: SessionId,
    settings: Arc<SessionSettings>,
    dispatcher: Arc<Dispatcher>,
    coordinator: CompilationCoordinator,
    sessions: SessionsMap,
    token: CancellationToken,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a handler. Cancelling `token` tears the session down.
    pub fn new(
        ws: WebSocketStream<S>,
        session_id: SessionId,
        settings: Arc<SessionSettings>,
        dispatcher: Arc<Dispatcher>,
        coordinator: CompilationCoordinator,
        sessions: SessionsMap,
        token: CancellationToken,
    ) -> Self {
        Self {
            ws,
            session_id,
            settings,
            dispatcher,
            coordinator,
            sessions,
            token,
        }
    }

    /// Runs the session until the peer leaves, the heartbeat fails, or the
    /// server shuts down.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Self {
            ws,
            session_id,
            settings,
            dispatcher,
            coordinator,
            sessions,
            token,
        } = self;

        let dead = CancellationToken::new();
        let acks = Arc::new(Notify::new());
        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);

        sessions.write().await.insert(
            session_id.clone(),
            SessionHandle {
                outbound: out_tx.clone(),
                token: token.clone(),
                connected_at: Utc::now(),
            },
        );
        info!(session_id = %session_id, "Session established");

        let writer = tokio::spawn(write_loop(
            SendPipeline::new(sink, settings.send, dead.clone()),
            out_rx,
            coordinator,
            session_id.clone(),
            token.clone(),
        ));

        let heartbeat = tokio::spawn(
            HeartbeatMonitor::new(
                session_id.clone(),
                settings.heartbeat_interval,
                settings.heartbeat_timeout,
                Arc::clone(&acks),
                out_tx.clone(),
                token.clone(),
                dead.clone(),
            )
            .run(),
        );

        let worker = tokio::spawn(dispatch_loop(
            req_rx,
            out_tx.clone(),
            dispatcher,
            session_id.clone(),
            token.clone(),
        ));

        let reader = Reader {
            session_id: &session_id,
            requests: req_tx,
            outbound: out_tx,
            acks,
            token: &token,
            max_message_bytes: settings.send.max_message_bytes,
        };
        let mut result = reader.run(stream).await;

        token.cancel();
        let _ = worker.await;
        if let Ok(HeartbeatOutcome::Dead) = heartbeat.await {
            result = Err(ConnectionError::HeartbeatTimeout);
        }
        let _ = writer.await;

        sessions.write().await.remove(&session_id);

        match &result {
            Ok(()) => info!(session_id = %session_id, "Session closed"),
            Err(e) => info!(session_id = %session_id, error = %e, "Session closed"),
        }
        result
    }
}

/// Inbound half of a session.
struct Reader<'a> {
    session_id: &'a SessionId,
    requests: mpsc::Sender<RequestEnvelope>,
    outbound: mpsc::Sender<Outgoing>,
    acks: Arc<Notify>,
    token: &'a CancellationToken,
    max_message_bytes: usize,
}

/// Whether the reader keeps going after a frame.
enum Flow {
    Continue,
    Stop,
}

impl Reader<'_> {
    async fn run<S>(self, mut stream: SplitStream<WebSocketStream<S>>) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                frame = stream.next() => frame,
            };

            match frame {
                None | Some(Ok(Message::Close(_))) => {
                    debug!(session_id = %self.session_id, "Peer closed the connection");
                    return Ok(());
                }
                Some(Ok(Message::Text(text))) => {
                    if let Flow::Stop = self.on_text(&text).await {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let err = BridgeError::invalid_field("frame", "binary frames are not supported");
                    if let Flow::Stop = self.reply_error(None, &err).await {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Pong(_))) => self.acks.notify_one(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Err(WsError::Capacity(capacity))) => {
                    let (size, max) = match capacity {
                        CapacityError::MessageTooLong { size, max_size } => (size, max_size),
                        CapacityError::TooManyHeaders => (0, self.max_message_bytes),
                    };
                    warn!(session_id = %self.session_id, size, max, "Inbound message too large, closing session");
                    let _ = self
                        .reply_error(None, &BridgeError::MessageTooLarge { size, max })
                        .await;
                    return Err(ConnectionError::MessageTooLarge { size, max });
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(());
                }
                Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
            }
        }
    }

    async fn on_text(&self, text: &str) -> Flow {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Command(request)) => {
                debug!(
                    session_id = %self.session_id,
                    request_id = ?request.request_id,
                    command = %request.command,
                    "Received command"
                );
                tokio::select! {
                    _ = self.token.cancelled() => Flow::Stop,
                    sent = self.requests.send(request) => match sent {
                        Ok(()) => Flow::Continue,
                        Err(_) => Flow::Stop,
                    },
                }
            }
            Ok(ClientMessage::Ping { seq }) => self.queue(Outgoing::Message(ServerMessage::pong(seq))).await,
            Ok(ClientMessage::Pong { .. }) => {
                self.acks.notify_one();
                Flow::Continue
            }
            Err(e) => {
                let request_id = serde_json::from_str::<Value>(text).ok().and_then(|v| {
                    v.get("requestId").and_then(Value::as_str).map(str::to_string)
                });
                let err = BridgeError::invalid_field("message", e.to_string());
                self.reply_error(request_id, &err).await
            }
        }
    }

    async fn reply_error(&self, request_id: Option<String>, err: &BridgeError) -> Flow {
        let response = ResponseEnvelope::failure(request_id, err);
        self.queue(Outgoing::Message(ServerMessage::response(response)))
            .await
    }

    async fn queue(&self, item: Outgoing) -> Flow {
        tokio::select! {
            _ = self.token.cancelled() => Flow::Stop,
            sent = self.outbound.send(item) => match sent {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Stop,
            },
        }
    }
}

/// Runs requests one at a time so responses leave in request order.
async fn dispatch_loop(
    mut requests: mpsc::Receiver<RequestEnvelope>,
    outbound: mpsc::Sender<Outgoing>,
    dispatcher: Arc<Dispatcher>,
    session_id: SessionId,
    token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = token.cancelled() => break,
            next = requests.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let request_id = request.request_id.clone();
        let response = tokio::select! {
            _ = token.cancelled() => {
                warn!(
                    session_id = %session_id,
                    request_id = ?request_id,
                    "In-flight request abandoned: connection lost"
                );
                break;
            }
            response = dispatcher.handle(request, &session_id) => response,
        };

        if outbound
            .send(Outgoing::Message(ServerMessage::response(response)))
            .await
            .is_err()
        {
            break;
        }
    }

    requests.close();
    let lost = BridgeError::connection_lost("session closed before the request ran");
    while let Ok(request) = requests.try_recv() {
        warn!(
            session_id = %session_id,
            request_id = ?request.request_id,
            command = %request.command,
            kind = %lost.kind(),
            "Queued request dropped"
        );
    }
}

/// Drains the outbound queue through the send pipeline.
async fn write_loop<O: Outbound>(
    mut pipeline: SendPipeline<O>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    coordinator: CompilationCoordinator,
    session_id: SessionId,
    token: CancellationToken,
) {
    let welcome = ServerMessage::welcome(session_id.as_str(), SERVER_VERSION);
    if let Err(e) = pipeline.send_message(&welcome).await {
        warn!(session_id = %session_id, error = %e, "Failed to send welcome");
        token.cancel();
        return;
    }

    deliver_pending(&mut pipeline, &coordinator, &session_id).await;

    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = outgoing.recv() => item,
        };
        let Some(item) = item else { break };

        if let Err(e) = send_outgoing(&mut pipeline, item).await {
            error!(session_id = %session_id, error = %e, "Send failed, closing session");
            token.cancel();
            pipeline.close().await;
            return;
        }
    }

    // Flush what was queued before the session ended (e.g. a final error).
    while let Ok(item) = outgoing.try_recv() {
        if send_outgoing(&mut pipeline, item).await.is_err() {
            break;
        }
    }
    pipeline.close().await;
}

/// Hands a parked compilation response to this freshly handshaken session.
async fn deliver_pending<O: Outbound>(
    pipeline: &mut SendPipeline<O>,
    coordinator: &CompilationCoordinator,
    session_id: &SessionId,
) {
    let Some(pending) = coordinator.take_pending() else {
        return;
    };

    let msg = ServerMessage::response(pending.response().clone());
    match pipeline.send_message(&msg).await {
        Ok(_) => {
            debug!(session_id = %session_id, request_id = ?pending.request_id(), "Deferred response sent");
            coordinator.delivered(pending);
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Deferred response not delivered, keeping it parked");
            coordinator.repark(pending);
        }
    }
}

async fn send_outgoing<O: Outbound>(
    pipeline: &mut SendPipeline<O>,
    item: Outgoing,
) -> Result<(), SendError> {
    match item {
        Outgoing::Probe(seq) => pipeline
            .send_frame(Message::Ping(seq.to_be_bytes().to_vec()))
            .await
            .map(|_| ()),
        Outgoing::Message(msg) => match pipeline.send_message(&msg).await {
            Ok(_) => Ok(()),
            Err(SendError::TooLarge { size, max }) => {
                let ServerMessage::Response(response) = &msg else {
                    return Err(SendError::TooLarge { size, max });
                };
                warn!(request_id = ?response.request_id, size, max, "Response too large, replacing with error");
                let replacement = ResponseEnvelope::failure(
                    response.request_id.clone(),
                    &BridgeError::MessageTooLarge { size, max },
                );
                pipeline
                    .send_message(&ServerMessage::response(replacement))
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        },
    }
}
