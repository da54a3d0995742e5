//! Retrying send pipeline.
//!
//! Every outbound frame of a session goes through [`SendPipeline::send_frame`]:
//! a bounded number of attempts, each under its own timeout, separated by a
//! fixed delay. Only transient failures are retried.
//!
//! A frame is handed to the sink once. After the sink has accepted it, later
//! attempts only flush, so a slow peer never receives the same frame twice.

use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hostlink_core::config::{MAX_MESSAGE_BYTES, MAX_SEND_ATTEMPTS, SEND_RETRY_DELAY, SEND_TIMEOUT};
use hostlink_core::{BridgeConfig, BridgeError};
use hostlink_protocol::ServerMessage;

/// Frames queued for a session's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// A protocol message.
    Message(ServerMessage),

    /// A heartbeat probe carrying its sequence number.
    Probe(u64),
}

/// The write half of a session's channel.
#[async_trait]
pub trait Outbound: Send {
    /// Hands `frame` to the sink without flushing.
    ///
    /// Once this returns `Ok` the sink owns the frame. If the future is
    /// dropped before completing, the frame was not accepted.
    async fn queue_frame(&mut self, frame: Message) -> Result<(), WsError>;

    /// Pushes queued frames to the peer.
    async fn flush(&mut self) -> Result<(), WsError> {
        Ok(())
    }

    /// Best-effort close. Errors are ignored.
    async fn close(&mut self) {}
}

#[async_trait]
impl<S> Outbound for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn queue_frame(&mut self, frame: Message) -> Result<(), WsError> {
        self.feed(frame).await
    }

    async fn flush(&mut self) -> Result<(), WsError> {
        SinkExt::flush(self).await
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

/// Retry and size limits for outbound frames.
#[derive(Debug, Clone, Copy)]
pub struct SendPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SEND_ATTEMPTS,
            retry_delay: SEND_RETRY_DELAY,
            attempt_timeout: SEND_TIMEOUT,
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }
}

impl SendPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_attempts: config.retry.max_send_attempts.max(1),
            retry_delay: config.retry.send_retry_delay(),
            attempt_timeout: config.timing.send_timeout(),
            max_message_bytes: config.network.max_message_bytes,
        }
    }
}

/// Errors returned by the send pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error("Message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Session is dead")]
    SessionDead,

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Send failed after {attempts} attempt(s): {reason}")]
    Exhausted { attempts: u32, reason: String },

    #[error("Failed to serialize message: {0}")]
    Serialize(String),
}

impl From<SendError> for BridgeError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::TooLarge { size, max } => BridgeError::MessageTooLarge { size, max },
            SendError::SessionDead => BridgeError::connection_lost("session is dead"),
            SendError::Closed(reason) => BridgeError::connection_lost(reason),
            SendError::Exhausted { attempts, reason } => {
                BridgeError::SendFailed { attempts, reason }
            }
            SendError::Serialize(reason) => BridgeError::handler(reason),
        }
    }
}

/// Returns true for failures worth another attempt.
fn is_transient(err: &WsError) -> bool {
    match err {
        WsError::Io(io) => matches!(
            io.kind(),
            IoErrorKind::Interrupted | IoErrorKind::WouldBlock | IoErrorKind::TimedOut
        ),
        _ => false,
    }
}

/// Bounded-retry, timed wrapper around a session's write half.
pub struct SendPipeline<O> {
    sink: O,
    policy: SendPolicy,
    dead: CancellationToken,
}

impl<O: Outbound> SendPipeline<O> {
    /// Creates a pipeline. Once `dead` is cancelled every send short-circuits.
    pub fn new(sink: O, policy: SendPolicy, dead: CancellationToken) -> Self {
        Self { sink, policy, dead }
    }

    pub fn policy(&self) -> &SendPolicy {
        &self.policy
    }

    /// Serializes and sends a protocol message as a text frame.
    pub async fn send_message(&mut self, msg: &ServerMessage) -> Result<u32, SendError> {
        let json = msg.to_json().map_err(|e| SendError::Serialize(e.to_string()))?;
        self.send_frame(Message::Text(json)).await
    }

    /// Sends one frame, returning the number of attempts it took.
    pub async fn send_frame(&mut self, frame: Message) -> Result<u32, SendError> {
        let size = frame.len();
        if size > self.policy.max_message_bytes {
            return Err(SendError::TooLarge {
                size,
                max: self.policy.max_message_bytes,
            });
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_failure = String::new();
        let mut pending = Some(frame);

        for attempt in 1..=max_attempts {
            if self.dead.is_cancelled() {
                return Err(SendError::SessionDead);
            }

            let sink = &mut self.sink;
            let pending_ref = &mut pending;
            let outcome = tokio::time::timeout(self.policy.attempt_timeout, async move {
                if let Some(frame) = pending_ref.clone() {
                    sink.queue_frame(frame).await?;
                    *pending_ref = None;
                }
                sink.flush().await
            })
            .await;

            match outcome {
                Ok(Ok(())) => return Ok(attempt),
                Ok(Err(e)) if is_transient(&e) => {
                    debug!(attempt, error = %e, "Transient send failure");
                    last_failure = e.to_string();
                }
                Ok(Err(e)) => return Err(SendError::Closed(e.to_string())),
                Err(_) => {
                    debug!(attempt, queued = pending.is_none(), "Send attempt timed out");
                    last_failure = format!(
                        "attempt timed out after {} ms",
                        self.policy.attempt_timeout.as_millis()
                    );
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        Err(SendError::Exhausted {
            attempts: max_attempts,
            reason: last_failure,
        })
    }

    pub async fn close(&mut self) {
        self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    enum Step {
        Ok,
        Interrupted,
        Closed,
        Hang,
    }

    impl Step {
        async fn run(self) -> Result<(), WsError> {
            match self {
                Step::Ok => Ok(()),
                Step::Interrupted => Err(WsError::Io(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "interrupted",
                ))),
                Step::Closed => Err(WsError::ConnectionClosed),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    /// Sink whose queue and flush calls follow a script.
    struct ScriptedSink {
        steps: VecDeque<Step>,
        flush_steps: VecDeque<Step>,
        attempts: Arc<AtomicU32>,
        flushes: Arc<AtomicU32>,
    }

    impl ScriptedSink {
        fn new(steps: Vec<Step>) -> (Self, Arc<AtomicU32>) {
            let (sink, attempts, _) = Self::with_flushes(steps, vec![]);
            (sink, attempts)
        }

        fn with_flushes(
            steps: Vec<Step>,
            flush_steps: Vec<Step>,
        ) -> (Self, Arc<AtomicU32>, Arc<AtomicU32>) {
            let attempts = Arc::new(AtomicU32::new(0));
            let flushes = Arc::new(AtomicU32::new(0));
            (
                Self {
                    steps: steps.into(),
                    flush_steps: flush_steps.into(),
                    attempts: Arc::clone(&attempts),
                    flushes: Arc::clone(&flushes),
                },
                attempts,
                flushes,
            )
        }
    }

    #[async_trait]
    impl Outbound for ScriptedSink {
        async fn queue_frame(&mut self, _frame: Message) -> Result<(), WsError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.steps.pop_front().unwrap_or(Step::Ok).run().await
        }

        async fn flush(&mut self) -> Result<(), WsError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.flush_steps.pop_front().unwrap_or(Step::Ok).run().await
        }
    }

    fn pipeline(steps: Vec<Step>) -> (SendPipeline<ScriptedSink>, Arc<AtomicU32>, CancellationToken) {
        let (sink, attempts) = ScriptedSink::new(steps);
        let dead = CancellationToken::new();
        (
            SendPipeline::new(sink, SendPolicy::default(), dead.clone()),
            attempts,
            dead,
        )
    }

    fn frame() -> Message {
        Message::Text("{\"type\":\"pong\",\"seq\":1}".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_transient_failures() {
        let (mut pipeline, attempts, _) =
            pipeline(vec![Step::Interrupted, Step::Interrupted, Step::Ok]);
        assert_eq!(pipeline.send_frame(frame()).await, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_three_failures() {
        let (mut pipeline, attempts, _) = pipeline(vec![
            Step::Interrupted,
            Step::Interrupted,
            Step::Interrupted,
            Step::Ok,
        ]);
        let err = pipeline.send_frame(frame()).await.unwrap_err();
        assert!(matches!(err, SendError::Exhausted { attempts: 3, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(BridgeError::from(err).kind().as_str(), "SendFailed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let (mut pipeline, attempts, _) = pipeline(vec![Step::Hang, Step::Ok]);
        let start = tokio::time::Instant::now();
        assert_eq!(pipeline.send_frame(frame()).await, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= SEND_TIMEOUT + SEND_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_closed_channel_is_fatal() {
        let (mut pipeline, attempts, _) = pipeline(vec![Step::Closed, Step::Ok]);
        let err = pipeline.send_frame(frame()).await.unwrap_err();
        assert!(matches!(err, SendError::Closed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_session_short_circuits() {
        let (mut pipeline, attempts, dead) = pipeline(vec![]);
        dead.cancel();
        assert_eq!(pipeline.send_frame(frame()).await, Err(SendError::SessionDead));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_sending() {
        let (sink, attempts) = ScriptedSink::new(vec![]);
        let policy = SendPolicy {
            max_message_bytes: 16,
            ..SendPolicy::default()
        };
        let mut pipeline = SendPipeline::new(sink, policy, CancellationToken::new());

        let err = pipeline
            .send_frame(Message::Text("x".repeat(17)))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::TooLarge { size: 17, max: 16 });
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_frame_is_only_flushed_on_retry() {
        let (sink, queued, flushes) =
            ScriptedSink::with_flushes(vec![Step::Ok], vec![Step::Hang, Step::Interrupted, Step::Ok]);
        let mut pipeline = SendPipeline::new(sink, SendPolicy::default(), CancellationToken::new());

        assert_eq!(pipeline.send_frame(frame()).await, Ok(3));
        assert_eq!(queued.load(Ordering::SeqCst), 1);
        assert_eq!(flushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_peer_receives_frame_once() {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::protocol::Role;

        let (server_io, client_io) = tokio::io::duplex(64);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let (sink, _stream) = server.split();

        let policy = SendPolicy {
            attempt_timeout: Duration::from_millis(50),
            ..SendPolicy::default()
        };
        let mut pipeline = SendPipeline::new(sink, policy, CancellationToken::new());

        // The peer only starts reading after the first attempt has timed out.
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let mut texts = 0;
            while let Some(Ok(msg)) = client.next().await {
                match msg {
                    Message::Text(_) => texts += 1,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            texts
        });

        let attempts = pipeline
            .send_frame(Message::Text("z".repeat(2000)))
            .await
            .unwrap();
        assert!(attempts > 1, "first attempt should have timed out");
        pipeline.close().await;

        let texts = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(texts, 1);
    }
}
